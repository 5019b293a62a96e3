//! The TOF packet envelope.
//!
//! Everything the TOF flight computer writes to disk is wrapped in a
//! [`TofPacket`]: a head marker, a one-byte type tag, a length-prefixed
//! payload and a tail marker. The payload bytes are opaque at this level;
//! typed views live in [`crate::events`], [`crate::calibration`] and
//! [`crate::moni`].

use std::fmt;
use std::str::FromStr;

use crate::errors::PacketError;
use crate::wire::{self, HEAD, TAIL};

/// Packet type tags as emitted by the TOF flight software.
///
/// Unknown tags decode to [`PacketType::Other`] so that the envelope can
/// be forwarded byte-preserving; they are never an error at this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PacketType {
    Unknown,
    RBEvent,
    TofEvent,
    RBWaveform,
    TofEventSummary,
    MasterTrigger,
    MTBHeartbeat,
    EVTBLDRHeartbeat,
    RBMoniData,
    PBMoniData,
    LTBMoniData,
    PAMoniData,
    MtbMoniData,
    CPUMoniData,
    RBCalibration,
    /// A tag outside the enumerated set, carried verbatim.
    Other(u8),
}

impl PacketType {
    pub fn to_u8(self) -> u8 {
        match self {
            PacketType::Unknown => 0,
            PacketType::RBEvent => 20,
            PacketType::TofEvent => 21,
            PacketType::RBWaveform => 22,
            PacketType::TofEventSummary => 23,
            PacketType::MasterTrigger => 60,
            PacketType::MTBHeartbeat => 61,
            PacketType::EVTBLDRHeartbeat => 62,
            PacketType::RBMoniData => 80,
            PacketType::PBMoniData => 81,
            PacketType::LTBMoniData => 82,
            PacketType::PAMoniData => 83,
            PacketType::MtbMoniData => 90,
            PacketType::CPUMoniData => 100,
            PacketType::RBCalibration => 120,
            PacketType::Other(tag) => tag,
        }
    }
}

impl From<u8> for PacketType {
    fn from(tag: u8) -> Self {
        match tag {
            0 => PacketType::Unknown,
            20 => PacketType::RBEvent,
            21 => PacketType::TofEvent,
            22 => PacketType::RBWaveform,
            23 => PacketType::TofEventSummary,
            60 => PacketType::MasterTrigger,
            61 => PacketType::MTBHeartbeat,
            62 => PacketType::EVTBLDRHeartbeat,
            80 => PacketType::RBMoniData,
            81 => PacketType::PBMoniData,
            82 => PacketType::LTBMoniData,
            83 => PacketType::PAMoniData,
            90 => PacketType::MtbMoniData,
            100 => PacketType::CPUMoniData,
            120 => PacketType::RBCalibration,
            other => PacketType::Other(other),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Unknown => "Unknown",
            PacketType::RBEvent => "RBEvent",
            PacketType::TofEvent => "TofEvent",
            PacketType::RBWaveform => "RBWaveform",
            PacketType::TofEventSummary => "TofEventSummary",
            PacketType::MasterTrigger => "MasterTrigger",
            PacketType::MTBHeartbeat => "MTBHeartbeat",
            PacketType::EVTBLDRHeartbeat => "EVTBLDRHeartbeat",
            PacketType::RBMoniData => "RBMoniData",
            PacketType::PBMoniData => "PBMoniData",
            PacketType::LTBMoniData => "LTBMoniData",
            PacketType::PAMoniData => "PAMoniData",
            PacketType::MtbMoniData => "MtbMoniData",
            PacketType::CPUMoniData => "CPUMoniData",
            PacketType::RBCalibration => "RBCalibration",
            PacketType::Other(tag) => return write!(f, "Other({})", tag),
        };
        write!(f, "{}", name)
    }
}

impl FromStr for PacketType {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ptype = match s {
            "Unknown" => PacketType::Unknown,
            "RBEvent" => PacketType::RBEvent,
            "TofEvent" => PacketType::TofEvent,
            "RBWaveform" => PacketType::RBWaveform,
            "TofEventSummary" => PacketType::TofEventSummary,
            "MasterTrigger" => PacketType::MasterTrigger,
            "MTBHeartbeat" => PacketType::MTBHeartbeat,
            "EVTBLDRHeartbeat" => PacketType::EVTBLDRHeartbeat,
            "RBMoniData" => PacketType::RBMoniData,
            "PBMoniData" => PacketType::PBMoniData,
            "LTBMoniData" => PacketType::LTBMoniData,
            "PAMoniData" => PacketType::PAMoniData,
            "MtbMoniData" => PacketType::MtbMoniData,
            "CPUMoniData" => PacketType::CPUMoniData,
            "RBCalibration" => PacketType::RBCalibration,
            other => {
                let inner = other
                    .strip_prefix("Other(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|tag| tag.parse::<u8>().ok());
                match inner {
                    Some(tag) => PacketType::Other(tag),
                    None => {
                        return Err(PacketError::Decode {
                            context: "PacketType",
                            reason: format!("unknown tag name {:?}", other),
                        })
                    }
                }
            }
        };
        Ok(ptype)
    }
}

/// The envelope for everything in the TOF-local stream.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TofPacket {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

/// head (2) + type (1) + payload size (4) .. payload .. tail (2)
const ENVELOPE_OVERHEAD: usize = 9;

impl TofPacket {
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        TofPacket {
            packet_type,
            payload,
        }
    }

    /// Total serialized size in bytes.
    pub fn size(&self) -> usize {
        ENVELOPE_OVERHEAD + self.payload.len()
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(self.size());
        wire::put_u16(&mut stream, HEAD);
        stream.push(self.packet_type.to_u8());
        wire::put_u32(&mut stream, self.payload.len() as u32);
        stream.extend_from_slice(&self.payload);
        wire::put_u16(&mut stream, TAIL);
        stream
    }

    /// Decodes one envelope at `*pos`, advancing `*pos` past its tail on
    /// success. On failure `*pos` is left untouched so a scanner can
    /// resynchronise byte-wise.
    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<TofPacket, PacketError> {
        let mut cursor = *pos;
        let head = wire::take_u16(stream, &mut cursor)?;
        if head != HEAD {
            return Err(PacketError::MalformedHeader { found: head });
        }
        let tag = wire::take_u8(stream, &mut cursor)?;
        let psize = wire::take_u32(stream, &mut cursor)? as usize;
        wire::expect(stream, cursor, psize + 2)?;
        let payload = stream[cursor..cursor + psize].to_vec();
        cursor += psize;
        let tail = wire::take_u16(stream, &mut cursor)?;
        if tail != TAIL {
            return Err(PacketError::TailMismatch {
                found: tail,
                offset: cursor - 2,
            });
        }
        *pos = cursor;
        Ok(TofPacket {
            packet_type: PacketType::from(tag),
            payload,
        })
    }
}

impl fmt::Display for TofPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<TofPacket {} [{} bytes]>",
            self.packet_type,
            self.payload.len()
        )
    }
}

/// Anything that can pack itself into a [`TofPacket`].
pub trait Packable {
    const PACKET_TYPE: PacketType;

    fn to_bytestream(&self) -> Vec<u8>;

    fn pack(&self) -> TofPacket {
        TofPacket::new(Self::PACKET_TYPE, self.to_bytestream())
    }
}

/// Forward scan over a byte buffer for valid [`TofPacket`] envelopes.
///
/// The scanner advances one byte at a time while no valid envelope starts
/// at the cursor; a successful packet contributes its full byte count to
/// the next advance. Malformed regions are skipped silently, their extent
/// is available through [`Scanner::bytes_skipped`].
pub struct Scanner<'a> {
    stream: &'a [u8],
    pos: usize,
    skipped: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Scanner {
            stream,
            pos: 0,
            skipped: 0,
        }
    }

    /// Bytes discarded so far while resynchronising.
    pub fn bytes_skipped(&self) -> usize {
        self.skipped
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Scanner<'a> {
    /// `(offset, serialized length, tag)` of each valid envelope.
    type Item = (usize, usize, PacketType);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos + ENVELOPE_OVERHEAD <= self.stream.len() {
            let offset = self.pos;
            let mut cursor = offset;
            match TofPacket::from_bytestream(self.stream, &mut cursor) {
                Ok(packet) => {
                    self.pos = cursor;
                    return Some((offset, cursor - offset, packet.packet_type));
                }
                Err(_) => {
                    self.pos += 1;
                    self.skipped += 1;
                }
            }
        }
        None
    }
}

/// Convenience wrapper: fully decode every valid packet in `stream`.
pub fn get_tofpackets(stream: &[u8]) -> Vec<TofPacket> {
    let mut packets = Vec::new();
    for (offset, _, _) in Scanner::new(stream) {
        let mut pos = offset;
        if let Ok(packet) = TofPacket::from_bytestream(stream, &mut pos) {
            packets.push(packet);
        }
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_packet() -> TofPacket {
        TofPacket::new(PacketType::TofEvent, vec![1, 2, 3, 4, 5])
    }

    #[test]
    fn envelope_roundtrip() {
        let packet = example_packet();
        let stream = packet.to_bytestream();
        let mut pos = 0;
        let decoded = TofPacket::from_bytestream(&stream, &mut pos).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(pos, stream.len());
    }

    #[test]
    fn unknown_tag_is_preserved() {
        let packet = TofPacket::new(PacketType::Other(213), vec![0xFF; 3]);
        let stream = packet.to_bytestream();
        let mut pos = 0;
        let decoded = TofPacket::from_bytestream(&stream, &mut pos).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Other(213));
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn tag_names_roundtrip() {
        for tag in 0..=255u8 {
            let ptype = PacketType::from(tag);
            let parsed: PacketType = ptype.to_string().parse().unwrap();
            assert_eq!(parsed.to_u8(), ptype.to_u8());
        }
    }

    #[test]
    fn scanner_skips_garbage() {
        let mut stream = vec![0xAA, 0x00, 0x13, 0x37]; // looks headish, is not
        let first = example_packet();
        let second = TofPacket::new(PacketType::RBMoniData, vec![9; 7]);
        stream.extend(first.to_bytestream());
        stream.extend([0xDE, 0xAD]);
        stream.extend(second.to_bytestream());

        let found: Vec<_> = Scanner::new(&stream).collect();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].2, PacketType::TofEvent);
        assert_eq!(found[1].2, PacketType::RBMoniData);
        assert_eq!(found[0].0, 4);
    }

    #[test]
    fn scanner_empty_input() {
        assert_eq!(Scanner::new(&[]).count(), 0);
    }

    #[test]
    fn truncated_envelope_is_not_yielded() {
        let stream = example_packet().to_bytestream();
        let cut = &stream[..stream.len() - 3];
        assert_eq!(Scanner::new(cut).count(), 0);
    }
}
