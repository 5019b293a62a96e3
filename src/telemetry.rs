//! The telemetry downlink envelope and its event payloads.
//!
//! The ground chain stores telemetry packets back-to-back in `RAW*.bin`
//! files: a sync word, a type tag, the GCU time stamp, a rolling packet
//! counter, the payload length and a 16-bit payload checksum. The only
//! telemetry payload the merger has to look inside is the
//! [`MergedEvent`], which carries the TOF payload of one event next to
//! the tracker and other sub-detector blobs.

use std::fmt;
use std::str::FromStr;

use crate::errors::PacketError;
use crate::events::TofEvent;
use crate::packets::{PacketType, TofPacket};
use crate::wire::{self, TELEMETRY_SYNC};

/// Telemetry packet type tags as assigned by the flight computer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TelemetryPacketType {
    CommandEcho,
    CPUHousekeeping,
    PDUHousekeeping,
    TrackerHousekeeping,
    GPS,
    Tracker,
    TrackerDAQTempLeak,
    MergedEvent,
    InterestingEvent,
    AnyTofHK,
    BoringEvent,
    NoGapsTriggerEvent,
    Other(u8),
}

impl TelemetryPacketType {
    pub fn to_u8(self) -> u8 {
        match self {
            TelemetryPacketType::CommandEcho => 10,
            TelemetryPacketType::CPUHousekeeping => 30,
            TelemetryPacketType::PDUHousekeeping => 36,
            TelemetryPacketType::TrackerHousekeeping => 40,
            TelemetryPacketType::GPS => 50,
            TelemetryPacketType::Tracker => 80,
            TelemetryPacketType::TrackerDAQTempLeak => 81,
            TelemetryPacketType::MergedEvent => 90,
            TelemetryPacketType::InterestingEvent => 91,
            TelemetryPacketType::AnyTofHK => 92,
            TelemetryPacketType::BoringEvent => 93,
            TelemetryPacketType::NoGapsTriggerEvent => 94,
            TelemetryPacketType::Other(tag) => tag,
        }
    }

    /// Event-carrying packets: everything that can be joined on an
    /// event id.
    pub fn is_event(self) -> bool {
        matches!(
            self,
            TelemetryPacketType::MergedEvent
                | TelemetryPacketType::InterestingEvent
                | TelemetryPacketType::BoringEvent
                | TelemetryPacketType::NoGapsTriggerEvent
        )
    }

    /// Tracker science data; dropped by the merger.
    pub fn is_tracker(self) -> bool {
        matches!(
            self,
            TelemetryPacketType::Tracker | TelemetryPacketType::TrackerDAQTempLeak
        )
    }
}

impl From<u8> for TelemetryPacketType {
    fn from(tag: u8) -> Self {
        match tag {
            10 => TelemetryPacketType::CommandEcho,
            30 => TelemetryPacketType::CPUHousekeeping,
            36 => TelemetryPacketType::PDUHousekeeping,
            40 => TelemetryPacketType::TrackerHousekeeping,
            50 => TelemetryPacketType::GPS,
            80 => TelemetryPacketType::Tracker,
            81 => TelemetryPacketType::TrackerDAQTempLeak,
            90 => TelemetryPacketType::MergedEvent,
            91 => TelemetryPacketType::InterestingEvent,
            92 => TelemetryPacketType::AnyTofHK,
            93 => TelemetryPacketType::BoringEvent,
            94 => TelemetryPacketType::NoGapsTriggerEvent,
            other => TelemetryPacketType::Other(other),
        }
    }
}

impl fmt::Display for TelemetryPacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TelemetryPacketType::CommandEcho => "CommandEcho",
            TelemetryPacketType::CPUHousekeeping => "CPUHousekeeping",
            TelemetryPacketType::PDUHousekeeping => "PDUHousekeeping",
            TelemetryPacketType::TrackerHousekeeping => "TrackerHousekeeping",
            TelemetryPacketType::GPS => "GPS",
            TelemetryPacketType::Tracker => "Tracker",
            TelemetryPacketType::TrackerDAQTempLeak => "TrackerDAQTempLeak",
            TelemetryPacketType::MergedEvent => "MergedEvent",
            TelemetryPacketType::InterestingEvent => "InterestingEvent",
            TelemetryPacketType::AnyTofHK => "AnyTofHK",
            TelemetryPacketType::BoringEvent => "BoringEvent",
            TelemetryPacketType::NoGapsTriggerEvent => "NoGapsTriggerEvent",
            TelemetryPacketType::Other(tag) => return write!(f, "Telemetry({})", tag),
        };
        write!(f, "{}", name)
    }
}

impl FromStr for TelemetryPacketType {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ptype = match s {
            "CommandEcho" => TelemetryPacketType::CommandEcho,
            "CPUHousekeeping" => TelemetryPacketType::CPUHousekeeping,
            "PDUHousekeeping" => TelemetryPacketType::PDUHousekeeping,
            "TrackerHousekeeping" => TelemetryPacketType::TrackerHousekeeping,
            "GPS" => TelemetryPacketType::GPS,
            "Tracker" => TelemetryPacketType::Tracker,
            "TrackerDAQTempLeak" => TelemetryPacketType::TrackerDAQTempLeak,
            "MergedEvent" => TelemetryPacketType::MergedEvent,
            "InterestingEvent" => TelemetryPacketType::InterestingEvent,
            "AnyTofHK" => TelemetryPacketType::AnyTofHK,
            "BoringEvent" => TelemetryPacketType::BoringEvent,
            "NoGapsTriggerEvent" => TelemetryPacketType::NoGapsTriggerEvent,
            other => {
                let inner = other
                    .strip_prefix("Telemetry(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|tag| tag.parse::<u8>().ok());
                match inner {
                    Some(tag) => TelemetryPacketType::Other(tag),
                    None => {
                        return Err(PacketError::Decode {
                            context: "TelemetryPacketType",
                            reason: format!("unknown tag name {:?}", other),
                        })
                    }
                }
            }
        };
        Ok(ptype)
    }
}

/// Header of a telemetry packet.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryHeader {
    pub packet_type: TelemetryPacketType,
    /// Seconds since epoch, stamped by the ground computer unit.
    pub gcutime: u32,
    /// Rolling packet counter.
    pub packet_id: u16,
}

/// sync (2) + type (1) + gcutime (4) + counter (2) + length (2) + checksum (2)
pub const TELEMETRY_HEADER_SIZE: usize = 13;

/// The envelope of the telemetry stream.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryPacket {
    pub header: TelemetryHeader,
    pub payload: Vec<u8>,
    /// Stored payload checksum matched.
    pub checksum_ok: bool,
}

impl TelemetryPacket {
    pub fn new(packet_type: TelemetryPacketType, gcutime: u32, payload: Vec<u8>) -> Self {
        TelemetryPacket {
            header: TelemetryHeader {
                packet_type,
                gcutime,
                packet_id: 0,
            },
            payload,
            checksum_ok: true,
        }
    }

    pub fn packet_type(&self) -> TelemetryPacketType {
        self.header.packet_type
    }

    pub fn size(&self) -> usize {
        TELEMETRY_HEADER_SIZE + self.payload.len()
    }

    fn checksum(payload: &[u8]) -> u16 {
        payload
            .iter()
            .fold(0u16, |sum, &byte| sum.wrapping_add(byte as u16))
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(self.size());
        wire::put_u16(&mut stream, TELEMETRY_SYNC);
        stream.push(self.header.packet_type.to_u8());
        wire::put_u32(&mut stream, self.header.gcutime);
        wire::put_u16(&mut stream, self.header.packet_id);
        wire::put_u16(&mut stream, self.payload.len() as u16);
        wire::put_u16(&mut stream, Self::checksum(&self.payload));
        stream.extend_from_slice(&self.payload);
        stream
    }

    /// Decodes one telemetry packet at `*pos`, advancing on success.
    ///
    /// A checksum mismatch is recorded in
    /// [`TelemetryPacket::checksum_ok`], not an error; the merger decides
    /// whether to count and drop.
    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<TelemetryPacket, PacketError> {
        let mut cursor = *pos;
        let sync = wire::take_u16(stream, &mut cursor)?;
        if sync != TELEMETRY_SYNC {
            return Err(PacketError::MalformedHeader { found: sync });
        }
        let tag = wire::take_u8(stream, &mut cursor)?;
        let gcutime = wire::take_u32(stream, &mut cursor)?;
        let packet_id = wire::take_u16(stream, &mut cursor)?;
        let length = wire::take_u16(stream, &mut cursor)? as usize;
        let stored_checksum = wire::take_u16(stream, &mut cursor)?;
        wire::expect(stream, cursor, length)?;
        let payload = stream[cursor..cursor + length].to_vec();
        cursor += length;
        let checksum_ok = Self::checksum(&payload) == stored_checksum;
        *pos = cursor;
        Ok(TelemetryPacket {
            header: TelemetryHeader {
                packet_type: TelemetryPacketType::from(tag),
                gcutime,
                packet_id,
            },
            payload,
            checksum_ok,
        })
    }
}

impl fmt::Display for TelemetryPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<TelemetryPacket {} id {} gcutime {} [{} bytes]>",
            self.header.packet_type,
            self.header.packet_id,
            self.header.gcutime,
            self.payload.len()
        )
    }
}

const MERGED_EVENT_VERSION: u8 = 1;

/// The telemetry-side container of one event: the TOF payload packed as a
/// [`TofPacket`], plus tracker and other sub-detector blobs.
///
/// The TOF payload stays packed until [`MergedEvent::tof`] is called, so
/// scanning a telemetry stream for event ids never pays for waveform
/// decoding.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MergedEvent {
    pub version: u8,
    pub event_id: u32,
    pub flags: u8,
    /// One serialized TofPacket.
    pub tof_data: Vec<u8>,
    /// Opaque tracker payload.
    pub tracker_data: Vec<u8>,
    /// Other sub-detector payloads, carried verbatim.
    pub extra: Vec<u8>,
}

impl MergedEvent {
    pub fn new(event_id: u32) -> Self {
        MergedEvent {
            version: MERGED_EVENT_VERSION,
            event_id,
            flags: 0,
            tof_data: Vec::new(),
            tracker_data: Vec::new(),
            extra: Vec::new(),
        }
    }

    /// Builds a merged event around one TOF event.
    pub fn from_tof_event(event: &TofEvent) -> Self {
        use crate::packets::Packable;
        let mut merged = MergedEvent::new(event.event_id());
        merged.tof_data = event.pack().to_bytestream();
        merged
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(14 + self.tof_data.len() + self.tracker_data.len());
        stream.push(self.version);
        wire::put_u32(&mut stream, self.event_id);
        stream.push(self.flags);
        wire::put_u32(&mut stream, self.tof_data.len() as u32);
        stream.extend_from_slice(&self.tof_data);
        wire::put_u32(&mut stream, self.tracker_data.len() as u32);
        stream.extend_from_slice(&self.tracker_data);
        stream.extend_from_slice(&self.extra);
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let version = wire::take_u8(stream, pos)?;
        if version != MERGED_EVENT_VERSION {
            return Err(PacketError::Decode {
                context: "MergedEvent",
                reason: format!("unsupported version {}", version),
            });
        }
        let event_id = wire::take_u32(stream, pos)?;
        let flags = wire::take_u8(stream, pos)?;
        let tof_len = wire::take_u32(stream, pos)? as usize;
        wire::expect(stream, *pos, tof_len)?;
        let tof_data = stream[*pos..*pos + tof_len].to_vec();
        *pos += tof_len;
        let tracker_len = wire::take_u32(stream, pos)? as usize;
        wire::expect(stream, *pos, tracker_len)?;
        let tracker_data = stream[*pos..*pos + tracker_len].to_vec();
        *pos += tracker_len;
        let extra = stream[*pos..].to_vec();
        *pos = stream.len();
        Ok(MergedEvent {
            version,
            event_id,
            flags,
            tof_data,
            tracker_data,
            extra,
        })
    }

    /// Unpacks a merged event from a telemetry envelope. Only
    /// event-carrying packet types qualify.
    pub fn from_telemetry_packet(packet: &TelemetryPacket) -> Result<Self, PacketError> {
        if !packet.header.packet_type.is_event() {
            return Err(PacketError::UnexpectedTag {
                found: packet.header.packet_type.to_u8(),
                wanted: "MergedEvent",
            });
        }
        let mut pos = 0;
        MergedEvent::from_bytestream(&packet.payload, &mut pos)
    }

    /// Unpacks the TOF payload. This is the expensive call the merger
    /// avoids; it only needs [`MergedEvent::event_id`].
    pub fn tof(&self) -> Result<TofEvent, PacketError> {
        let mut pos = 0;
        let packet = TofPacket::from_bytestream(&self.tof_data, &mut pos)?;
        if packet.packet_type != PacketType::TofEvent {
            return Err(PacketError::UnexpectedTag {
                found: packet.packet_type.to_u8(),
                wanted: "TofEvent",
            });
        }
        TofEvent::from_tofpacket(&packet)
    }
}

impl fmt::Display for MergedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<MergedEvent ev {} tof {} bytes, tracker {} bytes>",
            self.event_id,
            self.tof_data.len(),
            self.tracker_data.len()
        )
    }
}

/// Extracts the TOF housekeeping packet wrapped inside an `AnyTofHK`
/// telemetry packet.
///
/// The flight computer forwards board sensor data to telemetry by
/// nesting the original [`TofPacket`] inside the telemetry payload;
/// this undoes that nesting. Returns `None` for other packet types and
/// undecodable payloads.
pub fn unpack_tof_housekeeping(packet: &TelemetryPacket) -> Option<TofPacket> {
    if packet.header.packet_type != TelemetryPacketType::AnyTofHK {
        return None;
    }
    let mut pos = 0;
    TofPacket::from_bytestream(&packet.payload, &mut pos).ok()
}

/// Error-checked unpack of a merged event from a telemetry packet.
///
/// Returns `None` for non-event packets, decode failures and merged
/// events whose TOF payload does not unpack.
pub fn safe_unpack_merged_event(packet: &TelemetryPacket) -> Option<MergedEvent> {
    if !packet.header.packet_type.is_event() {
        return None;
    }
    let merged = MergedEvent::from_telemetry_packet(packet).ok()?;
    merged.tof().ok()?;
    Some(merged)
}
