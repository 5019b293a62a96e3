//! Event-level data: readout board events, master trigger events and the
//! combined [`TofEvent`].
//!
//! The board blob layout is fixed by the RB firmware: a 36-byte header
//! with word-swapped composite fields, one trace block per active channel
//! (each sample a 16-bit word holding a 14-bit ADC value plus two parity
//! bits), the DRS4 stop cell, a packet CRC32 and the tail marker. CRC
//! failures do not abort the decode; they are recorded per channel and
//! per packet so that callers can decide between dropping and forwarding.

use std::fmt;

use crate::errors::PacketError;
use crate::packets::{Packable, PacketType, TofPacket};
use crate::waveform::Waveform;
use crate::wire::{self, CRC32, HEAD, TAIL};

/// Channels per readout board (8 paddle ends + 1 reference channel).
pub const NCHN: usize = 9;
/// Cells in the DRS4 ring buffer.
pub const NWORDS: usize = 1024;
/// Only the low 9 bits of the channel mask select channels.
pub const CHANNEL_MASK_BITS: u16 = 0x01FF;
/// ADC samples carry 14 bits of data; the upper 2 are parity.
const ADC_MASK: u16 = 0x3FFF;

/// Fixed part of the board blob in bytes, head through timestamp.
const RBEVENT_HEADER_SIZE: usize = 36;

/// The header block of a readout board event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RBEventHeader {
    /// Board status bits: bit 0 sync error, bit 1 DRS4 busy, bits 4-15
    /// FPGA temperature.
    pub status: u16,
    /// Trace length in cells minus one.
    pub roi: u16,
    /// Unique Zynq device DNA of the board.
    pub dna: u64,
    pub fw_hash: u16,
    /// Board id as configured in the FPGA.
    pub rb_id: u16,
    pub channel_mask: u16,
    /// MTB event id; the join key across streams.
    pub event_id: u32,
    pub dtap0: u16,
    pub dtap1: u16,
    /// 48-bit clock-cycle counter.
    pub timestamp: u64,
    /// DRS4 cell at which sampling stopped; rotates the calibration.
    pub stop_cell: u16,
}

impl RBEventHeader {
    pub fn new() -> Self {
        RBEventHeader {
            status: 0,
            roi: (NWORDS - 1) as u16,
            dna: 0,
            fw_hash: 0,
            rb_id: 0,
            channel_mask: 0,
            event_id: 0,
            dtap0: 0,
            dtap1: 0,
            timestamp: 0,
            stop_cell: 0,
        }
    }

    pub fn sync_error(&self) -> bool {
        self.status & 0x1 != 0
    }

    /// The DRS4 was busy when the trigger arrived (lost trigger).
    pub fn drs4_busy(&self) -> bool {
        self.status & 0x2 != 0
    }

    /// Raw 12-bit FPGA temperature reading.
    pub fn fpga_temp(&self) -> u16 {
        self.status >> 4
    }

    pub fn trace_length(&self) -> usize {
        self.roi as usize + 1
    }

    /// Channels selected by the mask, 0-indexed and ascending.
    pub fn channels(&self) -> Vec<u8> {
        (0..NCHN as u8)
            .filter(|ch| self.channel_mask & CHANNEL_MASK_BITS & (1 << ch) != 0)
            .collect()
    }

    pub fn n_channels(&self) -> usize {
        (self.channel_mask & CHANNEL_MASK_BITS).count_ones() as usize
    }
}

impl Default for RBEventHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RBEventHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<RBEventHeader RB {:02} ev {} mask {:#05x} stop cell {}>",
            self.rb_id, self.event_id, self.channel_mask, self.stop_cell
        )
    }
}

/// One triggered readout of a board: header plus up to nine waveforms.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RBEvent {
    pub header: RBEventHeader,
    pub waveforms: Vec<Waveform>,
    /// Stored packet CRC32 matched the bytes it covers.
    pub packet_crc_ok: bool,
}

impl RBEvent {
    pub fn new(header: RBEventHeader) -> Self {
        RBEvent {
            header,
            waveforms: Vec::new(),
            packet_crc_ok: true,
        }
    }

    pub fn event_id(&self) -> u32 {
        self.header.event_id
    }

    /// The raw trace of `channel` (0-indexed), if it was read out.
    pub fn get_channel_adc(&self, channel: u8) -> Option<&[u16]> {
        self.waveforms
            .iter()
            .find(|wf| wf.channel == channel)
            .map(|wf| wf.adc.as_slice())
    }

    /// True when the packet CRC and every channel CRC matched.
    pub fn crc_ok(&self) -> bool {
        self.packet_crc_ok && self.waveforms.iter().all(|wf| wf.crc_ok)
    }

    /// Decodes a board blob at `*pos`, advancing past its tail.
    ///
    /// Structural problems (markers, truncation, channel-count mismatch)
    /// fail the decode; CRC mismatches are recorded in
    /// [`RBEvent::packet_crc_ok`] and per-waveform [`Waveform::crc_ok`].
    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<RBEvent, PacketError> {
        let start = *pos;
        let mut cursor = start;

        let head = wire::take_u16(stream, &mut cursor)?;
        if head != HEAD {
            return Err(PacketError::MalformedHeader { found: head });
        }
        let mut header = RBEventHeader::new();
        header.status = wire::take_u16(stream, &mut cursor)?;
        let len_words = wire::take_u16(stream, &mut cursor)? as usize;
        let total_bytes = len_words * 2;
        header.roi = wire::take_u16(stream, &mut cursor)?;
        header.dna = wire::take_u64_swapped(stream, &mut cursor)?;
        header.fw_hash = wire::take_u16(stream, &mut cursor)?;
        header.rb_id = wire::take_u16(stream, &mut cursor)?;
        header.channel_mask = wire::take_u16(stream, &mut cursor)?;
        header.event_id = wire::take_u32_swapped(stream, &mut cursor)?;
        header.dtap0 = wire::take_u16(stream, &mut cursor)?;
        header.dtap1 = wire::take_u16(stream, &mut cursor)?;
        header.timestamp = wire::take_u48_swapped(stream, &mut cursor)?;

        let trace_len = header.trace_length();
        let expected_bytes =
            RBEVENT_HEADER_SIZE + header.n_channels() * (2 + trace_len * 2 + 4) + 8;
        if expected_bytes != total_bytes {
            return Err(PacketError::Decode {
                context: "RBEvent",
                reason: format!(
                    "length field says {} bytes, {} channel blocks of {} cells need {}",
                    total_bytes,
                    header.n_channels(),
                    trace_len,
                    expected_bytes
                ),
            });
        }
        wire::expect(stream, start, total_bytes)?;
        let tail_pos = start + total_bytes - 2;
        let tail = {
            let mut tpos = tail_pos;
            wire::take_u16(stream, &mut tpos)?
        };
        if tail != TAIL {
            return Err(PacketError::TailMismatch {
                found: tail,
                offset: tail_pos,
            });
        }

        let mut event = RBEvent::new(header);
        for _ in 0..event.header.n_channels() {
            let channel = wire::take_u16(stream, &mut cursor)? as u8;
            wire::expect(stream, cursor, trace_len * 2 + 4)?;
            let (adc, crc_ok) = decode_channel_samples(&stream[cursor..], trace_len)?;
            cursor += trace_len * 2 + 4;
            let mut wf = Waveform::new(
                event.header.rb_id as u8,
                channel,
                event.header.stop_cell,
                adc,
            );
            wf.crc_ok = crc_ok;
            event.waveforms.push(wf);
        }

        event.header.stop_cell = wire::take_u16(stream, &mut cursor)?;
        for wf in &mut event.waveforms {
            wf.stop_cell = event.header.stop_cell;
        }
        let crc_offset = cursor;
        let stored_crc = wire::take_u32_swapped(stream, &mut cursor)?;
        let computed_crc = CRC32.checksum(&stream[start..crc_offset]);
        event.packet_crc_ok = stored_crc == computed_crc;
        if !event.packet_crc_ok {
            log::debug!(
                "RB {:02} ev {}: packet CRC32 mismatch (stored {:#010x}, computed {:#010x})",
                event.header.rb_id,
                event.header.event_id,
                stored_crc,
                computed_crc
            );
        }
        // cursor now sits on the tail checked above
        *pos = tail_pos + 2;
        Ok(event)
    }

    /// Like [`RBEvent::from_bytestream`], but CRC mismatches fail the
    /// decode as well.
    pub fn from_bytestream_checked(stream: &[u8], pos: &mut usize) -> Result<RBEvent, PacketError> {
        let event = RBEvent::from_bytestream(stream, pos)?;
        if !event.crc_ok() {
            return Err(PacketError::Decode {
                context: "RBEvent",
                reason: String::from("packet or channel CRC32 mismatch"),
            });
        }
        Ok(event)
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let trace_len = self.header.trace_length();
        let channel_mask = self
            .waveforms
            .iter()
            .fold(0u16, |mask, wf| mask | (1 << wf.channel));
        let total_bytes = RBEVENT_HEADER_SIZE
            + self.waveforms.len() * (2 + trace_len * 2 + 4)
            + 2  // stop cell
            + 4  // crc32
            + 2; // tail

        let mut stream = Vec::with_capacity(total_bytes);
        wire::put_u16(&mut stream, HEAD);
        wire::put_u16(&mut stream, self.header.status);
        wire::put_u16(&mut stream, (total_bytes / 2) as u16);
        wire::put_u16(&mut stream, self.header.roi);
        wire::put_u64_swapped(&mut stream, self.header.dna);
        wire::put_u16(&mut stream, self.header.fw_hash);
        wire::put_u16(&mut stream, self.header.rb_id);
        wire::put_u16(&mut stream, channel_mask);
        wire::put_u32_swapped(&mut stream, self.header.event_id);
        wire::put_u16(&mut stream, self.header.dtap0);
        wire::put_u16(&mut stream, self.header.dtap1);
        wire::put_u48_swapped(&mut stream, self.header.timestamp);

        for wf in &self.waveforms {
            wire::put_u16(&mut stream, wf.channel as u16);
            let trace_start = stream.len();
            for i in 0..trace_len {
                let sample = wf.adc.get(i).copied().unwrap_or(0) & ADC_MASK;
                wire::put_u16(&mut stream, sample);
            }
            let crc = CRC32.checksum(&stream[trace_start..]);
            wire::put_u32_swapped(&mut stream, crc);
        }

        wire::put_u16(&mut stream, self.header.stop_cell);
        let crc = CRC32.checksum(&stream);
        wire::put_u32_swapped(&mut stream, crc);
        wire::put_u16(&mut stream, TAIL);
        stream
    }
}

impl Packable for RBEvent {
    const PACKET_TYPE: PacketType = PacketType::RBEvent;

    fn to_bytestream(&self) -> Vec<u8> {
        RBEvent::to_bytestream(self)
    }
}

impl fmt::Display for RBEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<RBEvent {} with {} channels>",
            self.header,
            self.waveforms.len()
        )
    }
}

/// Extracts `trace_len` 14-bit ADC samples from a channel trace block and
/// verifies the channel CRC32 that follows them.
///
/// `stream` must start at the first sample word and hold at least
/// `trace_len * 2 + 4` bytes. Returns the samples and whether the stored
/// CRC matched.
pub fn decode_channel_samples(
    stream: &[u8],
    trace_len: usize,
) -> Result<(Vec<u16>, bool), PacketError> {
    wire::expect(stream, 0, trace_len * 2 + 4)?;
    let mut adc = Vec::with_capacity(trace_len);
    let mut pos = 0;
    for _ in 0..trace_len {
        adc.push(wire::take_u16(stream, &mut pos)? & ADC_MASK);
    }
    let stored_crc = wire::take_u32_swapped(stream, &mut pos)?;
    let computed_crc = CRC32.checksum(&stream[..trace_len * 2]);
    Ok((adc, stored_crc == computed_crc))
}

/// One hit as aggregated by the master trigger: detector-system interface,
/// connector and LTB channel pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TriggerHit {
    pub dsi: u8,
    pub j: u8,
    pub ltb_channels: u8,
}

/// The authoritative trigger record for one event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MasterTriggerEvent {
    pub event_id: u32,
    /// 48-bit MTB clock-cycle counter.
    pub timestamp: u64,
    pub hits: Vec<TriggerHit>,
}

impl MasterTriggerEvent {
    pub fn new(event_id: u32) -> Self {
        MasterTriggerEvent {
            event_id,
            timestamp: 0,
            hits: Vec::new(),
        }
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(11 + 3 * self.hits.len());
        wire::put_u32(&mut stream, self.event_id);
        wire::put_u48_swapped(&mut stream, self.timestamp);
        stream.push(self.hits.len() as u8);
        for hit in &self.hits {
            stream.push(hit.dsi);
            stream.push(hit.j);
            stream.push(hit.ltb_channels);
        }
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let event_id = wire::take_u32(stream, pos)?;
        let timestamp = wire::take_u48_swapped(stream, pos)?;
        let n_hits = wire::take_u8(stream, pos)? as usize;
        let mut hits = Vec::with_capacity(n_hits);
        for _ in 0..n_hits {
            hits.push(TriggerHit {
                dsi: wire::take_u8(stream, pos)?,
                j: wire::take_u8(stream, pos)?,
                ltb_channels: wire::take_u8(stream, pos)?,
            });
        }
        Ok(MasterTriggerEvent {
            event_id,
            timestamp,
            hits,
        })
    }
}

impl Packable for MasterTriggerEvent {
    const PACKET_TYPE: PacketType = PacketType::MasterTrigger;

    fn to_bytestream(&self) -> Vec<u8> {
        MasterTriggerEvent::to_bytestream(self)
    }
}

impl fmt::Display for MasterTriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<MasterTriggerEvent ev {} with {} hits>",
            self.event_id,
            self.hits.len()
        )
    }
}

/// A reconstructed per-paddle hit, derived from the two channels reading
/// out the paddle ends. Empty until waveform analysis runs; stored with
/// f32 precision on the wire.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TofHit {
    pub paddle_id: u16,
    /// Constant-fraction time of the A-side pulse, ns.
    pub time_a: f64,
    /// Constant-fraction time of the B-side pulse, ns.
    pub time_b: f64,
    /// Pedestal-subtracted charge integral, A side.
    pub charge_a: f64,
    pub charge_b: f64,
    pub peak_a: f64,
    pub peak_b: f64,
}

fn put_hit(stream: &mut Vec<u8>, hit: &TofHit) {
    wire::put_u16(stream, hit.paddle_id);
    for value in [
        hit.time_a,
        hit.time_b,
        hit.charge_a,
        hit.charge_b,
        hit.peak_a,
        hit.peak_b,
    ] {
        wire::put_f32(stream, value as f32);
    }
}

fn take_hit(stream: &[u8], pos: &mut usize) -> Result<TofHit, PacketError> {
    let paddle_id = wire::take_u16(stream, pos)?;
    let mut values = [0.0f32; 6];
    for value in values.iter_mut() {
        *value = wire::take_f32(stream, pos)?;
    }
    Ok(TofHit {
        paddle_id,
        time_a: values[0] as f64,
        time_b: values[1] as f64,
        charge_a: values[2] as f64,
        charge_b: values[3] as f64,
        peak_a: values[4] as f64,
        peak_b: values[5] as f64,
    })
}

/// One trigger's full TOF payload: the master trigger event, the board
/// events it collected and (after reprocessing) the derived hits.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TofEvent {
    pub status: u8,
    pub mt_event: MasterTriggerEvent,
    pub rb_events: Vec<RBEvent>,
    /// Derived hit list, filled by waveform analysis.
    pub hits: Vec<TofHit>,
}

impl TofEvent {
    pub fn new(mt_event: MasterTriggerEvent) -> Self {
        TofEvent {
            status: 0,
            mt_event,
            rb_events: Vec::new(),
            hits: Vec::new(),
        }
    }

    pub fn event_id(&self) -> u32 {
        self.mt_event.event_id
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mte = self.mt_event.to_bytestream();
        let mut stream = Vec::with_capacity(5 + mte.len() + 26 * self.hits.len());
        stream.push(self.status);
        wire::put_u16(&mut stream, mte.len() as u16);
        stream.extend_from_slice(&mte);
        stream.push(self.rb_events.len() as u8);
        for rb_event in &self.rb_events {
            stream.extend(rb_event.to_bytestream());
        }
        stream.push(self.hits.len() as u8);
        for hit in &self.hits {
            put_hit(&mut stream, hit);
        }
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let status = wire::take_u8(stream, pos)?;
        let mte_len = wire::take_u16(stream, pos)? as usize;
        wire::expect(stream, *pos, mte_len)?;
        let mte_end = *pos + mte_len;
        let mt_event = MasterTriggerEvent::from_bytestream(&stream[..mte_end], pos)?;
        *pos = mte_end;
        let n_rb = wire::take_u8(stream, pos)? as usize;
        let mut rb_events = Vec::with_capacity(n_rb);
        for _ in 0..n_rb {
            rb_events.push(RBEvent::from_bytestream(stream, pos)?);
        }
        let n_hits = wire::take_u8(stream, pos)? as usize;
        let mut hits = Vec::with_capacity(n_hits);
        for _ in 0..n_hits {
            hits.push(take_hit(stream, pos)?);
        }
        Ok(TofEvent {
            status,
            mt_event,
            rb_events,
            hits,
        })
    }

    /// Reads just the event id out of a packed [`TofEvent`] payload,
    /// skipping waveform decoding entirely. The id sits at the head of
    /// the embedded master trigger block.
    pub fn peek_event_id(packet: &TofPacket) -> Result<u32, PacketError> {
        if packet.packet_type != PacketType::TofEvent {
            return Err(PacketError::UnexpectedTag {
                found: packet.packet_type.to_u8(),
                wanted: "TofEvent",
            });
        }
        let mut pos = 0;
        let _status = wire::take_u8(&packet.payload, &mut pos)?;
        let mte_len = wire::take_u16(&packet.payload, &mut pos)? as usize;
        if mte_len < 11 {
            return Err(PacketError::Decode {
                context: "TofEvent",
                reason: format!("master trigger block of {} bytes", mte_len),
            });
        }
        wire::expect(&packet.payload, pos, mte_len)?;
        wire::take_u32(&packet.payload, &mut pos)
    }

    /// Unpacks a [`TofEvent`] from its envelope.
    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        if packet.packet_type != PacketType::TofEvent {
            return Err(PacketError::UnexpectedTag {
                found: packet.packet_type.to_u8(),
                wanted: "TofEvent",
            });
        }
        let mut pos = 0;
        TofEvent::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Packable for TofEvent {
    const PACKET_TYPE: PacketType = PacketType::TofEvent;

    fn to_bytestream(&self) -> Vec<u8> {
        TofEvent::to_bytestream(self)
    }
}

impl fmt::Display for TofEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<TofEvent ev {} with {} RB events, {} hits>",
            self.event_id(),
            self.rb_events.len(),
            self.hits.len()
        )
    }
}

/// A compact event representation without waveforms: the trigger
/// information plus the derived hits. This is what goes to telemetry
/// when the full event does not fit the downlink budget of a pass.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TofEventSummary {
    pub status: u8,
    pub event_id: u32,
    /// Bit field of the contributing trigger sources.
    pub trigger_sources: u16,
    pub n_trigger_paddles: u8,
    /// 48-bit MTB clock-cycle counter.
    pub timestamp: u64,
    pub hits: Vec<TofHit>,
}

impl TofEventSummary {
    /// Condenses a full event, dropping the waveforms.
    pub fn from_tof_event(event: &TofEvent) -> Self {
        TofEventSummary {
            status: event.status,
            event_id: event.event_id(),
            trigger_sources: 0,
            n_trigger_paddles: event.mt_event.hits.len() as u8,
            timestamp: event.mt_event.timestamp,
            hits: event.hits.clone(),
        }
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(15 + 26 * self.hits.len());
        stream.push(self.status);
        wire::put_u32(&mut stream, self.event_id);
        wire::put_u16(&mut stream, self.trigger_sources);
        stream.push(self.n_trigger_paddles);
        wire::put_u48_swapped(&mut stream, self.timestamp);
        stream.push(self.hits.len() as u8);
        for hit in &self.hits {
            put_hit(&mut stream, hit);
        }
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let status = wire::take_u8(stream, pos)?;
        let event_id = wire::take_u32(stream, pos)?;
        let trigger_sources = wire::take_u16(stream, pos)?;
        let n_trigger_paddles = wire::take_u8(stream, pos)?;
        let timestamp = wire::take_u48_swapped(stream, pos)?;
        let n_hits = wire::take_u8(stream, pos)? as usize;
        let mut hits = Vec::with_capacity(n_hits);
        for _ in 0..n_hits {
            hits.push(take_hit(stream, pos)?);
        }
        Ok(TofEventSummary {
            status,
            event_id,
            trigger_sources,
            n_trigger_paddles,
            timestamp,
            hits,
        })
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        if packet.packet_type != PacketType::TofEventSummary {
            return Err(PacketError::UnexpectedTag {
                found: packet.packet_type.to_u8(),
                wanted: "TofEventSummary",
            });
        }
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Packable for TofEventSummary {
    const PACKET_TYPE: PacketType = PacketType::TofEventSummary;

    fn to_bytestream(&self) -> Vec<u8> {
        TofEventSummary::to_bytestream(self)
    }
}

impl fmt::Display for TofEventSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<TofEventSummary ev {} with {} hits>",
            self.event_id,
            self.hits.len()
        )
    }
}

/// A single channel trace broken out of its event, used when individual
/// waveforms are shipped instead of whole events.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RBWaveform {
    pub event_id: u32,
    pub rb_id: u8,
    pub channel: u8,
    pub stop_cell: u16,
    pub adc: Vec<u16>,
}

impl RBWaveform {
    /// Splits an event into its per-channel waveform packets.
    pub fn from_rb_event(event: &RBEvent) -> Vec<RBWaveform> {
        event
            .waveforms
            .iter()
            .map(|wf| RBWaveform {
                event_id: event.event_id(),
                rb_id: event.header.rb_id as u8,
                channel: wf.channel,
                stop_cell: event.header.stop_cell,
                adc: wf.adc.clone(),
            })
            .collect()
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(10 + 2 * self.adc.len());
        wire::put_u32(&mut stream, self.event_id);
        stream.push(self.rb_id);
        stream.push(self.channel);
        wire::put_u16(&mut stream, self.stop_cell);
        wire::put_u16(&mut stream, self.adc.len() as u16);
        for &sample in &self.adc {
            wire::put_u16(&mut stream, sample & ADC_MASK);
        }
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let event_id = wire::take_u32(stream, pos)?;
        let rb_id = wire::take_u8(stream, pos)?;
        let channel = wire::take_u8(stream, pos)?;
        let stop_cell = wire::take_u16(stream, pos)?;
        let n_samples = wire::take_u16(stream, pos)? as usize;
        let mut adc = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            adc.push(wire::take_u16(stream, pos)? & ADC_MASK);
        }
        Ok(RBWaveform {
            event_id,
            rb_id,
            channel,
            stop_cell,
            adc,
        })
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        if packet.packet_type != PacketType::RBWaveform {
            return Err(PacketError::UnexpectedTag {
                found: packet.packet_type.to_u8(),
                wanted: "RBWaveform",
            });
        }
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Packable for RBWaveform {
    const PACKET_TYPE: PacketType = PacketType::RBWaveform;

    fn to_bytestream(&self) -> Vec<u8> {
        RBWaveform::to_bytestream(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_rb_event(event_id: u32, rb_id: u16) -> RBEvent {
        let mut header = RBEventHeader::new();
        header.rb_id = rb_id;
        header.event_id = event_id;
        header.dna = 0x1122_3344_5566_7788;
        header.timestamp = 0x0000_00AB_CDEF_0123 & 0xFFFF_FFFF_FFFF;
        header.stop_cell = 41;
        header.roi = (NWORDS - 1) as u16;
        header.channel_mask = 0b0_0000_0011;
        let mut event = RBEvent::new(header);
        for ch in 0..2u8 {
            let adc: Vec<u16> = (0..NWORDS)
                .map(|i| ((i as u16).wrapping_mul(7).wrapping_add(ch as u16)) & 0x3FFF)
                .collect();
            event
                .waveforms
                .push(Waveform::new(rb_id as u8, ch, 41, adc));
        }
        event
    }

    #[test]
    fn rb_event_roundtrip() {
        let event = example_rb_event(1_000_042, 14);
        let stream = event.to_bytestream();
        let mut pos = 0;
        let decoded = RBEvent::from_bytestream(&stream, &mut pos).unwrap();
        assert_eq!(pos, stream.len());
        assert!(decoded.crc_ok());
        assert_eq!(decoded, event);
    }

    #[test]
    fn rb_event_extreme_event_ids() {
        for event_id in [0u32, u32::MAX] {
            let event = example_rb_event(event_id, 1);
            let stream = event.to_bytestream();
            let mut pos = 0;
            let decoded = RBEvent::from_bytestream(&stream, &mut pos).unwrap();
            assert_eq!(decoded.event_id(), event_id);
        }
    }

    #[test]
    fn channel_crc_flip_is_flagged_not_fatal() {
        let event = example_rb_event(7, 3);
        let mut stream = event.to_bytestream();
        // Flip one bit inside the first channel CRC32: it sits right
        // after the first trace block.
        let crc_pos = RBEVENT_HEADER_SIZE + 2 + NWORDS * 2;
        stream[crc_pos] ^= 0x01;

        let mut pos = 0;
        let decoded = RBEvent::from_bytestream(&stream, &mut pos).unwrap();
        assert!(!decoded.waveforms[0].crc_ok);
        assert!(decoded.waveforms[1].crc_ok);
        // the flipped byte is covered by the packet CRC as well
        assert!(!decoded.packet_crc_ok);
        assert!(RBEvent::from_bytestream_checked(&stream, &mut 0).is_err());
    }

    #[test]
    fn tail_mismatch_fails_decode() {
        let event = example_rb_event(7, 3);
        let mut stream = event.to_bytestream();
        let tail_pos = stream.len() - 2;
        stream[tail_pos] = 0x00;
        let mut pos = 0;
        match RBEvent::from_bytestream(&stream, &mut pos) {
            Err(PacketError::TailMismatch { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn stop_cell_boundaries_roundtrip() {
        for stop_cell in [0u16, (NWORDS - 1) as u16] {
            let mut event = example_rb_event(1, 1);
            event.header.stop_cell = stop_cell;
            for wf in &mut event.waveforms {
                wf.stop_cell = stop_cell;
            }
            let stream = event.to_bytestream();
            let decoded = RBEvent::from_bytestream(&stream, &mut 0).unwrap();
            assert_eq!(decoded.header.stop_cell, stop_cell);
        }
    }

    #[test]
    fn master_trigger_roundtrip() {
        let mut mte = MasterTriggerEvent::new(123_456);
        mte.timestamp = 0x0000_1234_5678_9ABC & 0xFFFF_FFFF_FFFF;
        mte.hits.push(TriggerHit {
            dsi: 1,
            j: 3,
            ltb_channels: 0b0011,
        });
        mte.hits.push(TriggerHit {
            dsi: 4,
            j: 0,
            ltb_channels: 0b1100,
        });
        let stream = mte.to_bytestream();
        let mut pos = 0;
        let decoded = MasterTriggerEvent::from_bytestream(&stream, &mut pos).unwrap();
        assert_eq!(decoded, mte);
        assert_eq!(pos, stream.len());
    }

    #[test]
    fn tof_event_roundtrip_through_packet() {
        let mut event = TofEvent::new(MasterTriggerEvent::new(99));
        event.rb_events.push(example_rb_event(99, 2));
        event.rb_events.push(example_rb_event(99, 5));
        let packet = event.pack();
        assert_eq!(packet.packet_type, PacketType::TofEvent);
        let decoded = TofEvent::from_tofpacket(&packet).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn peek_event_id_matches_full_decode() {
        let mut event = TofEvent::new(MasterTriggerEvent::new(3_333_333));
        event.rb_events.push(example_rb_event(3_333_333, 40));
        let packet = event.pack();
        assert_eq!(TofEvent::peek_event_id(&packet).unwrap(), 3_333_333);
    }

    #[test]
    fn summary_roundtrip_carries_hits() {
        let mut event = TofEvent::new(MasterTriggerEvent::new(808));
        event.mt_event.hits.push(TriggerHit {
            dsi: 2,
            j: 1,
            ltb_channels: 0b11,
        });
        event.hits.push(TofHit {
            paddle_id: 33,
            time_a: 101.5,
            time_b: 102.25,
            charge_a: 240.0,
            charge_b: 250.0,
            peak_a: 55.0,
            peak_b: 61.0,
        });
        let summary = TofEventSummary::from_tof_event(&event);
        assert_eq!(summary.n_trigger_paddles, 1);

        let decoded = TofEventSummary::from_tofpacket(&summary.pack()).unwrap();
        assert_eq!(decoded, summary);
        assert_eq!(decoded.hits[0].paddle_id, 33);
        // hit values survive the f32 wire precision for these inputs
        assert!((decoded.hits[0].time_b - 102.25).abs() < 1e-6);
    }

    #[test]
    fn rb_waveform_split_and_roundtrip() {
        let event = example_rb_event(64, 21);
        let waveforms = RBWaveform::from_rb_event(&event);
        assert_eq!(waveforms.len(), 2);
        for (wf, source) in waveforms.iter().zip(&event.waveforms) {
            assert_eq!(wf.event_id, 64);
            assert_eq!(wf.rb_id, 21);
            assert_eq!(wf.channel, source.channel);
            assert_eq!(wf.stop_cell, event.header.stop_cell);
        }
        let decoded = RBWaveform::from_tofpacket(&waveforms[1].pack()).unwrap();
        assert_eq!(decoded, waveforms[1]);
    }

    #[test]
    fn tof_event_rejects_wrong_tag() {
        let packet = TofPacket::new(PacketType::RBMoniData, vec![0; 4]);
        assert!(matches!(
            TofEvent::from_tofpacket(&packet),
            Err(PacketError::UnexpectedTag { .. })
        ));
    }
}
