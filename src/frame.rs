//! Frames: the merged output unit, and their append-only writer/reader.
//!
//! A frame bundles everything known about one event id under string
//! tags: the TOF packet, at most one telemetry merged-event packet and
//! any housekeeping that fell into the same interval. Tags stay strings
//! on disk for forward compatibility; in memory everything dispatches on
//! the packet-type enums and unknown tags ride along as opaque blobs.
//!
//! Frame files (`<run>_<subrun>.gaps`) are append-only and self
//! describing: each frame carries its own index of `(tag, offset,
//! length)` entries and a CRC32 over the whole record.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::errors::PacketError;
use crate::packets::TofPacket;
use crate::telemetry::{TelemetryPacket, TelemetryPacketType};
use crate::wire::{self, CRC32, HEAD, TAIL};

/// Event id used for frames that carry housekeeping only. The MTB event
/// counter starts at 1, so 0 is never a physics event.
pub const HOUSEKEEPING_EVENT_ID: u32 = 0;

/// One merged-output record: an event id and a tag-keyed set of blobs.
/// Insertion order is preserved on disk but carries no meaning.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub event_id: u32,
    entries: Vec<(String, Vec<u8>)>,
}

impl Frame {
    pub fn new(event_id: u32) -> Self {
        Frame {
            event_id,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(tag, _)| tag.as_str())
    }

    /// The blob stored under `tag`, if any.
    pub fn get(&self, tag: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, blob)| blob.as_slice())
    }

    pub fn put_blob(&mut self, tag: &str, blob: Vec<u8>) {
        self.entries.push((tag.to_string(), blob));
    }

    /// Stores a TOF packet under its type name.
    pub fn put_tofpacket(&mut self, packet: &TofPacket) {
        self.put_blob(&packet.packet_type.to_string(), packet.to_bytestream());
    }

    /// Stores a TOF packet under an explicit tag (e.g. a reprocessed
    /// event next to the original).
    pub fn put_tofpacket_tagged(&mut self, packet: &TofPacket, tag: &str) {
        self.put_blob(tag, packet.to_bytestream());
    }

    /// Stores a telemetry packet (envelope included) under its type name.
    pub fn put_telemetry(&mut self, packet: &TelemetryPacket) {
        self.put_blob(
            &packet.header.packet_type.to_string(),
            packet.to_bytestream(),
        );
    }

    /// True if the frame already holds a telemetry event payload. Used
    /// to uphold the at-most-one-merged-event invariant.
    pub fn has_telemetry_event(&self) -> bool {
        self.entries.iter().any(|(tag, _)| {
            tag.parse::<TelemetryPacketType>()
                .map_or(false, |ptype| ptype.is_event())
        })
    }

    /// Re-decodes the telemetry event payload, if present.
    pub fn telemetry_event(&self) -> Option<TelemetryPacket> {
        for (tag, blob) in &self.entries {
            if let Ok(ptype) = tag.parse::<TelemetryPacketType>() {
                if ptype.is_event() {
                    let mut pos = 0;
                    return TelemetryPacket::from_bytestream(blob, &mut pos).ok();
                }
            }
        }
        None
    }

    /// Re-decodes the TOF packet stored under `tag`.
    pub fn tofpacket(&self, tag: &str) -> Option<TofPacket> {
        let blob = self.get(tag)?;
        let mut pos = 0;
        TofPacket::from_bytestream(blob, &mut pos).ok()
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let index_size: usize = self
            .entries
            .iter()
            .map(|(tag, _)| 1 + tag.len() + 8)
            .sum();
        let blob_size: usize = self.entries.iter().map(|(_, blob)| blob.len()).sum();
        let mut stream = Vec::with_capacity(8 + index_size + blob_size + 6);

        wire::put_u16(&mut stream, HEAD);
        wire::put_u32(&mut stream, self.event_id);
        wire::put_u16(&mut stream, self.entries.len() as u16);
        let mut offset = 0u32;
        for (tag, blob) in &self.entries {
            stream.push(tag.len() as u8);
            stream.extend_from_slice(tag.as_bytes());
            wire::put_u32(&mut stream, offset);
            wire::put_u32(&mut stream, blob.len() as u32);
            offset += blob.len() as u32;
        }
        for (_, blob) in &self.entries {
            stream.extend_from_slice(blob);
        }
        let crc = CRC32.checksum(&stream);
        wire::put_u32_swapped(&mut stream, crc);
        wire::put_u16(&mut stream, TAIL);
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Frame, PacketError> {
        let start = *pos;
        let mut cursor = start;
        let head = wire::take_u16(stream, &mut cursor)?;
        if head != HEAD {
            return Err(PacketError::MalformedHeader { found: head });
        }
        let event_id = wire::take_u32(stream, &mut cursor)?;
        let n_entries = wire::take_u16(stream, &mut cursor)? as usize;
        let mut index = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            let tag_len = wire::take_u8(stream, &mut cursor)? as usize;
            wire::expect(stream, cursor, tag_len)?;
            let tag = String::from_utf8(stream[cursor..cursor + tag_len].to_vec()).map_err(
                |_| PacketError::Decode {
                    context: "Frame",
                    reason: String::from("tag is not UTF-8"),
                },
            )?;
            cursor += tag_len;
            let offset = wire::take_u32(stream, &mut cursor)? as usize;
            let length = wire::take_u32(stream, &mut cursor)? as usize;
            index.push((tag, offset, length));
        }
        let blobs_start = cursor;
        let blob_size: usize = index.iter().map(|(_, _, len)| len).sum();
        wire::expect(stream, blobs_start, blob_size + 6)?;
        let mut entries = Vec::with_capacity(n_entries);
        for (tag, offset, length) in index {
            if offset + length > blob_size {
                return Err(PacketError::Decode {
                    context: "Frame",
                    reason: format!("index entry {:?} outside blob region", tag),
                });
            }
            let blob = stream[blobs_start + offset..blobs_start + offset + length].to_vec();
            entries.push((tag, blob));
        }
        cursor = blobs_start + blob_size;
        let stored_crc = wire::take_u32_swapped(stream, &mut cursor)?;
        let computed_crc = CRC32.checksum(&stream[start..blobs_start + blob_size]);
        if stored_crc != computed_crc {
            return Err(PacketError::CrcMismatch {
                stored: stored_crc,
                computed: computed_crc,
            });
        }
        let tail = wire::take_u16(stream, &mut cursor)?;
        if tail != TAIL {
            return Err(PacketError::TailMismatch {
                found: tail,
                offset: cursor - 2,
            });
        }
        *pos = cursor;
        Ok(Frame { event_id, entries })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.tags().collect();
        write!(f, "<Frame ev {} [{}]>", self.event_id, tags.join(", "))
    }
}

/// Default subrun rotation threshold.
const DEFAULT_MAX_FILE_BYTES: u64 = 500 * 1024 * 1024;

/// Append-only writer producing `<run>_<subrun>.gaps` files.
pub struct FrameWriter {
    outdir: PathBuf,
    run_id: u32,
    subrun: u32,
    sink: Option<BufWriter<File>>,
    bytes_in_file: u64,
    max_file_bytes: u64,
    /// Frames appended over the writer's lifetime.
    pub frames_written: usize,
    written: Vec<PathBuf>,
}

impl FrameWriter {
    pub fn new<P: AsRef<Path>>(outdir: P, run_id: u32) -> std::io::Result<Self> {
        fs::create_dir_all(outdir.as_ref())?;
        Ok(FrameWriter {
            outdir: outdir.as_ref().to_path_buf(),
            run_id,
            subrun: 0,
            sink: None,
            bytes_in_file: 0,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            frames_written: 0,
            written: Vec::new(),
        })
    }

    pub fn with_max_file_bytes(mut self, max: u64) -> Self {
        self.max_file_bytes = max.max(1);
        self
    }

    fn subrun_path(&self) -> PathBuf {
        self.outdir
            .join(format!("{}_{}.gaps", self.run_id, self.subrun))
    }

    fn open_subrun(&mut self) -> std::io::Result<()> {
        let path = self.subrun_path();
        debug!("opening {}", path.display());
        let file = File::create(&path)?;
        self.sink = Some(BufWriter::new(file));
        self.bytes_in_file = 0;
        self.written.push(path);
        Ok(())
    }

    /// Appends one frame, rotating to the next subrun file when the
    /// current one is full.
    pub fn add_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        let stream = frame.to_bytestream();
        if self.sink.is_none() {
            self.open_subrun()?;
        } else if self.bytes_in_file > 0
            && self.bytes_in_file + stream.len() as u64 > self.max_file_bytes
        {
            self.finish_current()?;
            self.subrun += 1;
            self.open_subrun()?;
        }
        let sink = self.sink.as_mut().expect("sink opened above");
        sink.write_all(&stream)?;
        self.bytes_in_file += stream.len() as u64;
        self.frames_written += 1;
        Ok(())
    }

    fn finish_current(&mut self) -> std::io::Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush()?;
        }
        Ok(())
    }

    /// Flushes and closes the current subrun file, returning every path
    /// written by this writer.
    pub fn finalize(mut self) -> std::io::Result<Vec<PathBuf>> {
        self.finish_current()?;
        info!(
            "wrote {} frames into {} subrun files",
            self.frames_written,
            self.written.len()
        );
        Ok(std::mem::take(&mut self.written))
    }
}

/// Reads frames back from one `.gaps` file, resynchronising over
/// corrupt regions.
pub struct FrameReader {
    buffer: Vec<u8>,
    pos: usize,
    pub n_errors: usize,
}

impl FrameReader {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        Ok(FrameReader {
            buffer: fs::read(path)?,
            pos: 0,
            n_errors: 0,
        })
    }
}

impl Iterator for FrameReader {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let mut in_resync = false;
        while self.pos < self.buffer.len() {
            let mut cursor = self.pos;
            match Frame::from_bytestream(&self.buffer, &mut cursor) {
                Ok(frame) => {
                    self.pos = cursor;
                    return Some(frame);
                }
                Err(_) => {
                    if !in_resync {
                        self.n_errors += 1;
                        in_resync = true;
                        warn!("corrupt frame at byte {}, resynchronising", self.pos);
                    }
                    self.pos += 1;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::PacketType;

    fn example_frame(event_id: u32) -> Frame {
        let mut frame = Frame::new(event_id);
        frame.put_tofpacket(&TofPacket::new(PacketType::TofEvent, vec![1, 2, 3]));
        frame.put_telemetry(&TelemetryPacket::new(
            TelemetryPacketType::MergedEvent,
            1_722_000_000,
            vec![4, 5],
        ));
        frame.put_blob("something-custom", vec![6; 10]);
        frame
    }

    #[test]
    fn frame_roundtrip() {
        let frame = example_frame(1234);
        let stream = frame.to_bytestream();
        let mut pos = 0;
        let decoded = Frame::from_bytestream(&stream, &mut pos).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(pos, stream.len());
        assert!(decoded.has_telemetry_event());
        assert_eq!(decoded.get("TofEvent").unwrap().len(), 3 + 9);
    }

    #[test]
    fn frame_crc_detects_corruption() {
        let frame = example_frame(1);
        let mut stream = frame.to_bytestream();
        let middle = stream.len() / 2;
        stream[middle] ^= 0x40;
        assert!(Frame::from_bytestream(&stream, &mut 0).is_err());
    }

    #[test]
    fn writer_reader_roundtrip_with_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FrameWriter::new(dir.path(), 117)
            .unwrap()
            .with_max_file_bytes(200);
        for event_id in 0..10u32 {
            writer.add_frame(&example_frame(event_id)).unwrap();
        }
        let files = writer.finalize().unwrap();
        assert!(files.len() > 1, "small cap must force rotation");

        let mut event_ids = Vec::new();
        for path in &files {
            for frame in FrameReader::open(path).unwrap() {
                event_ids.push(frame.event_id);
            }
        }
        assert_eq!(event_ids, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn reader_survives_garbage_between_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("99_0.gaps");
        let mut stream = example_frame(7).to_bytestream();
        stream.extend_from_slice(&[0xBA, 0xD0]);
        stream.extend(example_frame(8).to_bytestream());
        fs::write(&path, stream).unwrap();

        let mut reader = FrameReader::open(&path).unwrap();
        let frames: Vec<_> = reader.by_ref().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(reader.n_errors, 1);
    }
}
