//! File-level access to the two input streams.
//!
//! The TOF CPU writes `Run<R>_<S>.<YYMMDD_HHMMSS>UTC.tof.gaps` files of
//! back-to-back [`TofPacket`]s; the ground chain writes
//! `RAW<YYMMDD_HHMMSS>.bin` files of back-to-back
//! [`TelemetryPacket`]s. Readers here stream packets lazily from an
//! ordered list of such files, resynchronise over malformed regions,
//! optionally filter by type without decoding payloads, and maintain a
//! cached per-tag index.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, info, warn};
use regex::Regex;

use crate::errors::PacketError;
use crate::packets::{PacketType, TofPacket};
use crate::telemetry::{TelemetryPacket, TelemetryPacketType, TELEMETRY_HEADER_SIZE};
use crate::wire::{self, HEAD, TAIL, TELEMETRY_SYNC};

/// Extracts the UTC timestamp embedded in a data file name.
///
/// Both file families carry a `YYMMDD_HHMMSS` stamp:
/// `Run117_3.240712_094325UTC.tof.gaps` and `RAW240712_094325.bin`. The
/// stamp is used for ordering only; file contents are never consulted.
pub fn get_ts_from_filename<P: AsRef<Path>>(path: P) -> Option<DateTime<Utc>> {
    let name = path.as_ref().file_name()?.to_str()?;
    let tof = Regex::new(r"Run\d+_\d+\.(\d{6}_\d{6})UTC").expect("static regex");
    let telemetry = Regex::new(r"RAW(\d{6}_\d{6})\.bin").expect("static regex");
    let stamp = tof
        .captures(name)
        .or_else(|| telemetry.captures(name))?
        .get(1)?
        .as_str();
    let naive = NaiveDateTime::parse_from_str(stamp, "%y%m%d_%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

fn sorted_by_filename_ts(mut files: Vec<PathBuf>) -> Vec<PathBuf> {
    files.sort_by_key(|f| get_ts_from_filename(f));
    files
}

/// TOF data files of one run, sorted by their filename timestamp.
///
/// Expects the usual on-disk layout of one directory per run id below
/// `data_dir`, holding the subrun `.tof.gaps` files.
pub fn get_tof_binaries<P: AsRef<Path>>(data_dir: P, run_id: u32) -> std::io::Result<Vec<PathBuf>> {
    let run_dir = data_dir.as_ref().join(run_id.to_string());
    let mut files = Vec::new();
    for entry in fs::read_dir(&run_dir)? {
        let path = entry?.path();
        if path.to_string_lossy().ends_with(".tof.gaps") {
            files.push(path);
        }
    }
    let files = sorted_by_filename_ts(files);
    info!("found {} files for run {}", files.len(), run_id);
    Ok(files)
}

/// Telemetry `RAW*.bin` files whose filename timestamp falls into the
/// given gcutime window, sorted by that timestamp.
pub fn get_telemetry_binaries<P: AsRef<Path>>(
    data_dir: P,
    start_time: Option<u32>,
    end_time: Option<u32>,
) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(data_dir.as_ref())? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "bin") {
            files.push(path);
        }
    }
    let files = sorted_by_filename_ts(files);
    let start = start_time.map(|t| Utc.timestamp_opt(t as i64, 0).unwrap());
    let end = end_time.map(|t| Utc.timestamp_opt(t as i64, 0).unwrap());
    let selected: Vec<PathBuf> = files
        .into_iter()
        .filter(|f| match get_ts_from_filename(f) {
            Some(ts) => start.map_or(true, |s| ts >= s) && end.map_or(true, |e| ts <= e),
            None => false,
        })
        .collect();
    info!(
        "found {} telemetry files within the requested window",
        selected.len()
    );
    Ok(selected)
}

/// Sorted event ids compared against a gap-free sequence over the same
/// range. Returns `(found, expected, missing fraction)`.
pub fn check_missing_events(event_ids: &[u32]) -> (usize, usize, f64) {
    if event_ids.is_empty() {
        return (0, 0, 0.0);
    }
    let first = *event_ids.first().unwrap() as usize;
    let last = *event_ids.last().unwrap() as usize;
    let expected = last.saturating_sub(first) + 1;
    let missing = expected.saturating_sub(event_ids.len());
    (event_ids.len(), expected, missing as f64 / expected as f64)
}

/// Validates the envelope at `pos` and returns `(tag, total size)`
/// without copying the payload.
fn skim_tofpacket(stream: &[u8], pos: usize) -> Result<(PacketType, usize), PacketError> {
    let mut cursor = pos;
    let head = wire::take_u16(stream, &mut cursor)?;
    if head != HEAD {
        return Err(PacketError::MalformedHeader { found: head });
    }
    let tag = wire::take_u8(stream, &mut cursor)?;
    let psize = wire::take_u32(stream, &mut cursor)? as usize;
    wire::expect(stream, cursor, psize + 2)?;
    cursor += psize;
    let tail = wire::take_u16(stream, &mut cursor)?;
    if tail != TAIL {
        return Err(PacketError::TailMismatch {
            found: tail,
            offset: cursor - 2,
        });
    }
    Ok((PacketType::from(tag), cursor - pos))
}

/// As [`skim_tofpacket`], for the telemetry envelope.
fn skim_telemetry(stream: &[u8], pos: usize) -> Result<(TelemetryPacketType, usize), PacketError> {
    let mut cursor = pos;
    let sync = wire::take_u16(stream, &mut cursor)?;
    if sync != TELEMETRY_SYNC {
        return Err(PacketError::MalformedHeader { found: sync });
    }
    let tag = wire::take_u8(stream, &mut cursor)?;
    let _gcutime = wire::take_u32(stream, &mut cursor)?;
    let _counter = wire::take_u16(stream, &mut cursor)?;
    let length = wire::take_u16(stream, &mut cursor)? as usize;
    let _checksum = wire::take_u16(stream, &mut cursor)?;
    wire::expect(stream, cursor, length)?;
    Ok((
        TelemetryPacketType::from(tag),
        TELEMETRY_HEADER_SIZE + length,
    ))
}

/// Per-tag packet counts over a file list.
#[derive(Debug, Default, Clone)]
pub struct PacketIndex {
    pub counts: HashMap<u8, usize>,
}

impl PacketIndex {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

const INDEX_MAGIC: &str = "# tof-gaps packet index v1";

fn read_index_sidecar(data_file: &Path) -> Option<HashMap<u8, usize>> {
    let sidecar = sidecar_path(data_file);
    let data_mtime = fs::metadata(data_file).and_then(|m| m.modified()).ok()?;
    let sidecar_meta = fs::metadata(&sidecar).ok()?;
    if sidecar_meta.modified().ok()? < data_mtime {
        return None;
    }
    let content = fs::read_to_string(&sidecar).ok()?;
    let mut lines = content.lines();
    if lines.next() != Some(INDEX_MAGIC) {
        return None;
    }
    let mut counts = HashMap::new();
    for line in lines {
        let mut fields = line.split_whitespace();
        let tag: u8 = fields.next()?.parse().ok()?;
        let count: usize = fields.next()?.parse().ok()?;
        counts.insert(tag, count);
    }
    Some(counts)
}

fn write_index_sidecar(data_file: &Path, counts: &HashMap<u8, usize>) {
    let mut out = String::from(INDEX_MAGIC);
    out.push('\n');
    let mut tags: Vec<_> = counts.iter().collect();
    tags.sort();
    for (tag, count) in tags {
        out.push_str(&format!("{} {}\n", tag, count));
    }
    // best effort: a read-only data directory is not an error
    if let Err(error) = fs::write(sidecar_path(data_file), out) {
        debug!(
            "cannot write index sidecar next to {}: {}",
            data_file.display(),
            error
        );
    }
}

fn sidecar_path(data_file: &Path) -> PathBuf {
    let mut name = data_file.as_os_str().to_os_string();
    name.push(".idx");
    PathBuf::from(name)
}

/// Streams [`TofPacket`]s from an ordered list of files.
///
/// Iteration yields decoded packets; malformed regions are skipped by
/// advancing one byte at a time and counted in
/// [`TofPacketReader::n_errors`]. An optional type filter skips
/// non-matching packets without decoding beyond the tag, still advancing
/// the cursor by the full packet length.
pub struct TofPacketReader {
    files: Vec<PathBuf>,
    file_index: usize,
    buffer: Vec<u8>,
    pos: usize,
    in_resync: bool,
    filter: Option<HashSet<u8>>,
    /// Resynchronisation events over malformed regions.
    pub n_errors: usize,
    /// Bytes discarded while resynchronising.
    pub bytes_skipped: usize,
    index: Option<PacketIndex>,
    first: Option<TofPacket>,
    last: Option<TofPacket>,
}

impl TofPacketReader {
    pub fn new(files: Vec<PathBuf>) -> Self {
        TofPacketReader {
            files,
            file_index: 0,
            buffer: Vec::new(),
            pos: 0,
            in_resync: false,
            filter: None,
            n_errors: 0,
            bytes_skipped: 0,
            index: None,
            first: None,
            last: None,
        }
    }

    pub fn from_file<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(vec![path.into()])
    }

    /// Number of files this reader will walk.
    pub fn files_len(&self) -> usize {
        self.files.len()
    }

    /// Restricts iteration to the given packet types.
    pub fn with_filter(mut self, filter: &[PacketType]) -> Self {
        self.filter = Some(filter.iter().map(|t| t.to_u8()).collect());
        self
    }

    /// Restarts iteration at the first byte of the first file.
    pub fn rewind(&mut self) {
        self.file_index = 0;
        self.buffer.clear();
        self.pos = 0;
        self.in_resync = false;
    }

    fn load_next_file(&mut self) -> bool {
        while self.file_index < self.files.len() {
            let path = &self.files[self.file_index];
            self.file_index += 1;
            match fs::read(path) {
                Ok(buffer) => {
                    debug!("reading {} ({} bytes)", path.display(), buffer.len());
                    self.buffer = buffer;
                    self.pos = 0;
                    self.in_resync = false;
                    return true;
                }
                Err(error) => {
                    warn!("cannot read {}: {}", path.display(), error);
                    self.n_errors += 1;
                }
            }
        }
        false
    }

    /// Builds (or returns) the per-tag index over all files. Counts are
    /// cached in a `.idx` sidecar next to each data file so a second
    /// indexing run does not re-scan unchanged data.
    pub fn index(&mut self) -> &PacketIndex {
        if self.index.is_none() {
            let mut index = PacketIndex::default();
            for path in &self.files {
                let counts = match read_index_sidecar(path) {
                    Some(counts) => counts,
                    None => {
                        let counts = scan_file_counts(path);
                        write_index_sidecar(path, &counts);
                        counts
                    }
                };
                for (tag, count) in counts {
                    *index.counts.entry(tag).or_insert(0) += count;
                }
            }
            self.index = Some(index);
        }
        // make first/last O(1) from here on
        if self.first.is_none() {
            self.first = self.find_edge(false);
        }
        if self.last.is_none() {
            self.last = self.find_edge(true);
        }
        self.index.as_ref().unwrap()
    }

    fn find_edge(&self, last: bool) -> Option<TofPacket> {
        let files: Box<dyn Iterator<Item = &PathBuf>> = if last {
            Box::new(self.files.iter().rev())
        } else {
            Box::new(self.files.iter())
        };
        for path in files {
            let buffer = match fs::read(path) {
                Ok(buffer) => buffer,
                Err(_) => continue,
            };
            let mut edge = None;
            let mut pos = 0;
            while pos < buffer.len() {
                match skim_tofpacket(&buffer, pos) {
                    Ok((_, size)) => {
                        edge = Some(pos);
                        pos += size;
                        if !last {
                            break;
                        }
                    }
                    Err(_) => pos += 1,
                }
            }
            if let Some(mut offset) = edge {
                if let Ok(packet) = TofPacket::from_bytestream(&buffer, &mut offset) {
                    return Some(packet);
                }
            }
        }
        None
    }

    /// First packet across all files. O(1) after [`TofPacketReader::index`].
    pub fn first(&mut self) -> Option<TofPacket> {
        if self.first.is_none() {
            self.first = self.find_edge(false);
        }
        self.first.clone()
    }

    /// Last packet across all files. O(1) after [`TofPacketReader::index`].
    pub fn last(&mut self) -> Option<TofPacket> {
        if self.last.is_none() {
            self.last = self.find_edge(true);
        }
        self.last.clone()
    }
}

fn scan_file_counts(path: &Path) -> HashMap<u8, usize> {
    let buffer = match fs::read(path) {
        Ok(buffer) => buffer,
        Err(error) => {
            warn!("cannot index {}: {}", path.display(), error);
            return HashMap::new();
        }
    };
    let mut counts = HashMap::new();
    let mut pos = 0;
    while pos < buffer.len() {
        match skim_tofpacket(&buffer, pos) {
            Ok((tag, size)) => {
                *counts.entry(tag.to_u8()).or_insert(0) += 1;
                pos += size;
            }
            Err(_) => pos += 1,
        }
    }
    counts
}

impl Iterator for TofPacketReader {
    type Item = TofPacket;

    fn next(&mut self) -> Option<TofPacket> {
        loop {
            if self.pos >= self.buffer.len() {
                if !self.load_next_file() {
                    return None;
                }
            }
            while self.pos < self.buffer.len() {
                match skim_tofpacket(&self.buffer, self.pos) {
                    Ok((tag, size)) => {
                        self.in_resync = false;
                        let offset = self.pos;
                        self.pos += size;
                        let matches = self
                            .filter
                            .as_ref()
                            .map_or(true, |f| f.contains(&tag.to_u8()));
                        if !matches {
                            continue;
                        }
                        let mut decode_pos = offset;
                        match TofPacket::from_bytestream(&self.buffer, &mut decode_pos) {
                            Ok(packet) => return Some(packet),
                            Err(_) => {
                                // skim accepted it, so this cannot happen;
                                // count it and resynchronise anyway
                                self.n_errors += 1;
                                self.pos = offset + 1;
                            }
                        }
                    }
                    Err(_) => {
                        if !self.in_resync {
                            self.n_errors += 1;
                            self.in_resync = true;
                        }
                        self.pos += 1;
                        self.bytes_skipped += 1;
                    }
                }
            }
        }
    }
}

/// Streams [`TelemetryPacket`]s from an ordered list of `RAW*.bin`
/// files. Same contract as [`TofPacketReader`].
pub struct TelemetryPacketReader {
    files: Vec<PathBuf>,
    file_index: usize,
    buffer: Vec<u8>,
    pos: usize,
    in_resync: bool,
    filter: Option<HashSet<u8>>,
    pub n_errors: usize,
    pub bytes_skipped: usize,
}

impl TelemetryPacketReader {
    pub fn new(files: Vec<PathBuf>) -> Self {
        TelemetryPacketReader {
            files,
            file_index: 0,
            buffer: Vec::new(),
            pos: 0,
            in_resync: false,
            filter: None,
            n_errors: 0,
            bytes_skipped: 0,
        }
    }

    pub fn from_file<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(vec![path.into()])
    }

    /// Number of files this reader will walk.
    pub fn files_len(&self) -> usize {
        self.files.len()
    }

    pub fn with_filter(mut self, filter: &[TelemetryPacketType]) -> Self {
        self.filter = Some(filter.iter().map(|t| t.to_u8()).collect());
        self
    }

    pub fn rewind(&mut self) {
        self.file_index = 0;
        self.buffer.clear();
        self.pos = 0;
        self.in_resync = false;
    }

    fn load_next_file(&mut self) -> bool {
        while self.file_index < self.files.len() {
            let path = &self.files[self.file_index];
            self.file_index += 1;
            match fs::read(path) {
                Ok(buffer) => {
                    debug!("reading {} ({} bytes)", path.display(), buffer.len());
                    self.buffer = buffer;
                    self.pos = 0;
                    self.in_resync = false;
                    return true;
                }
                Err(error) => {
                    warn!("cannot read {}: {}", path.display(), error);
                    self.n_errors += 1;
                }
            }
        }
        false
    }
}

impl Iterator for TelemetryPacketReader {
    type Item = TelemetryPacket;

    fn next(&mut self) -> Option<TelemetryPacket> {
        loop {
            if self.pos >= self.buffer.len() {
                if !self.load_next_file() {
                    return None;
                }
            }
            while self.pos < self.buffer.len() {
                match skim_telemetry(&self.buffer, self.pos) {
                    Ok((tag, size)) => {
                        self.in_resync = false;
                        let offset = self.pos;
                        self.pos += size;
                        let matches = self
                            .filter
                            .as_ref()
                            .map_or(true, |f| f.contains(&tag.to_u8()));
                        if !matches {
                            continue;
                        }
                        let mut decode_pos = offset;
                        match TelemetryPacket::from_bytestream(&self.buffer, &mut decode_pos) {
                            Ok(packet) => return Some(packet),
                            Err(_) => {
                                self.n_errors += 1;
                                self.pos = offset + 1;
                            }
                        }
                    }
                    Err(_) => {
                        if !self.in_resync {
                            self.n_errors += 1;
                            self.in_resync = true;
                        }
                        self.pos += 1;
                        self.bytes_skipped += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::Packable;

    #[test]
    fn filename_timestamps() {
        let ts = get_ts_from_filename("Run117_3.240712_094325UTC.tof.gaps").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-07-12T09:43:25+00:00");
        let ts = get_ts_from_filename("/data/RAW240815_044946.bin").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-08-15T04:49:46+00:00");
        assert!(get_ts_from_filename("no-stamp-here.bin").is_none());
    }

    #[test]
    fn missing_event_stats() {
        let (found, expected, missing) = check_missing_events(&[100, 101, 103, 104]);
        assert_eq!(found, 4);
        assert_eq!(expected, 5);
        assert!((missing - 0.2).abs() < 1e-12);
    }

    fn write_packets(path: &Path, packets: &[TofPacket], garbage_between: bool) {
        let mut stream = Vec::new();
        for (i, packet) in packets.iter().enumerate() {
            if garbage_between && i > 0 {
                stream.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
            }
            stream.extend(packet.to_bytestream());
        }
        fs::write(path, stream).unwrap();
    }

    #[test]
    fn reader_streams_across_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tof.gaps");
        let b = dir.path().join("b.tof.gaps");
        let one = TofPacket::new(PacketType::TofEvent, vec![1]);
        let two = TofPacket::new(PacketType::RBMoniData, vec![2]);
        let three = TofPacket::new(PacketType::TofEvent, vec![3]);
        write_packets(&a, &[one.clone(), two.clone()], false);
        write_packets(&b, &[three.clone()], false);

        let reader = TofPacketReader::new(vec![a, b]);
        let packets: Vec<_> = reader.collect();
        assert_eq!(packets, vec![one, two, three]);
    }

    #[test]
    fn reader_filter_skips_without_leaking_partials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filtered.tof.gaps");
        let event = TofPacket::new(PacketType::TofEvent, vec![1, 2, 3]);
        let moni = TofPacket::new(PacketType::RBMoniData, vec![4]);
        write_packets(&path, &[moni.clone(), event.clone(), moni], true);

        let reader = TofPacketReader::from_file(&path).with_filter(&[PacketType::TofEvent]);
        let packets: Vec<_> = reader.collect();
        assert_eq!(packets, vec![event]);
    }

    #[test]
    fn reader_resyncs_over_garbage_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.tof.gaps");
        let event = TofPacket::new(PacketType::TofEvent, vec![7; 16]);
        write_packets(&path, &[event.clone(), event.clone()], true);

        let mut reader = TofPacketReader::from_file(&path);
        assert_eq!(reader.by_ref().count(), 2);
        assert_eq!(reader.n_errors, 1);
        assert_eq!(reader.bytes_skipped, 3);
    }

    #[test]
    fn empty_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tof.gaps");
        fs::write(&path, b"").unwrap();
        let mut reader = TofPacketReader::from_file(&path);
        assert!(reader.next().is_none());
        assert_eq!(reader.n_errors, 0);
    }

    #[test]
    fn one_packet_then_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trailing.tof.gaps");
        let event = TofPacket::new(PacketType::TofEvent, vec![1]);
        let mut stream = event.to_bytestream();
        stream.extend_from_slice(&[0x13, 0x37, 0xAA]);
        fs::write(&path, stream).unwrap();

        let mut reader = TofPacketReader::from_file(&path);
        assert_eq!(reader.next(), Some(event));
        assert!(reader.next().is_none());
    }

    #[test]
    fn index_counts_and_first_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indexed.tof.gaps");
        let event = crate::events::MasterTriggerEvent::new(500).pack();
        let moni = TofPacket::new(PacketType::RBMoniData, vec![0; 8]);
        write_packets(
            &path,
            &[moni.clone(), event.clone(), moni.clone(), moni.clone()],
            false,
        );

        let mut reader = TofPacketReader::from_file(&path);
        let index = reader.index().clone();
        assert_eq!(index.counts[&PacketType::RBMoniData.to_u8()], 3);
        assert_eq!(index.counts[&PacketType::MasterTrigger.to_u8()], 1);
        assert_eq!(index.total(), 4);
        assert_eq!(reader.first(), Some(moni));
        // iteration still starts at the beginning after indexing
        assert_eq!(reader.by_ref().count(), 4);
    }

    #[test]
    fn telemetry_reader_roundtrip_with_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RAW240101_000000.bin");
        let merged = TelemetryPacket::new(TelemetryPacketType::MergedEvent, 100, vec![1, 2]);
        let gps = TelemetryPacket::new(TelemetryPacketType::GPS, 101, vec![3]);
        let mut stream = merged.to_bytestream();
        stream.extend(gps.to_bytestream());
        stream.extend([0xFF, 0xFE]);
        stream.extend(merged.to_bytestream());
        fs::write(&path, stream).unwrap();

        let reader = TelemetryPacketReader::from_file(&path)
            .with_filter(&[TelemetryPacketType::MergedEvent]);
        let packets: Vec<_> = reader.collect();
        assert_eq!(packets.len(), 2);
        assert!(packets
            .iter()
            .all(|p| p.packet_type() == TelemetryPacketType::MergedEvent));
    }
}
