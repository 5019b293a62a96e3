//! The dual-stream event merger.
//!
//! Two partially overlapping, lossy views of the same run exist: the
//! TOF-local file stream (complete, higher fidelity) and the telemetry
//! downlink (lossy, reordered by a few events, interleaved with other
//! subsystems). The merger walks the TOF stream as the driver and
//! produces one [`Frame`] per TOF event id, attaching the telemetry
//! counterpart where one can be found and caching out-of-order telemetry
//! events in two bounded skew buffers until their partner shows up.
//!
//! A second pass re-reads the written frames and splices in telemetry
//! events that had arrived before their TOF partner was written; the
//! swept output lands in a `clean/` subdirectory and the pre-sweep files
//! are removed.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::calibration::{self, RBCalibration};
use crate::errors::MergeError;
use crate::events::TofEvent;
use crate::frame::{Frame, FrameReader, FrameWriter, HOUSEKEEPING_EVENT_ID};
use crate::io::{TelemetryPacketReader, TofPacketReader};
use crate::packets::{Packable, PacketType, TofPacket};
use crate::telemetry::{MergedEvent, TelemetryPacket};
use crate::waveform::waveform_analysis;

/// Tag under which a reprocessed event is stored next to the original.
pub const REPROCESSED_TAG: &str = "TofEvent.reprocessed";

/// Everything configurable about one merge run.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub run_id: u32,
    /// Directory below which the `<run_id>/` output directory is created.
    pub outdir: PathBuf,
    /// Discard telemetry packets with a gcutime before this.
    pub start_time: Option<u32>,
    pub end_time: Option<u32>,
    /// Re-run waveform calibration and hit building on every TOF event.
    pub reprocess: bool,
    /// Soft ceiling on the combined skew-buffer population.
    pub buffer_ceiling: usize,
    /// Compare event ids with explicit u32 wrap handling. Off in
    /// practice: one run cannot reach 2^32 events.
    pub allow_evid_wrap: bool,
    /// Subrun rotation threshold for the frame writer.
    pub max_file_bytes: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            run_id: 0,
            outdir: PathBuf::from("."),
            start_time: None,
            end_time: None,
            reprocess: false,
            buffer_ceiling: 100_000,
            allow_evid_wrap: false,
            max_file_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Shared lookup state threaded through the merger; replaces any notion
/// of process-wide singletons.
pub struct Context {
    pub config: MergeConfig,
    pub calibrations: HashMap<u8, RBCalibration>,
    /// Geometry database location, taken from `DATABASE_URL`. Absence
    /// is non-fatal; only reprocessing consults geometry at all.
    pub db_path: Option<PathBuf>,
}

impl Context {
    pub fn new(config: MergeConfig) -> Self {
        Context {
            config,
            calibrations: HashMap::new(),
            db_path: std::env::var_os("DATABASE_URL").map(PathBuf::from),
        }
    }

    /// Loads all board calibrations from a directory into the context.
    pub fn load_calibrations(&mut self, directory: &std::path::Path) -> Result<(), MergeError> {
        self.calibrations = calibration::load_calibrations(directory)?;
        Ok(())
    }
}

/// Final accounting of one merge run.
#[derive(Debug, Clone, Default)]
pub struct MergeSummary {
    pub frames_written: usize,
    /// TOF events that produced a frame.
    pub events_total: usize,
    /// Frames that carry both the TOF and the telemetry payload.
    pub events_matched: usize,
    pub n_tof_errors: usize,
    pub n_telly_errors: usize,
    pub peak_earlier: usize,
    pub peak_later: usize,
    /// The skew buffers crossed the configured ceiling at least once.
    pub buffer_overflowed: bool,
    /// Telemetry events spliced in during the sweep pass.
    pub swept_in: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl MergeSummary {
    /// Fraction of TOF events for which the telemetry counterpart was
    /// found, in percent.
    pub fn completeness(&self) -> f64 {
        if self.events_total == 0 {
            return 0.0;
        }
        100.0 * self.events_matched as f64 / self.events_total as f64
    }
}

impl fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--------------------------------")?;
        writeln!(f, " frames written ......... {}", self.frames_written)?;
        writeln!(f, " TOF decode errors ...... {}", self.n_tof_errors)?;
        writeln!(f, " telemetry errors ....... {}", self.n_telly_errors)?;
        writeln!(
            f,
            " peak skew buffers ...... {} earlier / {} later",
            self.peak_earlier, self.peak_later
        )?;
        if self.buffer_overflowed {
            writeln!(f, " skew buffers overflowed the configured ceiling!")?;
        }
        if self.cancelled {
            writeln!(f, " run was cancelled before the inputs were exhausted")?;
        }
        writeln!(
            f,
            " elapsed ................ {:.2} min",
            self.elapsed.as_secs_f64() / 60.0
        )?;
        writeln!(
            f,
            " input completeness ..... {:.2} % ({} of {} events matched, {} via sweep)",
            self.completeness(),
            self.events_matched,
            self.events_total,
            self.swept_in
        )?;
        write!(f, "--------------------------------")
    }
}

/// Event-id comparison, optionally with u32 wrap handling.
fn evid_cmp(a: u32, b: u32, allow_wrap: bool) -> Ordering {
    if !allow_wrap || a == b {
        return a.cmp(&b);
    }
    if b.wrapping_sub(a) < 0x8000_0000 {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

enum TellyOutcome {
    Matched,
    TofOnly,
    Exhausted,
}

/// The two-pass merger. Construct with the two primed file lists, then
/// call [`EventMerger::run`].
pub struct EventMerger {
    tof_reader: TofPacketReader,
    telly_reader: TelemetryPacketReader,
    ctx: Context,
    telly_earlier: HashMap<u32, TelemetryPacket>,
    telly_later: HashMap<u32, TelemetryPacket>,
    /// Telemetry packet pushed back during priming.
    pending_telly: Option<TelemetryPacket>,
    /// Highest event id written so far.
    last_event_id: Option<u32>,
    cancel: Arc<AtomicBool>,
    summary: MergeSummary,
}

impl EventMerger {
    pub fn new(tof_files: Vec<PathBuf>, telemetry_files: Vec<PathBuf>, ctx: Context) -> Self {
        EventMerger {
            tof_reader: TofPacketReader::new(tof_files),
            telly_reader: TelemetryPacketReader::new(telemetry_files),
            ctx,
            telly_earlier: HashMap::new(),
            telly_later: HashMap::new(),
            pending_telly: None,
            last_event_id: None,
            cancel: Arc::new(AtomicBool::new(false)),
            summary: MergeSummary::default(),
        }
    }

    /// A flag that stops the merger between frames when set. The current
    /// frame is flushed and the writer closed before [`EventMerger::run`]
    /// returns.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Runs both passes and returns the run summary.
    pub fn run(mut self) -> Result<MergeSummary, MergeError> {
        let started = Instant::now();
        let run_dir = self.ctx.config.outdir.join(self.ctx.config.run_id.to_string());

        let (first_packet, first_evid) = self.prime_tof()?;
        info!("first TOF event id is {}", first_evid);
        self.prime_telemetry(first_evid);

        let mut writer = FrameWriter::new(&run_dir, self.ctx.config.run_id)
            .map_err(|_| MergeError::OutputUnwritable(run_dir.clone()))?
            .with_max_file_bytes(self.ctx.config.max_file_bytes);

        self.handle_tof_packet(first_packet, &mut writer)?;
        while let Some(packet) = self.tof_reader.next() {
            if self.cancel.load(AtomicOrdering::Relaxed) {
                warn!("cancellation requested, stopping between frames");
                self.summary.cancelled = true;
                break;
            }
            self.handle_tof_packet(packet, &mut writer)?;
        }
        if !self.summary.cancelled {
            self.drain_telemetry();
        }
        self.summary.n_tof_errors += self.tof_reader.n_errors;
        self.summary.n_telly_errors += self.telly_reader.n_errors;

        let pre_sweep = writer.finalize()?;
        self.sweep(&run_dir, pre_sweep)?;

        self.summary.elapsed = started.elapsed();
        info!("merge finished:\n{}", self.summary);
        Ok(self.summary)
    }

    /// Walks the TOF stream to the first decodable event, discarding
    /// pre-run housekeeping.
    fn prime_tof(&mut self) -> Result<(TofPacket, u32), MergeError> {
        if self.tof_reader.files_len() == 0 {
            return Err(MergeError::NoAlignment("TOF file list is empty"));
        }
        while let Some(packet) = self.tof_reader.next() {
            if packet.packet_type != PacketType::TofEvent {
                continue;
            }
            match TofEvent::peek_event_id(&packet) {
                Ok(event_id) => return Ok((packet, event_id)),
                Err(error) => {
                    debug!("skipping undecodable event while priming: {}", error);
                    self.summary.n_tof_errors += 1;
                }
            }
        }
        Err(MergeError::NoAlignment(
            "TOF stream holds no decodable event",
        ))
    }

    /// Walks the telemetry stream to the first merged event at or after
    /// `first_evid` (and after the configured start time), pushing that
    /// packet back for the main pass.
    fn prime_telemetry(&mut self, first_evid: u32) {
        let start_time = self.ctx.config.start_time;
        while let Some(packet) = self.telly_reader.next() {
            if let Some(start) = start_time {
                if packet.header.gcutime < start {
                    continue;
                }
            }
            if !packet.packet_type().is_event() {
                continue;
            }
            match self.decode_merged(&packet) {
                Some(event_id) => {
                    if evid_cmp(event_id, first_evid, self.ctx.config.allow_evid_wrap)
                        == Ordering::Less
                    {
                        continue;
                    }
                    info!(
                        "telemetry aligned at event id {} (gcutime {})",
                        event_id, packet.header.gcutime
                    );
                    self.pending_telly = Some(packet);
                    return;
                }
                None => continue,
            }
        }
        warn!("telemetry stream exhausted during priming; frames will be TOF-only");
    }

    /// Checksum-verifies and decodes the merged-event header of a
    /// telemetry packet, counting failures.
    fn decode_merged(&mut self, packet: &TelemetryPacket) -> Option<u32> {
        if !packet.checksum_ok {
            self.summary.n_telly_errors += 1;
            return None;
        }
        match MergedEvent::from_telemetry_packet(packet) {
            Ok(merged) => Some(merged.event_id),
            Err(error) => {
                debug!("telemetry event failed to decode: {}", error);
                self.summary.n_telly_errors += 1;
                None
            }
        }
    }

    fn note_buffer_sizes(&mut self) {
        self.summary.peak_earlier = self.summary.peak_earlier.max(self.telly_earlier.len());
        self.summary.peak_later = self.summary.peak_later.max(self.telly_later.len());
        let population = self.telly_earlier.len() + self.telly_later.len();
        if population > self.ctx.config.buffer_ceiling && !self.summary.buffer_overflowed {
            warn!(
                "skew buffers hold {} packets, above the ceiling of {}; continuing",
                population, self.ctx.config.buffer_ceiling
            );
            self.summary.buffer_overflowed = true;
        }
    }

    fn handle_tof_packet(
        &mut self,
        packet: TofPacket,
        writer: &mut FrameWriter,
    ) -> Result<(), MergeError> {
        if packet.packet_type != PacketType::TofEvent {
            // TOF housekeeping gets its own frame
            let mut frame = Frame::new(HOUSEKEEPING_EVENT_ID);
            frame.put_tofpacket(&packet);
            writer.add_frame(&frame)?;
            self.summary.frames_written += 1;
            return Ok(());
        }

        let event_id = match TofEvent::peek_event_id(&packet) {
            Ok(event_id) => event_id,
            Err(error) => {
                debug!("skipping undecodable TOF event: {}", error);
                self.summary.n_tof_errors += 1;
                return Ok(());
            }
        };
        self.summary.events_total += 1;
        self.last_event_id = Some(match self.last_event_id {
            Some(last) if evid_cmp(last, event_id, self.ctx.config.allow_evid_wrap)
                == Ordering::Greater =>
            {
                last
            }
            _ => event_id,
        });

        let mut frame = Frame::new(event_id);
        frame.put_tofpacket(&packet);
        if self.ctx.config.reprocess {
            self.reprocess_into(&mut frame, &packet);
        }

        // an out-of-order telemetry partner may already be cached
        if let Some(cached) = self
            .telly_earlier
            .remove(&event_id)
            .or_else(|| self.telly_later.remove(&event_id))
        {
            frame.put_telemetry(&cached);
            self.summary.events_matched += 1;
            writer.add_frame(&frame)?;
            self.summary.frames_written += 1;
            return Ok(());
        }

        match self.search_telemetry(event_id, &mut frame) {
            TellyOutcome::Matched => {
                self.summary.events_matched += 1;
            }
            TellyOutcome::TofOnly | TellyOutcome::Exhausted => {}
        }
        writer.add_frame(&frame)?;
        self.summary.frames_written += 1;
        Ok(())
    }

    /// Advances the telemetry stream until the partner of `event_id` is
    /// found or proven absent. Housekeeping encountered on the way is
    /// accumulated into `frame`; tracker packets are dropped.
    fn search_telemetry(&mut self, event_id: u32, frame: &mut Frame) -> TellyOutcome {
        loop {
            let packet = match self.pending_telly.take().or_else(|| self.telly_reader.next()) {
                Some(packet) => packet,
                None => return TellyOutcome::Exhausted,
            };
            let ptype = packet.packet_type();
            if ptype.is_tracker() {
                continue;
            }
            if !ptype.is_event() {
                frame.put_telemetry(&packet);
                continue;
            }
            let telly_evid = match self.decode_merged(&packet) {
                Some(telly_evid) => telly_evid,
                None => continue,
            };
            match evid_cmp(telly_evid, event_id, self.ctx.config.allow_evid_wrap) {
                Ordering::Less => {
                    // its TOF partner was already written (or lost);
                    // the sweep pass will splice it in
                    self.telly_earlier.insert(telly_evid, packet);
                    self.note_buffer_sizes();
                }
                Ordering::Greater => {
                    // this TOF event id is absent from telemetry so far
                    self.telly_later.insert(telly_evid, packet);
                    self.note_buffer_sizes();
                    return TellyOutcome::TofOnly;
                }
                Ordering::Equal => {
                    frame.put_telemetry(&packet);
                    return TellyOutcome::Matched;
                }
            }
        }
    }

    /// After the TOF stream ends, telemetry events belonging to frames
    /// already written may still sit unread in the stream (the partner
    /// was satisfied from a cache, so the cursor never advanced past
    /// them). Cache them for the sweep pass, stopping at the first event
    /// beyond the highest written id.
    fn drain_telemetry(&mut self) {
        let max_written = match self.last_event_id {
            Some(max_written) => max_written,
            None => return,
        };
        while let Some(packet) = self.pending_telly.take().or_else(|| self.telly_reader.next()) {
            let ptype = packet.packet_type();
            if ptype.is_tracker() || !ptype.is_event() {
                continue;
            }
            if let Some(telly_evid) = self.decode_merged(&packet) {
                match evid_cmp(telly_evid, max_written, self.ctx.config.allow_evid_wrap) {
                    Ordering::Greater => {
                        self.telly_later.insert(telly_evid, packet);
                        self.note_buffer_sizes();
                        break;
                    }
                    _ => {
                        self.telly_earlier.insert(telly_evid, packet);
                        self.note_buffer_sizes();
                    }
                }
            }
        }
    }

    /// Full event reprocessing: calibrate, despike, rebuild hits, and
    /// store the result next to the original packet.
    fn reprocess_into(&mut self, frame: &mut Frame, packet: &TofPacket) {
        let mut event = match TofEvent::from_tofpacket(packet) {
            Ok(event) => event,
            Err(error) => {
                debug!("reprocessing skipped, event does not decode: {}", error);
                self.summary.n_tof_errors += 1;
                return;
            }
        };
        let missing = waveform_analysis(&mut event, &self.ctx.calibrations);
        if missing > 0 {
            debug!("{} boards without calibration in event {}", missing, event.event_id());
        }
        frame.put_tofpacket_tagged(&event.pack(), REPROCESSED_TAG);
    }

    /// Second pass: splice cached telemetry events into the frames
    /// written by the main pass, rewriting everything into `clean/` and
    /// removing the pre-sweep files.
    fn sweep(&mut self, run_dir: &std::path::Path, pre_sweep: Vec<PathBuf>) -> Result<(), MergeError> {
        info!(
            "sweep pass over {} files, {} early / {} late telemetry events still cached",
            pre_sweep.len(),
            self.telly_earlier.len(),
            self.telly_later.len()
        );
        let clean_dir = run_dir.join("clean");
        let mut writer = FrameWriter::new(&clean_dir, self.ctx.config.run_id)
            .map_err(|_| MergeError::OutputUnwritable(clean_dir.clone()))?
            .with_max_file_bytes(self.ctx.config.max_file_bytes);

        let mut frames = 0usize;
        for path in &pre_sweep {
            for mut frame in FrameReader::open(path)? {
                if frame.event_id != HOUSEKEEPING_EVENT_ID && !frame.has_telemetry_event() {
                    let cached = self
                        .telly_earlier
                        .remove(&frame.event_id)
                        .or_else(|| self.telly_later.remove(&frame.event_id));
                    if let Some(packet) = cached {
                        frame.put_telemetry(&packet);
                        self.summary.events_matched += 1;
                        self.summary.swept_in += 1;
                    }
                }
                writer.add_frame(&frame)?;
                frames += 1;
            }
        }
        writer.finalize()?;
        self.summary.frames_written = frames;
        for path in pre_sweep {
            if let Err(error) = std::fs::remove_file(&path) {
                warn!("cannot remove pre-sweep file {}: {}", path.display(), error);
            }
        }
        if !self.telly_earlier.is_empty() || !self.telly_later.is_empty() {
            info!(
                "{} telemetry events never found a TOF partner",
                self.telly_earlier.len() + self.telly_later.len()
            );
        }
        Ok(())
    }
}
