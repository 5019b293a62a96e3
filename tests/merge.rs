//! End-to-end merger scenarios: synthetic TOF and telemetry streams are
//! written to disk, merged, and the swept output is read back.

use std::fs;
use std::path::{Path, PathBuf};

use tof_gaps::events::{MasterTriggerEvent, RBEvent, RBEventHeader, TofEvent};
use tof_gaps::frame::{Frame, FrameReader, HOUSEKEEPING_EVENT_ID};
use tof_gaps::merge::{Context, EventMerger, MergeConfig, MergeSummary, REPROCESSED_TAG};
use tof_gaps::packets::{Packable, PacketType, TofPacket};
use tof_gaps::telemetry::{MergedEvent, TelemetryPacket, TelemetryPacketType};
use tof_gaps::waveform::Waveform;
use tof_gaps::NWORDS;

const RUN_ID: u32 = 9;

fn tof_event_packet(event_id: u32) -> TofPacket {
    TofEvent::new(MasterTriggerEvent::new(event_id)).pack()
}

fn tof_event_packet_with_waveforms(event_id: u32, rb_id: u16) -> TofPacket {
    let mut header = RBEventHeader::new();
    header.rb_id = rb_id;
    header.event_id = event_id;
    header.channel_mask = 0b11;
    let mut rb_event = RBEvent::new(header);
    for ch in 0..2u8 {
        let mut adc = vec![1000u16; NWORDS];
        for cell in 700..720 {
            adc[cell] = 600;
        }
        rb_event.waveforms.push(Waveform::new(rb_id as u8, ch, 0, adc));
    }
    let mut event = TofEvent::new(MasterTriggerEvent::new(event_id));
    event.rb_events.push(rb_event);
    event.pack()
}

fn telly_event_packet(event_id: u32, gcutime: u32) -> TelemetryPacket {
    let event = TofEvent::new(MasterTriggerEvent::new(event_id));
    let merged = MergedEvent::from_tof_event(&event);
    TelemetryPacket::new(
        TelemetryPacketType::MergedEvent,
        gcutime,
        merged.to_bytestream(),
    )
}

fn telly_housekeeping(gcutime: u32) -> TelemetryPacket {
    TelemetryPacket::new(TelemetryPacketType::AnyTofHK, gcutime, vec![1, 2, 3, 4])
}

fn telly_tracker(gcutime: u32) -> TelemetryPacket {
    TelemetryPacket::new(TelemetryPacketType::Tracker, gcutime, vec![9; 24])
}

fn write_tof_file(dir: &Path, packets: &[TofPacket]) -> PathBuf {
    let path = dir.join("Run9_0.240712_094325UTC.tof.gaps");
    let mut stream = Vec::new();
    for packet in packets {
        stream.extend(packet.to_bytestream());
    }
    fs::write(&path, stream).unwrap();
    path
}

fn write_telly_file(dir: &Path, packets: &[TelemetryPacket]) -> PathBuf {
    let path = dir.join("RAW240712_094325.bin");
    let mut stream = Vec::new();
    for packet in packets {
        stream.extend(packet.to_bytestream());
    }
    fs::write(&path, stream).unwrap();
    path
}

fn run_merge_with(
    dir: &Path,
    tof_packets: &[TofPacket],
    telly_packets: &[TelemetryPacket],
    configure: impl FnOnce(&mut Context),
) -> (MergeSummary, Vec<Frame>) {
    let tof_file = write_tof_file(dir, tof_packets);
    let telly_file = write_telly_file(dir, telly_packets);
    let outdir = dir.join("out");

    let config = MergeConfig {
        run_id: RUN_ID,
        outdir: outdir.clone(),
        ..MergeConfig::default()
    };
    let mut ctx = Context::new(config);
    configure(&mut ctx);
    let merger = EventMerger::new(vec![tof_file], vec![telly_file], ctx);
    let summary = merger.run().unwrap();

    // pre-sweep files must be gone, the archival output lives in clean/
    let run_dir = outdir.join(RUN_ID.to_string());
    let leftovers: Vec<_> = fs::read_dir(&run_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .filter(|name| name != "clean")
        .collect();
    assert!(leftovers.is_empty(), "pre-sweep files left: {:?}", leftovers);

    let clean_dir = run_dir.join("clean");
    let mut files: Vec<PathBuf> = fs::read_dir(&clean_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    files.sort();
    let mut frames = Vec::new();
    for path in files {
        frames.extend(FrameReader::open(path).unwrap());
    }
    (summary, frames)
}

fn run_merge(
    dir: &Path,
    tof_packets: &[TofPacket],
    telly_packets: &[TelemetryPacket],
) -> (MergeSummary, Vec<Frame>) {
    run_merge_with(dir, tof_packets, telly_packets, |_| {})
}

fn event_frames(frames: &[Frame]) -> Vec<&Frame> {
    frames
        .iter()
        .filter(|f| f.event_id != HOUSEKEEPING_EVENT_ID)
        .collect()
}

fn assert_invariants(frames: &[Frame]) {
    let events = event_frames(frames);
    let ids: Vec<u32> = events.iter().map(|f| f.event_id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ids, sorted, "event ids must be monotone and duplicate-free");
    for frame in events {
        let telemetry_events = frame
            .tags()
            .filter(|tag| {
                tag.parse::<TelemetryPacketType>()
                    .map_or(false, |t| t.is_event())
            })
            .count();
        assert!(telemetry_events <= 1, "frame {} has {} telemetry events", frame.event_id, telemetry_events);
    }
}

#[test]
fn perfect_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let tof: Vec<TofPacket> = [100, 101, 102].iter().map(|&e| tof_event_packet(e)).collect();
    let telly: Vec<TelemetryPacket> = [100, 101, 102]
        .iter()
        .map(|&e| telly_event_packet(e, 1000 + e))
        .collect();

    let (summary, frames) = run_merge(dir.path(), &tof, &telly);
    assert_invariants(&frames);

    assert_eq!(summary.events_total, 3);
    assert_eq!(summary.events_matched, 3);
    assert_eq!(summary.peak_earlier, 0);
    assert_eq!(summary.peak_later, 0);
    assert_eq!(summary.n_tof_errors, 0);
    assert_eq!(summary.n_telly_errors, 0);
    assert!((summary.completeness() - 100.0).abs() < 1e-9);

    let events = event_frames(&frames);
    assert_eq!(events.len(), 3);
    for (frame, expected) in events.iter().zip([100u32, 101, 102]) {
        assert_eq!(frame.event_id, expected);
        assert!(frame.get("TofEvent").is_some());
        assert!(frame.has_telemetry_event());
    }
}

#[test]
fn telemetry_lags_by_one() {
    let dir = tempfile::tempdir().unwrap();
    let tof: Vec<TofPacket> = [100, 101, 102].iter().map(|&e| tof_event_packet(e)).collect();
    let telly: Vec<TelemetryPacket> = [101, 102]
        .iter()
        .map(|&e| telly_event_packet(e, 1000 + e))
        .collect();

    let (summary, frames) = run_merge(dir.path(), &tof, &telly);
    assert_invariants(&frames);

    assert_eq!(summary.events_total, 3);
    assert_eq!(summary.events_matched, 2);
    assert_eq!(summary.n_tof_errors, 0);

    let events = event_frames(&frames);
    assert_eq!(events.len(), 3);
    assert!(!events[0].has_telemetry_event(), "event 100 has no partner");
    assert!(events[1].has_telemetry_event());
    assert!(events[2].has_telemetry_event());
}

#[test]
fn telemetry_reorders() {
    let dir = tempfile::tempdir().unwrap();
    let tof: Vec<TofPacket> = [100, 101, 102, 103]
        .iter()
        .map(|&e| tof_event_packet(e))
        .collect();
    let telly: Vec<TelemetryPacket> = [101, 100, 103, 102]
        .iter()
        .map(|&e| telly_event_packet(e, 2000))
        .collect();

    let (summary, frames) = run_merge(dir.path(), &tof, &telly);
    assert_invariants(&frames);

    assert_eq!(summary.events_total, 4);
    assert_eq!(summary.events_matched, 4, "sweep must complete all four");
    assert_eq!(summary.peak_later, 1);
    assert!(summary.swept_in >= 1);

    let events = event_frames(&frames);
    assert_eq!(events.len(), 4);
    for frame in events {
        assert!(
            frame.has_telemetry_event(),
            "event {} lost its telemetry partner",
            frame.event_id
        );
    }
}

#[test]
fn telemetry_drops_one() {
    let dir = tempfile::tempdir().unwrap();
    let tof: Vec<TofPacket> = [100, 101, 102].iter().map(|&e| tof_event_packet(e)).collect();
    let telly: Vec<TelemetryPacket> = [100, 102]
        .iter()
        .map(|&e| telly_event_packet(e, 3000))
        .collect();

    let (summary, frames) = run_merge(dir.path(), &tof, &telly);
    assert_invariants(&frames);

    assert_eq!(summary.events_matched, 2);
    assert_eq!(summary.swept_in, 0, "sweep finds no late arrivals");

    let events = event_frames(&frames);
    assert!(events[0].has_telemetry_event());
    assert!(!events[1].has_telemetry_event());
    assert!(events[2].has_telemetry_event());
}

#[test]
fn channel_crc_corruption_is_carried_through() {
    let dir = tempfile::tempdir().unwrap();
    let packet = tof_event_packet_with_waveforms(500, 11);
    let mut stream = packet.to_bytestream();
    // envelope header (7) + status (1) + mte length prefix (2) + empty-hit
    // master trigger block (11) + rb count (1) + board header (36) +
    // channel head (2) + trace (2048) puts the cursor on the first
    // channel CRC32
    let crc_offset = 7 + 1 + 2 + 11 + 1 + 36 + 2 + 2 * NWORDS;
    stream[crc_offset] ^= 0x01;
    let path = dir.path().join("Run9_0.240712_094325UTC.tof.gaps");
    fs::write(&path, stream).unwrap();
    let telly_file = write_telly_file(dir.path(), &[telly_event_packet(500, 4000)]);

    let outdir = dir.path().join("out");
    let config = MergeConfig {
        run_id: RUN_ID,
        outdir: outdir.clone(),
        ..MergeConfig::default()
    };
    let merger = EventMerger::new(vec![path], vec![telly_file], Context::new(config));
    let summary = merger.run().unwrap();
    assert_eq!(summary.events_total, 1);
    assert_eq!(summary.n_tof_errors, 0, "CRC damage must not drop the event");

    let clean = outdir.join(RUN_ID.to_string()).join("clean").join("9_0.gaps");
    let frames: Vec<Frame> = FrameReader::open(clean).unwrap().collect();
    assert_eq!(frames.len(), 1);
    let carried = frames[0].tofpacket("TofEvent").unwrap();
    let event = TofEvent::from_tofpacket(&carried).unwrap();
    assert!(!event.rb_events[0].waveforms[0].crc_ok);
    assert!(event.rb_events[0].waveforms[1].crc_ok);
}

#[test]
fn housekeeping_routing() {
    let dir = tempfile::tempdir().unwrap();
    let tof = vec![
        tof_event_packet(100),
        TofPacket::new(PacketType::RBMoniData, vec![5; 16]),
        tof_event_packet(101),
    ];
    let telly = vec![
        telly_event_packet(100, 5000),
        telly_housekeeping(5001),
        telly_tracker(5002),
        telly_event_packet(101, 5003),
    ];

    let (summary, frames) = run_merge(dir.path(), &tof, &telly);
    assert_invariants(&frames);
    assert_eq!(summary.events_total, 2);
    assert_eq!(summary.events_matched, 2);

    // TOF housekeeping gets its own frame
    let hk: Vec<&Frame> = frames
        .iter()
        .filter(|f| f.event_id == HOUSEKEEPING_EVENT_ID)
        .collect();
    assert_eq!(hk.len(), 1);
    assert!(hk[0].get("RBMoniData").is_some());

    // telemetry housekeeping accumulates into the frame under assembly
    let frame_101 = frames.iter().find(|f| f.event_id == 101).unwrap();
    assert!(frame_101.get("AnyTofHK").is_some());

    // tracker packets are dropped
    assert!(frames.iter().all(|f| f.get("Tracker").is_none()));
}

#[test]
fn telemetry_ends_before_tof() {
    let dir = tempfile::tempdir().unwrap();
    let tof: Vec<TofPacket> = [100, 101, 102].iter().map(|&e| tof_event_packet(e)).collect();
    let telly = vec![telly_event_packet(100, 6000)];

    let (summary, frames) = run_merge(dir.path(), &tof, &telly);
    assert_invariants(&frames);

    assert_eq!(summary.events_total, 3);
    assert_eq!(summary.events_matched, 1);
    let events = event_frames(&frames);
    assert_eq!(events.len(), 3, "remaining TOF events still get frames");
    assert!(!events[1].has_telemetry_event());
    assert!(!events[2].has_telemetry_event());
}

#[test]
fn priming_discards_prerun_data() {
    let dir = tempfile::tempdir().unwrap();
    // housekeeping and an undecodable stub before the first event
    let tof = vec![
        TofPacket::new(PacketType::MtbMoniData, vec![1; 8]),
        tof_event_packet(200),
    ];
    // telemetry contains stale events from before the run
    let telly = vec![
        telly_event_packet(150, 7000),
        telly_event_packet(151, 7001),
        telly_event_packet(200, 7002),
    ];

    let (summary, frames) = run_merge(dir.path(), &tof, &telly);
    assert_eq!(summary.events_total, 1);
    assert_eq!(summary.events_matched, 1);
    // pre-event housekeeping is discarded during priming, so the only
    // frames are the matched event
    let events = event_frames(&frames);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, 200);
}

#[test]
fn reprocessing_adds_hits() {
    use tof_gaps::calibration::RBCalibration;

    let dir = tempfile::tempdir().unwrap();
    let tof = vec![tof_event_packet_with_waveforms(300, 7)];
    let telly = vec![telly_event_packet(300, 8000)];

    let (summary, frames) = run_merge_with(dir.path(), &tof, &telly, |ctx| {
        ctx.config.reprocess = true;
        ctx.calibrations.insert(7, RBCalibration::new(7));
    });
    assert_eq!(summary.events_matched, 1);

    let frame = event_frames(&frames)[0].clone();
    let reprocessed = frame
        .tofpacket(REPROCESSED_TAG)
        .expect("reprocessed event stored next to the original");
    let event = TofEvent::from_tofpacket(&reprocessed).unwrap();
    assert!(!event.hits.is_empty(), "calibrated paddle must yield a hit");
    assert!(frame.get("TofEvent").is_some(), "original is kept");
}

#[test]
fn cancellation_stops_between_frames() {
    let dir = tempfile::tempdir().unwrap();
    let tof: Vec<TofPacket> = (100..200).map(tof_event_packet).collect();
    let telly: Vec<TelemetryPacket> = (100..200).map(|e| telly_event_packet(e, 9000)).collect();
    let tof_file = write_tof_file(dir.path(), &tof);
    let telly_file = write_telly_file(dir.path(), &telly);

    let config = MergeConfig {
        run_id: RUN_ID,
        outdir: dir.path().join("out"),
        ..MergeConfig::default()
    };
    let merger = EventMerger::new(vec![tof_file], vec![telly_file], Context::new(config));
    merger
        .cancel_flag()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let summary = merger.run().unwrap();
    assert!(summary.cancelled);
    assert!(summary.frames_written < 100);
}
