//! Packet inspector for TOF and telemetry data files: prints decoded
//! packets, per-tag indices and, given a calibration, waveform summaries.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use structopt::StructOpt;

use tof_gaps::calibration::RBCalibration;
use tof_gaps::io::{TelemetryPacketReader, TofPacketReader};
use tof_gaps::moni::{MtbMoniData, RBMoniData};
use tof_gaps::telemetry::{safe_unpack_merged_event, unpack_tof_housekeeping};
use tof_gaps::waveform::summarize_pulse;
use tof_gaps::{PacketType, TofEvent};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "tof-scan",
    about = "Reads .tof.gaps or telemetry RAW*.bin files and prints what is inside: the packet stream, a per-tag index, or calibrated waveform summaries."
)]
struct Opt {
    #[structopt(parse(from_os_str), help = "One or more data files, read in the given order")]
    files: Vec<PathBuf>,

    #[structopt(long, help = "Treat inputs as telemetry binaries instead of TOF files")]
    telemetry: bool,

    #[structopt(short, long, help = "Only print the per-tag packet index")]
    index: bool,

    #[structopt(
        short = "n",
        long,
        help = "Stop after this many packets (default: all packets)"
    )]
    npackets: Option<usize>,

    #[structopt(
        short,
        long,
        parse(from_os_str),
        help = "Calibration file for the board whose events are inspected; enables waveform summaries"
    )]
    calibration: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let opt = Opt::from_args();
    if opt.files.is_empty() {
        bail!("no input files given");
    }

    let calibration = match &opt.calibration {
        Some(path) => {
            let calibration = if path.extension().map_or(false, |ext| ext == "txt") {
                RBCalibration::from_txtfile(path)
            } else {
                RBCalibration::from_file(path)
            }
            .with_context(|| format!("failed to load calibration {:?}", path))?;
            Some(calibration)
        }
        None => None,
    };

    if opt.telemetry {
        scan_telemetry(&opt)
    } else {
        scan_tof(&opt, calibration.as_ref())
    }
}

fn scan_tof(opt: &Opt, calibration: Option<&RBCalibration>) -> Result<()> {
    let mut reader = TofPacketReader::new(opt.files.clone());

    if opt.index {
        let index = reader.index().clone();
        let mut tags: Vec<_> = index.counts.iter().collect();
        tags.sort();
        for (tag, count) in tags {
            println!("{:<20} {}", PacketType::from(*tag).to_string(), count);
        }
        println!("{:<20} {}", "total", index.total());
        return Ok(());
    }

    let mut seen = 0usize;
    for packet in reader.by_ref() {
        println!("{}", packet);
        match packet.packet_type {
            PacketType::TofEvent => match TofEvent::from_tofpacket(&packet) {
                Ok(event) => {
                    println!("  {}", event);
                    if let Some(calibration) = calibration {
                        summarize_event(&event, calibration);
                    }
                }
                Err(error) => println!("  ! event does not decode: {}", error),
            },
            PacketType::RBMoniData => {
                if let Ok(moni) = RBMoniData::from_tofpacket(&packet) {
                    println!("  {}", moni);
                }
            }
            PacketType::MtbMoniData => {
                if let Ok(moni) = MtbMoniData::from_tofpacket(&packet) {
                    println!("  {}", moni);
                }
            }
            _ => {}
        }
        seen += 1;
        if opt.npackets.map_or(false, |n| seen >= n) {
            break;
        }
    }
    if reader.n_errors > 0 {
        eprintln!(
            "{} malformed regions, {} bytes skipped",
            reader.n_errors, reader.bytes_skipped
        );
    }
    Ok(())
}

fn summarize_event(event: &TofEvent, calibration: &RBCalibration) {
    for rb_event in &event.rb_events {
        if rb_event.header.rb_id as u8 != calibration.rb_id {
            continue;
        }
        let voltages = calibration.voltages(rb_event, true);
        let times = calibration.nanoseconds(rb_event);
        for (wf, (v, t)) in rb_event.waveforms.iter().zip(voltages.iter().zip(&times)) {
            match summarize_pulse(v, t) {
                Some(pulse) => println!(
                    "  ch {}: peak {:7.2} mV, charge {:9.2}, t {:7.2} ns{}",
                    wf.channel,
                    pulse.peak_mv,
                    pulse.charge,
                    pulse.cfd_time_ns,
                    if wf.crc_ok { "" } else { "  [CRC!]" }
                ),
                None => println!("  ch {}: trace too short to summarize", wf.channel),
            }
        }
    }
}

fn scan_telemetry(opt: &Opt) -> Result<()> {
    let mut reader = TelemetryPacketReader::new(opt.files.clone());

    if opt.index {
        let mut counts = std::collections::HashMap::new();
        for packet in reader.by_ref() {
            *counts.entry(packet.packet_type()).or_insert(0usize) += 1;
        }
        let mut tags: Vec<_> = counts.into_iter().collect();
        tags.sort_by_key(|(tag, _)| tag.to_u8());
        for (tag, count) in tags {
            println!("{:<20} {}", tag.to_string(), count);
        }
        return Ok(());
    }

    let mut seen = 0usize;
    for packet in reader.by_ref() {
        println!("{}", packet);
        if let Some(merged) = safe_unpack_merged_event(&packet) {
            println!("  {}", merged);
        } else if let Some(inner) = unpack_tof_housekeeping(&packet) {
            println!("  wraps {}", inner);
        }
        seen += 1;
        if opt.npackets.map_or(false, |n| seen >= n) {
            break;
        }
    }
    if reader.n_errors > 0 {
        eprintln!(
            "{} malformed regions, {} bytes skipped",
            reader.n_errors, reader.bytes_skipped
        );
    }
    Ok(())
}
