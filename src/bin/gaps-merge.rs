//! Offline merger of the TOF-local file stream with the telemetry
//! stream, producing one frame per event id.

use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use tof_gaps::errors::MergeError;
use tof_gaps::io;
use tof_gaps::merge::{Context, EventMerger, MergeConfig, MergeSummary};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "gaps-merge",
    about = "Re-assembles one coherent event stream from the TOF-local files of a run and the telemetry binaries covering the same time span. One frame is written per TOF event id; matching telemetry events and interleaved housekeeping are attached to it."
)]
struct Opt {
    #[structopt(parse(from_os_str), help = "Directory with telemetry binaries (RAW*.bin)")]
    telemetry_dir: PathBuf,

    #[structopt(
        parse(from_os_str),
        help = "Directory with per-run TOF data directories (*.tof.gaps)"
    )]
    tof_dir: PathBuf,

    #[structopt(help = "TOF run id, e.g. as stated in the e-log")]
    run_id: u32,

    #[structopt(
        short = "s",
        long,
        help = "Run start time as seconds since epoch; telemetry before this is discarded"
    )]
    start_time: Option<u32>,

    #[structopt(short = "e", long, help = "Run end time as seconds since epoch")]
    end_time: Option<u32>,

    #[structopt(
        short,
        long,
        parse(from_os_str),
        default_value = ".",
        help = "Directory below which the <run_id>/ output directory is created"
    )]
    outdir: PathBuf,

    #[structopt(
        long,
        help = "Recalculate waveform calibration and hits for every TOF event, storing the result next to the original packet"
    )]
    reprocess: bool,

    #[structopt(
        long,
        parse(from_os_str),
        help = "Directory with per-board calibrations (rb{N}_*), required for --reprocess"
    )]
    calibration_dir: Option<PathBuf>,

    #[structopt(
        long,
        default_value = "100000",
        help = "Soft ceiling on the combined skew-buffer population"
    )]
    buffer_ceiling: usize,

    #[structopt(short, long, help = "More verbose output")]
    verbose: bool,
}

fn main() {
    let opt = Opt::from_args();
    let default_level = if opt.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(opt) {
        Ok(summary) => {
            println!("{}", summary);
            if summary.buffer_overflowed {
                process::exit(3);
            }
        }
        Err(error) => {
            eprintln!("gaps-merge failed: {}", error);
            let code = match error {
                MergeError::Io(_) | MergeError::OutputUnwritable(_) => 2,
                _ => 1,
            };
            process::exit(code);
        }
    }
}

fn run(opt: Opt) -> Result<MergeSummary, MergeError> {
    let tof_files = io::get_tof_binaries(&opt.tof_dir, opt.run_id)?;
    if tof_files.is_empty() {
        return Err(MergeError::EmptyInput(opt.tof_dir));
    }
    let telemetry_files =
        io::get_telemetry_binaries(&opt.telemetry_dir, opt.start_time, opt.end_time)?;
    if telemetry_files.is_empty() {
        return Err(MergeError::EmptyInput(opt.telemetry_dir));
    }

    let config = MergeConfig {
        run_id: opt.run_id,
        outdir: opt.outdir,
        start_time: opt.start_time,
        end_time: opt.end_time,
        reprocess: opt.reprocess,
        buffer_ceiling: opt.buffer_ceiling,
        ..MergeConfig::default()
    };
    let mut ctx = Context::new(config);
    if let Some(calibration_dir) = &opt.calibration_dir {
        ctx.load_calibrations(calibration_dir)?;
    } else if opt.reprocess {
        log::warn!("--reprocess without --calibration-dir: waveforms will stay raw");
    }

    let merger = EventMerger::new(tof_files, telemetry_files, ctx);
    merger.run()
}
