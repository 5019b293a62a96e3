//! # `tof-gaps`
//!
//! A decoder, calibration engine and offline event merger for DRS4-based
//! time-of-flight readout data.
//!
//! Common abbreviations:
//!
//! - DRS4: switched-capacitor waveform digitizer, 1024-cell ring buffer;
//! - RB: readout board, one DRS4 plus FPGA;
//! - MTB: master trigger board, source of the authoritative event id;
//! - GCU: ground computer unit, stamps telemetry packets with `gcutime`;
//!
//! The crate covers three tightly coupled layers:
//!
//! - **Codec & readers** ([`packets`], [`telemetry`], [`events`], [`io`]):
//!   the length-delimited, CRC-checked wire formats of the TOF-local
//!   `.tof.gaps` files and the telemetry `RAW*.bin` files, plus lazy,
//!   restartable packet readers over ordered file lists.
//! - **Calibration & waveforms** ([`calibration`], [`waveform`]): per-board
//!   voltage/timing constants, their text and binary file formats, DRS4
//!   spike removal and pulse measurements.
//! - **Merging** ([`merge`], [`frame`]): the two-pass, skew-buffered
//!   alignment of the TOF stream with the telemetry stream by event id,
//!   writing tag-keyed frames as the archival output.
//!
//! Reading a file of TOF packets is a one-liner per packet:
//!
//! ```no_run
//! use tof_gaps::io::TofPacketReader;
//! use tof_gaps::{PacketType, TofEvent};
//!
//! let reader = TofPacketReader::from_file("Run117_0.240712_094325UTC.tof.gaps")
//!     .with_filter(&[PacketType::TofEvent]);
//! for packet in reader {
//!     let event = TofEvent::from_tofpacket(&packet).unwrap();
//!     println!("{}", event);
//! }
//! ```

pub mod calibration;
pub mod errors;
pub mod events;
pub mod frame;
pub mod io;
pub mod merge;
pub mod moni;
pub mod packets;
pub mod telemetry;
pub mod waveform;
mod wire;

pub use calibration::RBCalibration;
pub use errors::{CalibrationError, MergeError, PacketError};
pub use events::{
    MasterTriggerEvent, RBEvent, RBEventHeader, RBWaveform, TofEvent, TofEventSummary, TofHit,
    TriggerHit, NCHN, NWORDS,
};
pub use frame::{Frame, FrameReader, FrameWriter};
pub use merge::{Context, EventMerger, MergeConfig, MergeSummary};
pub use packets::{Packable, PacketType, TofPacket};
pub use telemetry::{MergedEvent, TelemetryPacket, TelemetryPacketType};
pub use waveform::Waveform;
