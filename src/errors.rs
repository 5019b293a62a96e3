//! Error types returned by this crate.
//!
//! Decoding never unwinds: each failure mode is a variant here and every
//! decode path returns a `Result`. The merger converts packet-level errors
//! into counters and log events; only configuration-level problems
//! ([`MergeError`]) abort a run.

use std::io;
use std::path::PathBuf;

/// A byte stream failed to parse as a packet.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PacketError {
    /// The input ended inside a packet. Recoverable by advancing the
    /// scanner by one byte.
    #[error("input ended inside a packet: needed {needed} more bytes, {have} available")]
    Truncated { needed: usize, have: usize },

    /// The head marker literal is wrong.
    #[error("malformed head marker: {found:#06x}")]
    MalformedHeader { found: u16 },

    /// The tail marker at the length-derived offset is wrong.
    #[error("tail marker mismatch at offset {offset}: {found:#06x}")]
    TailMismatch { found: u16, offset: usize },

    /// A stored CRC32 does not match the one computed over the covered
    /// bytes.
    #[error("CRC32 mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    /// A telemetry header checksum does not match the payload.
    #[error("checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    /// A typed unpack was attempted on an envelope with a different tag.
    #[error("packet type tag {found} cannot be unpacked as {wanted}")]
    UnexpectedTag { found: u8, wanted: &'static str },

    /// A typed payload failed to decode beyond the envelope level.
    #[error("while decoding {context}: {reason}")]
    Decode {
        context: &'static str,
        reason: String,
    },
}

/// A calibration file failed to load or is internally inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("I/O error reading calibration: {0}")]
    Io(#[from] io::Error),

    #[error("calibration text line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// The file does not hold 4 tables x 9 channels x 1024 cells.
    #[error("calibration shape mismatch: expected {expected} values, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    /// Time-bin widths must be strictly positive.
    #[error("non-positive time bin: channel {channel}, cell {cell}")]
    NonPositiveTimeBin { channel: usize, cell: usize },

    #[error("binary calibration failed to decode: {0}")]
    Packet(#[from] PacketError),

    /// A calibration lookup by board id came up empty. Affected
    /// waveforms stay un-calibrated.
    #[error("no calibration for readout board {0}")]
    Missing(u8),

    /// No board id could be extracted from the file name.
    #[error("cannot extract a board id from file name {0}")]
    UnknownBoardId(String),
}

/// Fatal merger-level failures. Everything recoverable is a counter, not
/// an error.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no usable input files in {0}")]
    EmptyInput(PathBuf),

    #[error("output path {0} is not writeable")]
    OutputUnwritable(PathBuf),

    #[error("calibration problem: {0}")]
    Calibration(#[from] CalibrationError),

    /// Neither stream yielded a single decodable event, so no alignment
    /// point exists.
    #[error("no alignment point: {0}")]
    NoAlignment(&'static str),
}
