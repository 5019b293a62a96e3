//! Per-board DRS4 calibration: loading, storing and applying the
//! voltage/timing constants.
//!
//! Each readout board ships four 9x1024 tables (channels x cells):
//! per-cell ADC offsets, second-order dips, gains in mV/ADC and time-bin
//! widths in ns. The offset table is rotated by the stop cell before
//! application:
//!
//! ```text
//! v[i] = (adc[i] - offset[(i + stop) % 1024] - dip[i]) * incr[i]
//! t[0] = 0,  t[i] = t[i-1] + t_bin[(i - 1 + stop) % 1024]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::errors::{CalibrationError, PacketError};
use crate::events::{RBEvent, NCHN, NWORDS};
use crate::packets::{Packable, PacketType, TofPacket};
use crate::waveform::{self, Waveform, SPIKE_THRESHOLD_MV};
use crate::wire::{self, CRC32, HEAD, TAIL};

/// Nominal time-bin width at 2 GS/s, ns.
pub const NOMINAL_TBIN_NS: f32 = 0.5;

const TABLES: usize = 4;
const BINARY_VERSION: u8 = 1;

/// The four calibration tables of one readout board.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RBCalibration {
    pub rb_id: u8,
    /// Per-cell ADC offsets, rotated by the stop cell on application.
    pub v_offsets: Vec<Vec<f32>>,
    /// Second-order readout offsets in ADC, unrotated.
    pub v_dips: Vec<Vec<f32>>,
    /// Per-cell gains in mV/ADC.
    pub v_incs: Vec<Vec<f32>>,
    /// Per-cell time widths in ns.
    pub t_bin: Vec<Vec<f32>>,
}

impl RBCalibration {
    /// An identity calibration: zero offsets, unit gain, nominal bins.
    pub fn new(rb_id: u8) -> Self {
        RBCalibration {
            rb_id,
            v_offsets: vec![vec![0.0; NWORDS]; NCHN],
            v_dips: vec![vec![0.0; NWORDS]; NCHN],
            v_incs: vec![vec![1.0; NWORDS]; NCHN],
            t_bin: vec![vec![NOMINAL_TBIN_NS; NWORDS]; NCHN],
        }
    }

    /// Loads the legacy whitespace text format: 36 lines of at least
    /// 1024 columns; lines 0-8 offsets, 9-17 dips, 18-26 increments,
    /// 27-35 time bins.
    pub fn from_txtfile<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let rb_id = rb_id_from_filename(path).unwrap_or(0);

        let mut rows: Vec<Vec<f32>> = Vec::with_capacity(TABLES * NCHN);
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut row = Vec::with_capacity(NWORDS);
            for column in line.split_whitespace() {
                let value: f32 = column.parse().map_err(|_| CalibrationError::Parse {
                    line: lineno + 1,
                    reason: format!("not a number: {:?}", column),
                })?;
                row.push(value);
            }
            if row.len() < NWORDS {
                return Err(CalibrationError::Parse {
                    line: lineno + 1,
                    reason: format!("{} columns, expected at least {}", row.len(), NWORDS),
                });
            }
            row.truncate(NWORDS);
            rows.push(row);
        }
        if rows.len() != TABLES * NCHN {
            return Err(CalibrationError::ShapeMismatch {
                expected: TABLES * NCHN * NWORDS,
                found: rows.len() * NWORDS,
            });
        }

        let mut rows = rows.into_iter();
        let mut table = |_kind: usize| -> Vec<Vec<f32>> { rows.by_ref().take(NCHN).collect() };
        let calibration = RBCalibration {
            rb_id,
            v_offsets: table(0),
            v_dips: table(1),
            v_incs: table(2),
            t_bin: table(3),
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Writes the legacy text format next to what
    /// [`RBCalibration::from_txtfile`] reads.
    pub fn to_txtfile<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        let mut out = String::new();
        for table in [&self.v_offsets, &self.v_dips, &self.v_incs, &self.t_bin] {
            for row in table.iter() {
                let line: Vec<String> = row.iter().map(|v| format!("{}", v)).collect();
                out.push_str(&line.join(" "));
                out.push('\n');
            }
        }
        fs::write(path, out)?;
        Ok(())
    }

    /// Loads the compact binary form.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let stream = fs::read(path)?;
        let mut pos = 0;
        let calibration = Self::from_bytestream(&stream, &mut pos)?;
        calibration.validate()?;
        Ok(calibration)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        fs::write(path, self.to_bytestream())?;
        Ok(())
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let head = wire::take_u16(stream, pos)?;
        if head != HEAD {
            return Err(PacketError::MalformedHeader { found: head });
        }
        let version = wire::take_u8(stream, pos)?;
        if version != BINARY_VERSION {
            return Err(PacketError::Decode {
                context: "RBCalibration",
                reason: format!("unsupported binary version {}", version),
            });
        }
        let rb_id = wire::take_u16(stream, pos)? as u8;
        let table_start = *pos;
        let mut tables: Vec<Vec<Vec<f32>>> = Vec::with_capacity(TABLES);
        for _ in 0..TABLES {
            let mut table = Vec::with_capacity(NCHN);
            for _ in 0..NCHN {
                let mut row = Vec::with_capacity(NWORDS);
                for _ in 0..NWORDS {
                    row.push(wire::take_f32(stream, pos)?);
                }
                table.push(row);
            }
            tables.push(table);
        }
        let stored_crc = wire::take_u32_swapped(stream, pos)?;
        let computed_crc = CRC32.checksum(&stream[table_start..table_start + TABLES * NCHN * NWORDS * 4]);
        if stored_crc != computed_crc {
            return Err(PacketError::CrcMismatch {
                stored: stored_crc,
                computed: computed_crc,
            });
        }
        let tail = wire::take_u16(stream, pos)?;
        if tail != TAIL {
            return Err(PacketError::TailMismatch {
                found: tail,
                offset: *pos - 2,
            });
        }
        let t_bin = tables.pop().unwrap();
        let v_incs = tables.pop().unwrap();
        let v_dips = tables.pop().unwrap();
        let v_offsets = tables.pop().unwrap();
        Ok(RBCalibration {
            rb_id,
            v_offsets,
            v_dips,
            v_incs,
            t_bin,
        })
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(5 + TABLES * NCHN * NWORDS * 4 + 6);
        wire::put_u16(&mut stream, HEAD);
        stream.push(BINARY_VERSION);
        wire::put_u16(&mut stream, self.rb_id as u16);
        let table_start = stream.len();
        for table in [&self.v_offsets, &self.v_dips, &self.v_incs, &self.t_bin] {
            for row in table.iter() {
                for &value in row.iter() {
                    wire::put_f32(&mut stream, value);
                }
            }
        }
        let crc = CRC32.checksum(&stream[table_start..]);
        wire::put_u32_swapped(&mut stream, crc);
        wire::put_u16(&mut stream, TAIL);
        stream
    }

    /// Shape and positivity checks applied after every load.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        for table in [&self.v_offsets, &self.v_dips, &self.v_incs, &self.t_bin] {
            if table.len() != NCHN || table.iter().any(|row| row.len() != NWORDS) {
                let found: usize = table.iter().map(|row| row.len()).sum();
                return Err(CalibrationError::ShapeMismatch {
                    expected: NCHN * NWORDS,
                    found,
                });
            }
        }
        for (channel, row) in self.t_bin.iter().enumerate() {
            for (cell, &width) in row.iter().enumerate() {
                if width <= 0.0 {
                    return Err(CalibrationError::NonPositiveTimeBin { channel, cell });
                }
            }
        }
        Ok(())
    }

    /// Applies the voltage calibration to one channel's raw trace.
    pub fn voltages_of(&self, channel: u8, adc: &[u16], stop_cell: u16) -> Vec<f64> {
        let ch = channel as usize % NCHN;
        let stop = stop_cell as usize;
        let offsets = &self.v_offsets[ch];
        let dips = &self.v_dips[ch];
        let incs = &self.v_incs[ch];
        adc.iter()
            .enumerate()
            .map(|(i, &raw)| {
                let rolled = offsets[(i + stop) % NWORDS] as f64;
                (raw as f64 - rolled - dips[i % NWORDS] as f64) * incs[i % NWORDS] as f64
            })
            .collect()
    }

    /// Cumulative sample times for one channel, ns, starting at 0.
    pub fn nanoseconds_of(&self, channel: u8, trace_len: usize, stop_cell: u16) -> Vec<f64> {
        let ch = channel as usize % NCHN;
        let stop = stop_cell as usize;
        let widths = &self.t_bin[ch];
        let mut times = Vec::with_capacity(trace_len);
        let mut t = 0.0f64;
        times.push(t);
        for i in 1..trace_len {
            t += widths[(i - 1 + stop) % NWORDS] as f64;
            times.push(t);
        }
        times
    }

    /// Fills the calibrated views of one waveform. Recomputes from the
    /// raw trace every time, so repeated application is idempotent.
    pub fn calibrate(&self, wf: &mut Waveform) {
        wf.voltages = Some(self.voltages_of(wf.channel, &wf.adc, wf.stop_cell));
        wf.times = Some(self.nanoseconds_of(wf.channel, wf.adc.len(), wf.stop_cell));
    }

    /// Calibrates every waveform of a board event, optionally removing
    /// DRS4 spikes across the channels afterwards.
    pub fn calibrate_event(&self, event: &mut RBEvent, spike_cleaning: bool) {
        for wf in &mut event.waveforms {
            self.calibrate(wf);
        }
        if spike_cleaning {
            waveform::clean_event_spikes(&mut event.waveforms, SPIKE_THRESHOLD_MV);
        }
    }

    /// Calibrated voltages for all readout channels of `event`, in
    /// channel order. Convenience for inspection tools.
    pub fn voltages(&self, event: &RBEvent, spike_cleaning: bool) -> Vec<Vec<f64>> {
        let mut traces: Vec<Vec<f64>> = event
            .waveforms
            .iter()
            .map(|wf| self.voltages_of(wf.channel, &wf.adc, wf.stop_cell))
            .collect();
        if spike_cleaning {
            waveform::clean_spikes(&mut traces, SPIKE_THRESHOLD_MV);
        }
        traces
    }

    /// Sample times for all readout channels of `event`.
    pub fn nanoseconds(&self, event: &RBEvent) -> Vec<Vec<f64>> {
        event
            .waveforms
            .iter()
            .map(|wf| self.nanoseconds_of(wf.channel, wf.adc.len(), wf.stop_cell))
            .collect()
    }
}

impl Packable for RBCalibration {
    const PACKET_TYPE: PacketType = PacketType::RBCalibration;

    fn to_bytestream(&self) -> Vec<u8> {
        RBCalibration::to_bytestream(self)
    }
}

impl fmt::Display for RBCalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<RBCalibration RB {:02}>", self.rb_id)
    }
}

/// Unpacks a calibration from its envelope.
impl RBCalibration {
    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        if packet.packet_type != PacketType::RBCalibration {
            return Err(PacketError::UnexpectedTag {
                found: packet.packet_type.to_u8(),
                wanted: "RBCalibration",
            });
        }
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

/// Extracts the board id from calibration file names like `rb04_cal.txt`
/// or `rb4_latest.cal`.
pub fn rb_id_from_filename(path: &Path) -> Option<u8> {
    let name = path.file_name()?.to_str()?;
    let pattern = Regex::new(r"(?i)rb(\d+)_").expect("static regex");
    pattern
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|id| id.as_str().parse().ok())
}

/// Loads every calibration in a directory, keyed by board id.
///
/// Files named `rb{N}_*` are considered; `.txt` files are parsed as the
/// legacy text format, everything else as the compact binary form. Files
/// that fail to load are skipped with a warning so a single corrupt
/// calibration cannot take down a reprocessing run.
pub fn load_calibrations<P: AsRef<Path>>(
    directory: P,
) -> Result<HashMap<u8, RBCalibration>, CalibrationError> {
    let mut calibrations = HashMap::new();
    for entry in fs::read_dir(directory.as_ref())? {
        let path = entry?.path();
        let rb_id = match rb_id_from_filename(&path) {
            Some(id) => id,
            None => continue,
        };
        let loaded = if path.extension().map_or(false, |ext| ext == "txt") {
            RBCalibration::from_txtfile(&path)
        } else {
            RBCalibration::from_file(&path)
        };
        match loaded {
            Ok(mut calibration) => {
                calibration.rb_id = rb_id;
                calibrations.insert(rb_id, calibration);
            }
            Err(error) => {
                log::warn!("skipping calibration {}: {}", path.display(), error);
            }
        }
    }
    log::info!("loaded {} board calibrations", calibrations.len());
    Ok(calibrations)
}
