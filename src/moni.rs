//! Housekeeping (monitoring) payloads and a uniform tabular view over
//! them.
//!
//! Every board family has a typed sensor block here, along with the
//! periodic heartbeat counters of the master trigger and the event
//! builder. Unknown housekeeping variants still travel through readers,
//! merger and frames as opaque payloads. Series of housekeeping readings
//! are collected in a [`MoniSeries`], which offers the same three
//! operations regardless of the row type: `stack`, `column` and `len`.

use std::fmt;

use crate::errors::PacketError;
use crate::packets::{Packable, PacketType, TofPacket};
use crate::wire;

/// A housekeeping row that can expose its fields as named columns.
pub trait MoniData: Sized {
    /// Column names, in a fixed order.
    fn columns() -> &'static [&'static str];

    /// Value of one column, `None` for unknown names.
    fn get(&self, column: &str) -> Option<f64>;
}

fn check_tag(
    packet: &TofPacket,
    expected: PacketType,
    wanted: &'static str,
) -> Result<(), PacketError> {
    if packet.packet_type != expected {
        return Err(PacketError::UnexpectedTag {
            found: packet.packet_type.to_u8(),
            wanted,
        });
    }
    Ok(())
}

/// Sensor block broadcast periodically by every readout board.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RBMoniData {
    pub board_id: u8,
    /// Trigger rate seen by the board, Hz.
    pub rate: u16,
    pub tmp_drs: f32,
    pub tmp_clk: f32,
    pub tmp_adc: f32,
    pub tmp_zynq: f32,
    pub tmp_lis3mdltr: f32,
    pub tmp_bm280: f32,
    pub pressure: f32,
    pub humidity: f32,
    pub mag_x: f32,
    pub mag_y: f32,
    pub mag_z: f32,
    pub drs_dvdd_voltage: f32,
    pub drs_dvdd_current: f32,
    pub p3v3_voltage: f32,
    pub p3v3_current: f32,
    pub p3v5_voltage: f32,
    pub p3v5_current: f32,
    pub zynq_voltage: f32,
    pub zynq_current: f32,
}

impl RBMoniData {
    pub fn new(board_id: u8) -> Self {
        RBMoniData {
            board_id,
            rate: 0,
            tmp_drs: 0.0,
            tmp_clk: 0.0,
            tmp_adc: 0.0,
            tmp_zynq: 0.0,
            tmp_lis3mdltr: 0.0,
            tmp_bm280: 0.0,
            pressure: 0.0,
            humidity: 0.0,
            mag_x: 0.0,
            mag_y: 0.0,
            mag_z: 0.0,
            drs_dvdd_voltage: 0.0,
            drs_dvdd_current: 0.0,
            p3v3_voltage: 0.0,
            p3v3_current: 0.0,
            p3v5_voltage: 0.0,
            p3v5_current: 0.0,
            zynq_voltage: 0.0,
            zynq_current: 0.0,
        }
    }

    /// Total magnetic field from the three LIS3MDLTR axes.
    pub fn mag_tot(&self) -> f32 {
        (self.mag_x * self.mag_x + self.mag_y * self.mag_y + self.mag_z * self.mag_z).sqrt()
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(3 + 19 * 4);
        stream.push(self.board_id);
        wire::put_u16(&mut stream, self.rate);
        for value in [
            self.tmp_drs,
            self.tmp_clk,
            self.tmp_adc,
            self.tmp_zynq,
            self.tmp_lis3mdltr,
            self.tmp_bm280,
            self.pressure,
            self.humidity,
            self.mag_x,
            self.mag_y,
            self.mag_z,
            self.drs_dvdd_voltage,
            self.drs_dvdd_current,
            self.p3v3_voltage,
            self.p3v3_current,
            self.p3v5_voltage,
            self.p3v5_current,
            self.zynq_voltage,
            self.zynq_current,
        ] {
            wire::put_f32(&mut stream, value);
        }
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let board_id = wire::take_u8(stream, pos)?;
        let rate = wire::take_u16(stream, pos)?;
        let mut values = [0.0f32; 19];
        for value in values.iter_mut() {
            *value = wire::take_f32(stream, pos)?;
        }
        Ok(RBMoniData {
            board_id,
            rate,
            tmp_drs: values[0],
            tmp_clk: values[1],
            tmp_adc: values[2],
            tmp_zynq: values[3],
            tmp_lis3mdltr: values[4],
            tmp_bm280: values[5],
            pressure: values[6],
            humidity: values[7],
            mag_x: values[8],
            mag_y: values[9],
            mag_z: values[10],
            drs_dvdd_voltage: values[11],
            drs_dvdd_current: values[12],
            p3v3_voltage: values[13],
            p3v3_current: values[14],
            p3v5_voltage: values[15],
            p3v5_current: values[16],
            zynq_voltage: values[17],
            zynq_current: values[18],
        })
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        check_tag(packet, PacketType::RBMoniData, "RBMoniData")?;
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Packable for RBMoniData {
    const PACKET_TYPE: PacketType = PacketType::RBMoniData;

    fn to_bytestream(&self) -> Vec<u8> {
        RBMoniData::to_bytestream(self)
    }
}

impl MoniData for RBMoniData {
    fn columns() -> &'static [&'static str] {
        &[
            "board_id",
            "rate",
            "tmp_drs",
            "tmp_clk",
            "tmp_adc",
            "tmp_zynq",
            "tmp_lis3mdltr",
            "tmp_bm280",
            "pressure",
            "humidity",
            "mag_x",
            "mag_y",
            "mag_z",
            "mag_tot",
            "drs_dvdd_voltage",
            "drs_dvdd_current",
            "p3v3_voltage",
            "p3v3_current",
            "p3v5_voltage",
            "p3v5_current",
            "zynq_voltage",
            "zynq_current",
        ]
    }

    fn get(&self, column: &str) -> Option<f64> {
        let value = match column {
            "board_id" => self.board_id as f64,
            "rate" => self.rate as f64,
            "tmp_drs" => self.tmp_drs as f64,
            "tmp_clk" => self.tmp_clk as f64,
            "tmp_adc" => self.tmp_adc as f64,
            "tmp_zynq" => self.tmp_zynq as f64,
            "tmp_lis3mdltr" => self.tmp_lis3mdltr as f64,
            "tmp_bm280" => self.tmp_bm280 as f64,
            "pressure" => self.pressure as f64,
            "humidity" => self.humidity as f64,
            "mag_x" => self.mag_x as f64,
            "mag_y" => self.mag_y as f64,
            "mag_z" => self.mag_z as f64,
            "mag_tot" => self.mag_tot() as f64,
            "drs_dvdd_voltage" => self.drs_dvdd_voltage as f64,
            "drs_dvdd_current" => self.drs_dvdd_current as f64,
            "p3v3_voltage" => self.p3v3_voltage as f64,
            "p3v3_current" => self.p3v3_current as f64,
            "p3v5_voltage" => self.p3v5_voltage as f64,
            "p3v5_current" => self.p3v5_current as f64,
            "zynq_voltage" => self.zynq_voltage as f64,
            "zynq_current" => self.zynq_current as f64,
            _ => return None,
        };
        Some(value)
    }
}

impl fmt::Display for RBMoniData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<RBMoniData RB {:02} rate {} Hz, DRS {:.1} C>",
            self.board_id, self.rate, self.tmp_drs
        )
    }
}

/// Sensor block of the master trigger board.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MtbMoniData {
    pub fpga_temp: f32,
    pub fpga_vccint: f32,
    pub fpga_vccaux: f32,
    pub fpga_vccbram: f32,
    /// Trigger rate, Hz.
    pub rate: u16,
    /// Rate of triggers lost to busy, Hz.
    pub lost_rate: u16,
    pub tiu_busy_len: u32,
    pub tiu_status: u8,
}

impl MtbMoniData {
    pub fn new() -> Self {
        MtbMoniData {
            fpga_temp: 0.0,
            fpga_vccint: 0.0,
            fpga_vccaux: 0.0,
            fpga_vccbram: 0.0,
            rate: 0,
            lost_rate: 0,
            tiu_busy_len: 0,
            tiu_status: 0,
        }
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(4 * 4 + 9);
        for value in [
            self.fpga_temp,
            self.fpga_vccint,
            self.fpga_vccaux,
            self.fpga_vccbram,
        ] {
            wire::put_f32(&mut stream, value);
        }
        wire::put_u16(&mut stream, self.rate);
        wire::put_u16(&mut stream, self.lost_rate);
        wire::put_u32(&mut stream, self.tiu_busy_len);
        stream.push(self.tiu_status);
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let fpga_temp = wire::take_f32(stream, pos)?;
        let fpga_vccint = wire::take_f32(stream, pos)?;
        let fpga_vccaux = wire::take_f32(stream, pos)?;
        let fpga_vccbram = wire::take_f32(stream, pos)?;
        let rate = wire::take_u16(stream, pos)?;
        let lost_rate = wire::take_u16(stream, pos)?;
        let tiu_busy_len = wire::take_u32(stream, pos)?;
        let tiu_status = wire::take_u8(stream, pos)?;
        Ok(MtbMoniData {
            fpga_temp,
            fpga_vccint,
            fpga_vccaux,
            fpga_vccbram,
            rate,
            lost_rate,
            tiu_busy_len,
            tiu_status,
        })
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        check_tag(packet, PacketType::MtbMoniData, "MtbMoniData")?;
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Default for MtbMoniData {
    fn default() -> Self {
        Self::new()
    }
}

impl Packable for MtbMoniData {
    const PACKET_TYPE: PacketType = PacketType::MtbMoniData;

    fn to_bytestream(&self) -> Vec<u8> {
        MtbMoniData::to_bytestream(self)
    }
}

impl MoniData for MtbMoniData {
    fn columns() -> &'static [&'static str] {
        &[
            "fpga_temp",
            "fpga_vccint",
            "fpga_vccaux",
            "fpga_vccbram",
            "rate",
            "lost_rate",
            "tiu_busy_len",
            "tiu_status",
        ]
    }

    fn get(&self, column: &str) -> Option<f64> {
        let value = match column {
            "fpga_temp" => self.fpga_temp as f64,
            "fpga_vccint" => self.fpga_vccint as f64,
            "fpga_vccaux" => self.fpga_vccaux as f64,
            "fpga_vccbram" => self.fpga_vccbram as f64,
            "rate" => self.rate as f64,
            "lost_rate" => self.lost_rate as f64,
            "tiu_busy_len" => self.tiu_busy_len as f64,
            "tiu_status" => self.tiu_status as f64,
            _ => return None,
        };
        Some(value)
    }
}

impl fmt::Display for MtbMoniData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<MtbMoniData rate {} Hz, lost {} Hz, FPGA {:.1} C>",
            self.rate, self.lost_rate, self.fpga_temp
        )
    }
}

/// Sensor block of a power board, serving one readout-board tray.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PBMoniData {
    pub board_id: u8,
    pub p3v6_voltage: f32,
    pub p3v6_current: f32,
    pub n1v6_voltage: f32,
    pub n1v6_current: f32,
    pub pds_temp: f32,
    pub pas_temp: f32,
    pub nas_temp: f32,
    pub shv_temp: f32,
}

impl PBMoniData {
    pub fn new(board_id: u8) -> Self {
        PBMoniData {
            board_id,
            p3v6_voltage: 0.0,
            p3v6_current: 0.0,
            n1v6_voltage: 0.0,
            n1v6_current: 0.0,
            pds_temp: 0.0,
            pas_temp: 0.0,
            nas_temp: 0.0,
            shv_temp: 0.0,
        }
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(1 + 8 * 4);
        stream.push(self.board_id);
        for value in [
            self.p3v6_voltage,
            self.p3v6_current,
            self.n1v6_voltage,
            self.n1v6_current,
            self.pds_temp,
            self.pas_temp,
            self.nas_temp,
            self.shv_temp,
        ] {
            wire::put_f32(&mut stream, value);
        }
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let board_id = wire::take_u8(stream, pos)?;
        let mut values = [0.0f32; 8];
        for value in values.iter_mut() {
            *value = wire::take_f32(stream, pos)?;
        }
        Ok(PBMoniData {
            board_id,
            p3v6_voltage: values[0],
            p3v6_current: values[1],
            n1v6_voltage: values[2],
            n1v6_current: values[3],
            pds_temp: values[4],
            pas_temp: values[5],
            nas_temp: values[6],
            shv_temp: values[7],
        })
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        check_tag(packet, PacketType::PBMoniData, "PBMoniData")?;
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Packable for PBMoniData {
    const PACKET_TYPE: PacketType = PacketType::PBMoniData;

    fn to_bytestream(&self) -> Vec<u8> {
        PBMoniData::to_bytestream(self)
    }
}

impl MoniData for PBMoniData {
    fn columns() -> &'static [&'static str] {
        &[
            "board_id",
            "p3v6_voltage",
            "p3v6_current",
            "n1v6_voltage",
            "n1v6_current",
            "pds_temp",
            "pas_temp",
            "nas_temp",
            "shv_temp",
        ]
    }

    fn get(&self, column: &str) -> Option<f64> {
        let value = match column {
            "board_id" => self.board_id as f64,
            "p3v6_voltage" => self.p3v6_voltage as f64,
            "p3v6_current" => self.p3v6_current as f64,
            "n1v6_voltage" => self.n1v6_voltage as f64,
            "n1v6_current" => self.n1v6_current as f64,
            "pds_temp" => self.pds_temp as f64,
            "pas_temp" => self.pas_temp as f64,
            "nas_temp" => self.nas_temp as f64,
            "shv_temp" => self.shv_temp as f64,
            _ => return None,
        };
        Some(value)
    }
}

/// Preamp sensor block: one temperature and one bias voltage per
/// preamp channel of a tray.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PAMoniData {
    pub board_id: u8,
    pub temps: [f32; 16],
    pub biases: [f32; 16],
}

impl PAMoniData {
    pub fn new(board_id: u8) -> Self {
        PAMoniData {
            board_id,
            temps: [0.0; 16],
            biases: [0.0; 16],
        }
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(1 + 32 * 4);
        stream.push(self.board_id);
        for value in self.temps.iter().chain(self.biases.iter()) {
            wire::put_f32(&mut stream, *value);
        }
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let board_id = wire::take_u8(stream, pos)?;
        let mut moni = PAMoniData::new(board_id);
        for value in moni.temps.iter_mut() {
            *value = wire::take_f32(stream, pos)?;
        }
        for value in moni.biases.iter_mut() {
            *value = wire::take_f32(stream, pos)?;
        }
        Ok(moni)
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        check_tag(packet, PacketType::PAMoniData, "PAMoniData")?;
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Packable for PAMoniData {
    const PACKET_TYPE: PacketType = PacketType::PAMoniData;

    fn to_bytestream(&self) -> Vec<u8> {
        PAMoniData::to_bytestream(self)
    }
}

/// Local trigger board sensors: the two board temperatures and the
/// three discriminator thresholds.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LTBMoniData {
    pub board_id: u8,
    pub trenz_temp: f32,
    pub ltb_temp: f32,
    pub thresholds: [f32; 3],
}

impl LTBMoniData {
    pub fn new(board_id: u8) -> Self {
        LTBMoniData {
            board_id,
            trenz_temp: 0.0,
            ltb_temp: 0.0,
            thresholds: [0.0; 3],
        }
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(1 + 5 * 4);
        stream.push(self.board_id);
        wire::put_f32(&mut stream, self.trenz_temp);
        wire::put_f32(&mut stream, self.ltb_temp);
        for value in self.thresholds.iter() {
            wire::put_f32(&mut stream, *value);
        }
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let board_id = wire::take_u8(stream, pos)?;
        let trenz_temp = wire::take_f32(stream, pos)?;
        let ltb_temp = wire::take_f32(stream, pos)?;
        let mut thresholds = [0.0f32; 3];
        for value in thresholds.iter_mut() {
            *value = wire::take_f32(stream, pos)?;
        }
        Ok(LTBMoniData {
            board_id,
            trenz_temp,
            ltb_temp,
            thresholds,
        })
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        check_tag(packet, PacketType::LTBMoniData, "LTBMoniData")?;
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Packable for LTBMoniData {
    const PACKET_TYPE: PacketType = PacketType::LTBMoniData;

    fn to_bytestream(&self) -> Vec<u8> {
        LTBMoniData::to_bytestream(self)
    }
}

/// Health block of the TOF flight computer itself.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CPUMoniData {
    pub uptime: u32,
    /// Root filesystem usage in percent.
    pub disk_usage: u8,
    /// Per-core clock in MHz.
    pub cpu_freq: [u32; 4],
    pub cpu_temp: f32,
    pub mtb_link_temp: f32,
}

impl CPUMoniData {
    pub fn new() -> Self {
        CPUMoniData {
            uptime: 0,
            disk_usage: 0,
            cpu_freq: [0; 4],
            cpu_temp: 0.0,
            mtb_link_temp: 0.0,
        }
    }

    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(4 + 1 + 16 + 8);
        wire::put_u32(&mut stream, self.uptime);
        stream.push(self.disk_usage);
        for freq in self.cpu_freq.iter() {
            wire::put_u32(&mut stream, *freq);
        }
        wire::put_f32(&mut stream, self.cpu_temp);
        wire::put_f32(&mut stream, self.mtb_link_temp);
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        let uptime = wire::take_u32(stream, pos)?;
        let disk_usage = wire::take_u8(stream, pos)?;
        let mut cpu_freq = [0u32; 4];
        for freq in cpu_freq.iter_mut() {
            *freq = wire::take_u32(stream, pos)?;
        }
        let cpu_temp = wire::take_f32(stream, pos)?;
        let mtb_link_temp = wire::take_f32(stream, pos)?;
        Ok(CPUMoniData {
            uptime,
            disk_usage,
            cpu_freq,
            cpu_temp,
            mtb_link_temp,
        })
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        check_tag(packet, PacketType::CPUMoniData, "CPUMoniData")?;
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Default for CPUMoniData {
    fn default() -> Self {
        Self::new()
    }
}

impl Packable for CPUMoniData {
    const PACKET_TYPE: PacketType = PacketType::CPUMoniData;

    fn to_bytestream(&self) -> Vec<u8> {
        CPUMoniData::to_bytestream(self)
    }
}

impl MoniData for CPUMoniData {
    fn columns() -> &'static [&'static str] {
        &["uptime", "disk_usage", "cpu_temp", "mtb_link_temp"]
    }

    fn get(&self, column: &str) -> Option<f64> {
        let value = match column {
            "uptime" => self.uptime as f64,
            "disk_usage" => self.disk_usage as f64,
            "cpu_temp" => self.cpu_temp as f64,
            "mtb_link_temp" => self.mtb_link_temp as f64,
            _ => return None,
        };
        Some(value)
    }
}

/// Periodic liveness counter block of the master trigger.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MTBHeartbeat {
    pub total_elapsed: u64,
    pub n_events: u64,
    /// Events lost to a full event queue.
    pub evq_num_lost: u64,
    pub prescale_factor: f32,
}

impl MTBHeartbeat {
    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(28);
        wire::put_u64_swapped(&mut stream, self.total_elapsed);
        wire::put_u64_swapped(&mut stream, self.n_events);
        wire::put_u64_swapped(&mut stream, self.evq_num_lost);
        wire::put_f32(&mut stream, self.prescale_factor);
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        Ok(MTBHeartbeat {
            total_elapsed: wire::take_u64_swapped(stream, pos)?,
            n_events: wire::take_u64_swapped(stream, pos)?,
            evq_num_lost: wire::take_u64_swapped(stream, pos)?,
            prescale_factor: wire::take_f32(stream, pos)?,
        })
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        check_tag(packet, PacketType::MTBHeartbeat, "MTBHeartbeat")?;
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Packable for MTBHeartbeat {
    const PACKET_TYPE: PacketType = PacketType::MTBHeartbeat;

    fn to_bytestream(&self) -> Vec<u8> {
        MTBHeartbeat::to_bytestream(self)
    }
}

/// Periodic counter block of the event builder on the flight computer.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EVTBLDRHeartbeat {
    pub n_mte_received: u64,
    pub n_rbe_received: u64,
    pub n_events_sent: u64,
    /// Events closed with at least one expected board missing.
    pub n_events_incomplete: u64,
    /// Events discarded because their id arrived after the cache window.
    pub n_events_too_late: u64,
    pub event_cache_size: u32,
}

impl EVTBLDRHeartbeat {
    pub fn to_bytestream(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(44);
        wire::put_u64_swapped(&mut stream, self.n_mte_received);
        wire::put_u64_swapped(&mut stream, self.n_rbe_received);
        wire::put_u64_swapped(&mut stream, self.n_events_sent);
        wire::put_u64_swapped(&mut stream, self.n_events_incomplete);
        wire::put_u64_swapped(&mut stream, self.n_events_too_late);
        wire::put_u32(&mut stream, self.event_cache_size);
        stream
    }

    pub fn from_bytestream(stream: &[u8], pos: &mut usize) -> Result<Self, PacketError> {
        Ok(EVTBLDRHeartbeat {
            n_mte_received: wire::take_u64_swapped(stream, pos)?,
            n_rbe_received: wire::take_u64_swapped(stream, pos)?,
            n_events_sent: wire::take_u64_swapped(stream, pos)?,
            n_events_incomplete: wire::take_u64_swapped(stream, pos)?,
            n_events_too_late: wire::take_u64_swapped(stream, pos)?,
            event_cache_size: wire::take_u32(stream, pos)?,
        })
    }

    pub fn from_tofpacket(packet: &TofPacket) -> Result<Self, PacketError> {
        check_tag(packet, PacketType::EVTBLDRHeartbeat, "EVTBLDRHeartbeat")?;
        let mut pos = 0;
        Self::from_bytestream(&packet.payload, &mut pos)
    }
}

impl Packable for EVTBLDRHeartbeat {
    const PACKET_TYPE: PacketType = PacketType::EVTBLDRHeartbeat;

    fn to_bytestream(&self) -> Vec<u8> {
        EVTBLDRHeartbeat::to_bytestream(self)
    }
}

/// A time-tagged series of housekeeping rows with a uniform tabular
/// surface.
#[derive(Debug, Clone, PartialEq)]
pub struct MoniSeries<T: MoniData> {
    rows: Vec<(u32, T)>,
}

impl<T: MoniData> MoniSeries<T> {
    pub fn new() -> Self {
        MoniSeries { rows: Vec::new() }
    }

    /// Appends a row taken at `gcutime`.
    pub fn add(&mut self, gcutime: u32, row: T) {
        self.rows.push((gcutime, row));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends all rows of `other`.
    pub fn stack(&mut self, other: MoniSeries<T>) {
        self.rows.extend(other.rows);
    }

    /// All values of one column, in insertion order. Unknown columns
    /// yield an empty vector.
    pub fn column(&self, name: &str) -> Vec<f64> {
        self.rows
            .iter()
            .filter_map(|(_, row)| row.get(name))
            .collect()
    }

    /// The gcutime stamps of all rows.
    pub fn times(&self) -> Vec<u32> {
        self.rows.iter().map(|(t, _)| *t).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, T)> {
        self.rows.iter()
    }
}

impl<T: MoniData> Default for MoniSeries<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rb_moni_roundtrip() {
        let mut moni = RBMoniData::new(17);
        moni.rate = 123;
        moni.tmp_drs = 48.5;
        moni.p3v3_voltage = 3.31;
        let stream = moni.to_bytestream();
        let mut pos = 0;
        let decoded = RBMoniData::from_bytestream(&stream, &mut pos).unwrap();
        assert_eq!(decoded, moni);
        assert_eq!(pos, stream.len());
    }

    #[test]
    fn mtb_moni_roundtrip_through_packet() {
        let mut moni = MtbMoniData::new();
        moni.rate = 220;
        moni.lost_rate = 3;
        moni.fpga_temp = 61.0;
        let packet = moni.pack();
        assert_eq!(packet.packet_type, PacketType::MtbMoniData);
        let decoded = MtbMoniData::from_tofpacket(&packet).unwrap();
        assert_eq!(decoded, moni);
    }

    #[test]
    fn power_board_roundtrip() {
        let mut moni = PBMoniData::new(3);
        moni.p3v6_voltage = 3.59;
        moni.shv_temp = 31.25;
        let decoded = PBMoniData::from_tofpacket(&moni.pack()).unwrap();
        assert_eq!(decoded, moni);
        assert!((decoded.get("p3v6_voltage").unwrap() - 3.59f32 as f64).abs() < 1e-6);
    }

    #[test]
    fn preamp_roundtrip() {
        let mut moni = PAMoniData::new(5);
        moni.temps[0] = 22.0;
        moni.biases[15] = 58.5;
        let decoded = PAMoniData::from_tofpacket(&moni.pack()).unwrap();
        assert_eq!(decoded, moni);
    }

    #[test]
    fn ltb_roundtrip() {
        let mut moni = LTBMoniData::new(9);
        moni.thresholds = [40.0, 150.0, 280.0];
        let decoded = LTBMoniData::from_tofpacket(&moni.pack()).unwrap();
        assert_eq!(decoded, moni);
    }

    #[test]
    fn cpu_roundtrip() {
        let mut moni = CPUMoniData::new();
        moni.uptime = 86_400;
        moni.disk_usage = 73;
        moni.cpu_freq = [1200, 1200, 600, 600];
        let decoded = CPUMoniData::from_tofpacket(&moni.pack()).unwrap();
        assert_eq!(decoded, moni);
    }

    #[test]
    fn heartbeats_roundtrip() {
        let mtb = MTBHeartbeat {
            total_elapsed: 3600,
            n_events: 1_000_000,
            evq_num_lost: 12,
            prescale_factor: 0.8,
        };
        assert_eq!(
            MTBHeartbeat::from_tofpacket(&mtb.pack()).unwrap(),
            mtb
        );

        let bldr = EVTBLDRHeartbeat {
            n_mte_received: 1_000_000,
            n_rbe_received: 38_000_000,
            n_events_sent: 999_950,
            n_events_incomplete: 40,
            n_events_too_late: 10,
            event_cache_size: 2048,
        };
        assert_eq!(
            EVTBLDRHeartbeat::from_tofpacket(&bldr.pack()).unwrap(),
            bldr
        );
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let packet = MtbMoniData::new().pack();
        assert!(matches!(
            RBMoniData::from_tofpacket(&packet),
            Err(PacketError::UnexpectedTag { .. })
        ));
    }

    #[test]
    fn mag_tot_combines_axes() {
        let mut moni = RBMoniData::new(1);
        moni.mag_x = 3.0;
        moni.mag_y = 4.0;
        assert!((moni.mag_tot() - 5.0).abs() < 1e-6);
        assert!((moni.get("mag_tot").unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn series_stack_column_len() {
        let mut a = MoniSeries::new();
        let mut row = RBMoniData::new(1);
        row.rate = 10;
        a.add(1000, row);

        let mut b = MoniSeries::new();
        let mut row = RBMoniData::new(1);
        row.rate = 20;
        b.add(1010, row);

        a.stack(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.column("rate"), vec![10.0, 20.0]);
        assert_eq!(a.times(), vec![1000, 1010]);
        assert!(a.column("no_such_column").is_empty());
        assert!(RBMoniData::columns().contains(&"tmp_zynq"));
    }
}
