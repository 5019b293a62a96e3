//! Low-level field access for the TOF wire formats.
//!
//! Every format in this crate is built from little-endian 16-bit words.
//! The board firmware emits its wider header fields (event counter, DNA,
//! timestamp, stored CRC32s) as little-endian words in *most-significant
//! word first* order, the so-called word swap. These helpers implement
//! both conventions over a `(&[u8], &mut usize)` cursor.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::errors::PacketError;

/// Marker preceding every board packet, TOF packet and frame.
pub const HEAD: u16 = 0xAAAA;
/// Marker terminating every board packet, TOF packet and frame.
pub const TAIL: u16 = 0x5555;
/// Marker preceding every telemetry packet.
pub const TELEMETRY_SYNC: u16 = 0x90EB;

/// CRC32 as used by the readout board firmware (IEEE 802.3 polynomial).
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checks that at least `n` more bytes are available at `*pos`.
pub(crate) fn expect(stream: &[u8], pos: usize, n: usize) -> Result<(), PacketError> {
    if pos + n > stream.len() {
        return Err(PacketError::Truncated {
            needed: n,
            have: stream.len().saturating_sub(pos),
        });
    }
    Ok(())
}

pub(crate) fn take_u8(stream: &[u8], pos: &mut usize) -> Result<u8, PacketError> {
    expect(stream, *pos, 1)?;
    let value = stream[*pos];
    *pos += 1;
    Ok(value)
}

pub(crate) fn take_u16(stream: &[u8], pos: &mut usize) -> Result<u16, PacketError> {
    expect(stream, *pos, 2)?;
    let value = LittleEndian::read_u16(&stream[*pos..]);
    *pos += 2;
    Ok(value)
}

pub(crate) fn take_u32(stream: &[u8], pos: &mut usize) -> Result<u32, PacketError> {
    expect(stream, *pos, 4)?;
    let value = LittleEndian::read_u32(&stream[*pos..]);
    *pos += 4;
    Ok(value)
}

pub(crate) fn take_f32(stream: &[u8], pos: &mut usize) -> Result<f32, PacketError> {
    expect(stream, *pos, 4)?;
    let value = LittleEndian::read_f32(&stream[*pos..]);
    *pos += 4;
    Ok(value)
}

/// 32-bit field in word-swapped board order.
pub(crate) fn take_u32_swapped(stream: &[u8], pos: &mut usize) -> Result<u32, PacketError> {
    let w0 = take_u16(stream, pos)? as u32;
    let w1 = take_u16(stream, pos)? as u32;
    Ok((w0 << 16) | w1)
}

/// 48-bit field in word-swapped board order.
pub(crate) fn take_u48_swapped(stream: &[u8], pos: &mut usize) -> Result<u64, PacketError> {
    let w0 = take_u16(stream, pos)? as u64;
    let w1 = take_u16(stream, pos)? as u64;
    let w2 = take_u16(stream, pos)? as u64;
    Ok((w0 << 32) | (w1 << 16) | w2)
}

/// 64-bit field in word-swapped board order.
pub(crate) fn take_u64_swapped(stream: &[u8], pos: &mut usize) -> Result<u64, PacketError> {
    let w0 = take_u16(stream, pos)? as u64;
    let w1 = take_u16(stream, pos)? as u64;
    let w2 = take_u16(stream, pos)? as u64;
    let w3 = take_u16(stream, pos)? as u64;
    Ok((w0 << 48) | (w1 << 32) | (w2 << 16) | w3)
}

pub(crate) fn put_u16(stream: &mut Vec<u8>, value: u16) {
    stream.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(stream: &mut Vec<u8>, value: u32) {
    stream.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_f32(stream: &mut Vec<u8>, value: f32) {
    stream.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32_swapped(stream: &mut Vec<u8>, value: u32) {
    put_u16(stream, (value >> 16) as u16);
    put_u16(stream, value as u16);
}

pub(crate) fn put_u48_swapped(stream: &mut Vec<u8>, value: u64) {
    put_u16(stream, (value >> 32) as u16);
    put_u16(stream, (value >> 16) as u16);
    put_u16(stream, value as u16);
}

pub(crate) fn put_u64_swapped(stream: &mut Vec<u8>, value: u64) {
    put_u16(stream, (value >> 48) as u16);
    put_u16(stream, (value >> 32) as u16);
    put_u16(stream, (value >> 16) as u16);
    put_u16(stream, value as u16);
}
