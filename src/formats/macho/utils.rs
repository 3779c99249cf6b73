//! Utility functions for Mach-O parsing and writing

use crate::error::{MachOError, Result};
use crate::formats::macho::types::Endian;

/// Trait for reading values with endianness support
pub trait EndianRead {
    fn read_u8(&self, offset: usize) -> Result<u8>;
    fn read_u16(&self, offset: usize, endian: Endian) -> Result<u16>;
    fn read_u32(&self, offset: usize, endian: Endian) -> Result<u32>;
    fn read_u64(&self, offset: usize, endian: Endian) -> Result<u64>;
    fn read_i32(&self, offset: usize, endian: Endian) -> Result<i32>;
    fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]>;
}

fn fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    data.get(offset..offset.saturating_add(N))
        .and_then(|s| s.try_into().ok())
        .ok_or(MachOError::Truncated { offset, needed: N })
}

impl EndianRead for [u8] {
    fn read_u8(&self, offset: usize) -> Result<u8> {
        self.get(offset)
            .copied()
            .ok_or(MachOError::Truncated { offset, needed: 1 })
    }

    fn read_u16(&self, offset: usize, endian: Endian) -> Result<u16> {
        let bytes = fixed::<2>(self, offset)?;
        Ok(match endian {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        })
    }

    fn read_u32(&self, offset: usize, endian: Endian) -> Result<u32> {
        let bytes = fixed::<4>(self, offset)?;
        Ok(match endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    fn read_u64(&self, offset: usize, endian: Endian) -> Result<u64> {
        let bytes = fixed::<8>(self, offset)?;
        Ok(match endian {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    fn read_i32(&self, offset: usize, endian: Endian) -> Result<i32> {
        self.read_u32(offset, endian).map(|v| v as i32)
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.get(offset..offset.saturating_add(len))
            .ok_or(MachOError::Truncated { offset, needed: len })
    }
}

/// Trait for appending values with endianness support
pub trait EndianWrite {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16, endian: Endian);
    fn put_u32(&mut self, v: u32, endian: Endian);
    fn put_u64(&mut self, v: u64, endian: Endian);
}

impl EndianWrite for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u16(&mut self, v: u16, endian: Endian) {
        match endian {
            Endian::Little => self.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn put_u32(&mut self, v: u32, endian: Endian) {
        match endian {
            Endian::Little => self.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn put_u64(&mut self, v: u64, endian: Endian) {
        match endian {
            Endian::Little => self.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.extend_from_slice(&v.to_be_bytes()),
        }
    }
}

/// Overwrite a u32 in place.
pub fn patch_u32(buf: &mut [u8], offset: usize, v: u32, endian: Endian) -> Result<()> {
    let bytes = match endian {
        Endian::Little => v.to_le_bytes(),
        Endian::Big => v.to_be_bytes(),
    };
    buf.get_mut(offset..offset + 4)
        .ok_or(MachOError::Truncated { offset, needed: 4 })?
        .copy_from_slice(&bytes);
    Ok(())
}

/// Read an address-sized word.
pub fn read_word(data: &[u8], offset: usize, is_64: bool, endian: Endian) -> Result<u64> {
    if is_64 {
        data.read_u64(offset, endian)
    } else {
        data.read_u32(offset, endian).map(u64::from)
    }
}

pub fn put_word(buf: &mut Vec<u8>, v: u64, is_64: bool, endian: Endian) {
    if is_64 {
        buf.put_u64(v, endian);
    } else {
        buf.put_u32(v as u32, endian);
    }
}

/// Read a null-terminated string from data. A missing terminator takes the
/// rest of the buffer.
pub fn read_cstring(data: &[u8], offset: usize) -> Result<&str> {
    let slice = data
        .get(offset..)
        .ok_or(MachOError::Truncated { offset, needed: 1 })?;
    let end = memchr::memchr(0, slice).unwrap_or(slice.len());
    std::str::from_utf8(&slice[..end]).map_err(|_| MachOError::InvalidString { offset })
}

/// Decode a fixed 16-byte, NUL-padded name.
pub fn read_fixed_name(data: &[u8], offset: usize) -> Result<String> {
    let raw = data.read_bytes(offset, 16)?;
    let end = memchr::memchr(0, raw).unwrap_or(16);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// Encode a name into a fixed 16-byte field, truncating if necessary.
pub fn put_fixed_name(buf: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    let bytes = name.as_bytes();
    let n = bytes.len().min(16);
    field[..n].copy_from_slice(&bytes[..n]);
    buf.extend_from_slice(&field);
}

/// Align a value up to the specified alignment
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Zero-pad a buffer to the specified alignment
pub fn pad_to(buf: &mut Vec<u8>, alignment: u64) {
    let target = align_up(buf.len() as u64, alignment) as usize;
    buf.resize(target, 0);
}

/// Check if a range is within bounds
pub fn check_bounds(offset: usize, size: usize, data_len: usize) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= data_len => Ok(()),
        _ => Err(MachOError::Truncated {
            offset,
            needed: size,
        }),
    }
}

/// Read an unsigned LEB128 value, advancing `offset`.
pub fn read_uleb(data: &[u8], offset: &mut usize) -> Result<u64> {
    let start = *offset;
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = data.read_u8(*offset)?;
        *offset += 1;
        if shift < 64 {
            result |= u64::from(byte & 0x7f) << shift;
        } else if byte & 0x7f != 0 {
            return Err(MachOError::format(start as u64, "uleb128 overflow"));
        }
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
}

/// Read a signed LEB128 value, advancing `offset`.
pub fn read_sleb(data: &[u8], offset: &mut usize) -> Result<i64> {
    let mut result = 0i64;
    let mut shift = 0u32;
    loop {
        let byte = data.read_u8(*offset)?;
        *offset += 1;
        if shift < 64 {
            result |= i64::from(byte & 0x7f) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
    }
}

pub fn write_uleb(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn write_sleb(buf: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        buf.push(if done { byte } else { byte | 0x80 });
        if done {
            break;
        }
    }
}
