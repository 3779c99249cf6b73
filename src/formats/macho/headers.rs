//! Mach-O header parsing and serialization

use crate::error::{MachOError, Result};
use crate::formats::macho::types::*;
use crate::formats::macho::utils::{EndianRead, EndianWrite};

/// Identify byte order and word size from the first four bytes.
pub fn detect_magic(data: &[u8]) -> Result<(Endian, WordSize)> {
    let raw = data.read_u32(0, Endian::Big)?;
    match raw {
        MH_MAGIC => Ok((Endian::Big, WordSize::W32)),
        MH_CIGAM => Ok((Endian::Little, WordSize::W32)),
        MH_MAGIC_64 => Ok((Endian::Big, WordSize::W64)),
        MH_CIGAM_64 => Ok((Endian::Little, WordSize::W64)),
        other => Err(MachOError::format_value(0, "invalid magic number", u64::from(other))),
    }
}

/// Parse the fixed Mach-O header
pub fn parse_header(data: &[u8]) -> Result<FileHeader> {
    let (endian, word_size) = detect_magic(data)?;
    if data.len() < word_size.header_size() {
        return Err(MachOError::Truncated {
            offset: 0,
            needed: word_size.header_size(),
        });
    }

    let header = FileHeader {
        magic: data.read_u32(0, endian)?,
        endian,
        word_size,
        cputype: data.read_u32(4, endian)?,
        cpusubtype: data.read_u32(8, endian)?,
        filetype: FileType::from(data.read_u32(12, endian)?),
        ncmds: data.read_u32(16, endian)?,
        sizeofcmds: data.read_u32(20, endian)?,
        flags: HeaderFlags::from_bits_retain(data.read_u32(24, endian)?),
        reserved: match word_size {
            WordSize::W64 => data.read_u32(28, endian)?,
            WordSize::W32 => 0,
        },
    };
    Ok(header)
}

/// Append the header in its on-disk encoding.
pub fn write_header(header: &FileHeader, buf: &mut Vec<u8>) {
    let e = header.endian;
    buf.put_u32(header.magic, e);
    buf.put_u32(header.cputype, e);
    buf.put_u32(header.cpusubtype, e);
    buf.put_u32(header.filetype.into(), e);
    buf.put_u32(header.ncmds, e);
    buf.put_u32(header.sizeofcmds, e);
    buf.put_u32(header.flags.bits(), e);
    if header.word_size == WordSize::W64 {
        buf.put_u32(header.reserved, e);
    }
}

impl FileHeader {
    /// A header with no load commands.
    pub fn new(endian: Endian, word_size: WordSize, cputype: u32, filetype: FileType) -> Self {
        let magic = match word_size {
            WordSize::W32 => MH_MAGIC,
            WordSize::W64 => MH_MAGIC_64,
        };
        Self {
            magic,
            endian,
            word_size,
            cputype,
            cpusubtype: 0,
            filetype,
            ncmds: 0,
            sizeofcmds: 0,
            flags: HeaderFlags::empty(),
            reserved: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        write_header(self, &mut buf);
        buf
    }
}
