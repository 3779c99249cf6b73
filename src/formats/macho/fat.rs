//! Universal (fat) binaries
//!
//! The fat header and architecture table are always big-endian. Each entry
//! names a byte range holding a complete thin image.

use crate::error::{MachOError, Result};
use crate::formats::macho::parser::ParseConfig;
use crate::formats::macho::types::{cpu_name, Endian, FAT_MAGIC, FAT_MAGIC_64};
use crate::formats::macho::utils::EndianRead;
use crate::formats::macho::MachO;
use crate::io::{ByteSource, SliceSource};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const FAT_HEADER_SIZE: u64 = 8;
const FAT_ARCH_SIZE: u64 = 20;
const FAT_ARCH_64_SIZE: u64 = 32;

/// One architecture slice of a universal binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u64,
    pub size: u64,
    /// Power-of-two alignment exponent.
    pub align: u32,
}

impl FatArch {
    pub fn alignment(&self) -> u64 {
        1u64.checked_shl(self.align).unwrap_or(0)
    }

    pub fn cpu_name(&self) -> &'static str {
        cpu_name(self.cputype, self.cpusubtype)
    }
}

impl fmt::Display for FatArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} offset={:#x} size={:#x} align=2^{}",
            self.cpu_name(),
            self.offset,
            self.size,
            self.align
        )
    }
}

/// A parsed universal binary header.
pub struct FatFile {
    source: Arc<dyn ByteSource>,
    pub magic: u32,
    pub arches: Vec<FatArch>,
}

impl fmt::Debug for FatFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatFile")
            .field("magic", &self.magic)
            .field("arches", &self.arches)
            .finish()
    }
}

/// Whether the source starts with a fat magic.
pub fn is_fat(source: &dyn ByteSource) -> bool {
    source
        .read_at(0, 4)
        .ok()
        .and_then(|b| b.read_u32(0, Endian::Big).ok())
        .is_some_and(|m| m == FAT_MAGIC || m == FAT_MAGIC_64)
}

impl FatFile {
    pub fn parse(source: Arc<dyn ByteSource>) -> Result<Self> {
        let head = source.read_exact_at(0, FAT_HEADER_SIZE)?;
        let magic = head.read_u32(0, Endian::Big)?;
        let entry = match magic {
            FAT_MAGIC => FAT_ARCH_SIZE,
            FAT_MAGIC_64 => FAT_ARCH_64_SIZE,
            other => {
                return Err(MachOError::format_value(0, "invalid fat magic", u64::from(other)))
            }
        };
        let count = u64::from(head.read_u32(4, Endian::Big)?);
        let table = source
            .read_exact_at(FAT_HEADER_SIZE, count * entry)
            .map_err(|_| {
                MachOError::format_value(FAT_HEADER_SIZE, "fat architecture table truncated", count)
            })?;

        let size = source.size();
        let mut arches = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = i * entry as usize;
            let be = Endian::Big;
            let arch = if magic == FAT_MAGIC_64 {
                FatArch {
                    cputype: table.read_u32(at, be)?,
                    cpusubtype: table.read_u32(at + 4, be)?,
                    offset: table.read_u64(at + 8, be)?,
                    size: table.read_u64(at + 16, be)?,
                    align: table.read_u32(at + 24, be)?,
                }
            } else {
                FatArch {
                    cputype: table.read_u32(at, be)?,
                    cpusubtype: table.read_u32(at + 4, be)?,
                    offset: u64::from(table.read_u32(at + 8, be)?),
                    size: u64::from(table.read_u32(at + 12, be)?),
                    align: table.read_u32(at + 16, be)?,
                }
            };
            if arch.offset.checked_add(arch.size).map_or(true, |end| end > size) {
                return Err(MachOError::format_value(
                    FAT_HEADER_SIZE + at as u64,
                    format!("fat architecture {i} extends past the end of the file"),
                    arch.offset,
                ));
            }
            arches.push(arch);
        }

        debug!(arches = arches.len(), "Parsed fat header");
        Ok(Self {
            source,
            magic,
            arches,
        })
    }

    /// Parse the thin image of architecture `index`.
    pub fn open(&self, index: usize, config: ParseConfig) -> Result<MachO> {
        let arch = self
            .arches
            .get(index)
            .ok_or_else(|| MachOError::not_found("fat architecture", format!("#{index}")))?;
        let slice = SliceSource::new(Arc::clone(&self.source), arch.offset, arch.size)?;
        MachO::with_config(Arc::new(slice), config)
    }

    /// Parse the first slice with the given CPU type.
    pub fn open_cpu(&self, cputype: u32, config: ParseConfig) -> Result<MachO> {
        let index = self
            .arches
            .iter()
            .position(|a| a.cputype == cputype)
            .ok_or_else(|| MachOError::not_found("fat architecture", cpu_name(cputype, 0)))?;
        self.open(index, config)
    }
}
