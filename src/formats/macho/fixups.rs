//! Dyld chained fixups (`LC_DYLD_CHAINED_FIXUPS`)
//!
//! The blob holds a header, an imports table, a symbol pool and per-segment
//! page starts. Each page start begins a chain of pointers where every
//! pointer encodes either a rebase or a bind plus the stride-scaled distance
//! to the next pointer in the chain.

use crate::error::{MachOError, Result};
use crate::formats::macho::segments::Segment;
use crate::formats::macho::types::Endian;
use crate::formats::macho::utils::{read_cstring, EndianRead};
use crate::io::ByteSource;
use std::fmt;
use tracing::{debug, warn};

pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xffff;
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;
pub const DYLD_CHAINED_PTR_START_LAST: u16 = 0x8000;

pub const BIND_SPECIAL_DYLIB_SELF: i32 = 0;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i32 = -1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i32 = -2;
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i32 = -3;

/// Pointer encodings used by a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerFormat {
    Arm64e,
    Ptr64,
    Ptr32,
    Ptr32Cache,
    Ptr32Firmware,
    Ptr64Offset,
    Arm64eKernel,
    Ptr64KernelCache,
    Arm64eUserland,
    Arm64eFirmware,
    X86_64KernelCache,
    Arm64eUserland24,
}

impl PointerFormat {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => PointerFormat::Arm64e,
            2 => PointerFormat::Ptr64,
            3 => PointerFormat::Ptr32,
            4 => PointerFormat::Ptr32Cache,
            5 => PointerFormat::Ptr32Firmware,
            6 => PointerFormat::Ptr64Offset,
            7 => PointerFormat::Arm64eKernel,
            8 => PointerFormat::Ptr64KernelCache,
            9 => PointerFormat::Arm64eUserland,
            10 => PointerFormat::Arm64eFirmware,
            11 => PointerFormat::X86_64KernelCache,
            12 => PointerFormat::Arm64eUserland24,
            _ => return None,
        })
    }

    /// Bytes between chain entries per unit of `next`.
    pub fn stride(&self) -> u64 {
        match self {
            PointerFormat::Arm64e | PointerFormat::Arm64eUserland | PointerFormat::Arm64eUserland24 => 8,
            PointerFormat::X86_64KernelCache => 1,
            _ => 4,
        }
    }

    pub fn is_64(&self) -> bool {
        !matches!(
            self,
            PointerFormat::Ptr32 | PointerFormat::Ptr32Cache | PointerFormat::Ptr32Firmware
        )
    }

    pub fn is_arm64e(&self) -> bool {
        matches!(
            self,
            PointerFormat::Arm64e
                | PointerFormat::Arm64eKernel
                | PointerFormat::Arm64eUserland
                | PointerFormat::Arm64eFirmware
                | PointerFormat::Arm64eUserland24
        )
    }

    /// Rebase targets are unslid virtual addresses rather than image offsets.
    pub fn targets_vmaddr(&self) -> bool {
        matches!(
            self,
            PointerFormat::Arm64e
                | PointerFormat::Arm64eFirmware
                | PointerFormat::Ptr64
                | PointerFormat::Ptr32
                | PointerFormat::Ptr32Firmware
        )
    }

    /// Decode one raw chain entry.
    pub fn decode(&self, raw: u64) -> ChainedPointer {
        match self {
            f if f.is_arm64e() => {
                let next = (raw >> 51) & 0x7ff;
                let bind = (raw >> 62) & 1 != 0;
                let auth = (raw >> 63) & 1 != 0;
                let wide = *f == PointerFormat::Arm64eUserland24;
                match (bind, auth) {
                    (false, false) => ChainedPointer::Rebase {
                        target: (((raw >> 43) & 0xff) << 56) | (raw & 0x7ff_ffff_ffff),
                        auth: false,
                        next,
                    },
                    (false, true) => ChainedPointer::Rebase {
                        target: raw & 0xffff_ffff,
                        auth: true,
                        next,
                    },
                    (true, _) => {
                        let ordinal = (if wide { raw & 0xff_ffff } else { raw & 0xffff }) as u32;
                        let addend = if auth { 0 } else { sign_extend_19((raw >> 32) & 0x7_ffff) };
                        ChainedPointer::Bind {
                            ordinal,
                            addend,
                            auth,
                            next,
                        }
                    }
                }
            }
            PointerFormat::Ptr64 | PointerFormat::Ptr64Offset => {
                let next = (raw >> 51) & 0xfff;
                if (raw >> 63) & 1 != 0 {
                    ChainedPointer::Bind {
                        ordinal: (raw & 0xff_ffff) as u32,
                        addend: ((raw >> 24) & 0xff) as i64,
                        auth: false,
                        next,
                    }
                } else {
                    ChainedPointer::Rebase {
                        target: (((raw >> 36) & 0xff) << 56) | (raw & 0xf_ffff_ffff),
                        auth: false,
                        next,
                    }
                }
            }
            PointerFormat::Ptr64KernelCache | PointerFormat::X86_64KernelCache => {
                ChainedPointer::Rebase {
                    target: raw & 0x3fff_ffff,
                    auth: (raw >> 63) & 1 != 0,
                    next: (raw >> 51) & 0xfff,
                }
            }
            PointerFormat::Ptr32 => {
                let next = (raw >> 26) & 0x1f;
                if (raw >> 31) & 1 != 0 {
                    ChainedPointer::Bind {
                        ordinal: (raw & 0xf_ffff) as u32,
                        addend: ((raw >> 20) & 0x3f) as i64,
                        auth: false,
                        next,
                    }
                } else {
                    ChainedPointer::Rebase {
                        target: raw & 0x3ff_ffff,
                        auth: false,
                        next,
                    }
                }
            }
            PointerFormat::Ptr32Cache => ChainedPointer::Rebase {
                target: raw & 0x3fff_ffff,
                auth: false,
                next: (raw >> 30) & 0x3,
            },
            PointerFormat::Ptr32Firmware => ChainedPointer::Rebase {
                target: raw & 0x3ff_ffff,
                auth: false,
                next: (raw >> 26) & 0x3f,
            },
            _ => ChainedPointer::Rebase {
                target: raw,
                auth: false,
                next: 0,
            },
        }
    }
}

fn sign_extend_19(v: u64) -> i64 {
    if v & 0x4_0000 != 0 {
        (v | 0xffff_ffff_fffc_0000) as i64
    } else {
        v as i64
    }
}

/// A decoded chain entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainedPointer {
    Rebase { target: u64, auth: bool, next: u64 },
    Bind { ordinal: u32, addend: i64, auth: bool, next: u64 },
}

impl ChainedPointer {
    pub fn next(&self) -> u64 {
        match self {
            ChainedPointer::Rebase { next, .. } | ChainedPointer::Bind { next, .. } => *next,
        }
    }
}

/// One fixup location found by walking the chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// File offset of the pointer, in the coordinates of the cache reader.
    pub offset: u64,
    pub raw: u64,
    pub pointer: ChainedPointer,
}

/// An entry of the imports table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedImport {
    pub lib_ordinal: i32,
    pub weak_import: bool,
    pub name: String,
    pub addend: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainedFixupsHeader {
    pub fixups_version: u32,
    pub starts_offset: u32,
    pub imports_offset: u32,
    pub symbols_offset: u32,
    pub imports_count: u32,
    pub imports_format: u32,
    pub symbols_format: u32,
}

/// Page starts of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStarts {
    pub segment_index: usize,
    pub size: u32,
    pub page_size: u16,
    pub pointer_format: u16,
    pub segment_offset: u64,
    pub max_valid_pointer: u32,
    pub page_count: u16,
    /// Page starts followed by any overflow entries.
    pub page_starts: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChainedFixups {
    pub header: ChainedFixupsHeader,
    pub imports: Vec<ChainedImport>,
    pub starts: Vec<SegmentStarts>,
    /// Pointer format of the first segment with chains.
    pub pointer_format: Option<PointerFormat>,
    pub fixups: Vec<Fixup>,
}

const IMPORT_FORMAT_PLAIN: u32 = 1;
const IMPORT_FORMAT_ADDEND: u32 = 2;
const IMPORT_FORMAT_ADDEND64: u32 = 3;

impl ChainedFixups {
    /// Parse the blob and walk every chain, reading pointers from `source` at
    /// the owning segment's file offset.
    pub fn parse(
        blob: &[u8],
        endian: Endian,
        segments: &[Segment],
        source: &dyn ByteSource,
    ) -> Result<ChainedFixups> {
        let header = ChainedFixupsHeader {
            fixups_version: blob.read_u32(0, endian)?,
            starts_offset: blob.read_u32(4, endian)?,
            imports_offset: blob.read_u32(8, endian)?,
            symbols_offset: blob.read_u32(12, endian)?,
            imports_count: blob.read_u32(16, endian)?,
            imports_format: blob.read_u32(20, endian)?,
            symbols_format: blob.read_u32(24, endian)?,
        };
        if header.symbols_format != 0 {
            return Err(MachOError::Unsupported(format!(
                "compressed chained fixup symbols (format {})",
                header.symbols_format
            )));
        }

        let imports = parse_imports(blob, &header, endian)?;
        let starts = parse_starts(blob, header.starts_offset as usize, endian)?;
        let pointer_format = starts
            .iter()
            .find_map(|s| PointerFormat::from_u16(s.pointer_format));

        let mut fixups = Vec::new();
        for seg_starts in &starts {
            let Some(segment) = segments.get(seg_starts.segment_index) else {
                warn!(
                    segment_index = seg_starts.segment_index,
                    "Chained fixup starts for a missing segment"
                );
                continue;
            };
            walk_segment(seg_starts, segment.fileoff, endian, source, &mut fixups)?;
        }

        debug!(
            imports = imports.len(),
            segments = starts.len(),
            fixups = fixups.len(),
            "Parsed chained fixups"
        );
        Ok(ChainedFixups {
            header,
            imports,
            starts,
            pointer_format,
            fixups,
        })
    }

    /// The runtime target of a rebase pointer, relative to the image.
    pub fn is_rebase(&self, raw: u64, preferred_load_address: u64) -> Option<u64> {
        let format = self.pointer_format?;
        match format.decode(raw) {
            ChainedPointer::Rebase { target, auth, .. } => {
                if !auth && format.targets_vmaddr() {
                    Some(target.wrapping_sub(preferred_load_address))
                } else {
                    Some(target)
                }
            }
            ChainedPointer::Bind { .. } => None,
        }
    }

    /// The import and addend of a bind pointer.
    pub fn is_bind(&self, raw: u64) -> Option<(&ChainedImport, i64)> {
        if self.imports.is_empty() {
            return None;
        }
        let format = self.pointer_format?;
        match format.decode(raw) {
            ChainedPointer::Bind { ordinal, addend, .. } => {
                self.imports.get(ordinal as usize).map(|imp| (imp, addend))
            }
            ChainedPointer::Rebase { .. } => None,
        }
    }

    pub fn rebases(&self) -> impl Iterator<Item = &Fixup> {
        self.fixups
            .iter()
            .filter(|f| matches!(f.pointer, ChainedPointer::Rebase { .. }))
    }

    pub fn binds(&self) -> impl Iterator<Item = &Fixup> {
        self.fixups
            .iter()
            .filter(|f| matches!(f.pointer, ChainedPointer::Bind { .. }))
    }
}

fn parse_imports(blob: &[u8], header: &ChainedFixupsHeader, endian: Endian) -> Result<Vec<ChainedImport>> {
    let base = header.imports_offset as usize;
    let symbols = blob
        .get(header.symbols_offset as usize..)
        .ok_or(MachOError::Truncated {
            offset: header.symbols_offset as usize,
            needed: 1,
        })?;
    let name_at = |off: u64| -> Result<String> {
        read_cstring(symbols, off as usize).map(str::to_string)
    };

    let entry_size = match header.imports_format {
        IMPORT_FORMAT_PLAIN => 4,
        IMPORT_FORMAT_ADDEND => 8,
        IMPORT_FORMAT_ADDEND64 => 16,
        other => {
            return Err(MachOError::Unsupported(format!(
                "chained fixup imports format {other}"
            )))
        }
    };
    let table_end = (header.imports_count as usize)
        .checked_mul(entry_size)
        .and_then(|len| len.checked_add(base));
    if !matches!(table_end, Some(end) if end <= blob.len()) {
        return Err(MachOError::Truncated {
            offset: base,
            needed: (header.imports_count as usize).saturating_mul(entry_size),
        });
    }

    let mut imports = Vec::with_capacity(header.imports_count as usize);
    for i in 0..header.imports_count as usize {
        let import = match header.imports_format {
            IMPORT_FORMAT_PLAIN | IMPORT_FORMAT_ADDEND => {
                let off = base + i * entry_size;
                let raw = blob.read_u32(off, endian)?;
                let addend = if header.imports_format == IMPORT_FORMAT_ADDEND {
                    i64::from(blob.read_i32(off + 4, endian)?)
                } else {
                    0
                };
                ChainedImport {
                    lib_ordinal: i32::from((raw & 0xff) as u8 as i8),
                    weak_import: (raw >> 8) & 1 != 0,
                    name: name_at(u64::from(raw >> 9))?,
                    addend,
                }
            }
            IMPORT_FORMAT_ADDEND64 => {
                let off = base + i * entry_size;
                let raw = blob.read_u64(off, endian)?;
                ChainedImport {
                    lib_ordinal: i32::from((raw & 0xffff) as u16 as i16),
                    weak_import: (raw >> 16) & 1 != 0,
                    name: name_at(raw >> 32)?,
                    addend: blob.read_u64(off + 8, endian)? as i64,
                }
            }
            other => {
                return Err(MachOError::Unsupported(format!(
                    "chained fixup imports format {other}"
                )))
            }
        };
        imports.push(import);
    }
    Ok(imports)
}

fn parse_starts(blob: &[u8], starts_offset: usize, endian: Endian) -> Result<Vec<SegmentStarts>> {
    let seg_count = blob.read_u32(starts_offset, endian)? as usize;
    let mut starts = Vec::new();
    for index in 0..seg_count {
        let info_offset = blob.read_u32(starts_offset + 4 + index * 4, endian)? as usize;
        if info_offset == 0 {
            continue;
        }
        let at = starts_offset + info_offset;
        let size = blob.read_u32(at, endian)?;
        let page_count = blob.read_u16(at + 20, endian)?;
        // Overflow chain starts for 32-bit formats follow the page starts within `size`.
        let entries = ((size as usize).saturating_sub(22) / 2).max(page_count as usize);
        let page_starts = (0..entries)
            .map(|i| blob.read_u16(at + 22 + i * 2, endian))
            .collect::<Result<Vec<_>>>()?;
        starts.push(SegmentStarts {
            segment_index: index,
            size,
            page_size: blob.read_u16(at + 4, endian)?,
            pointer_format: blob.read_u16(at + 6, endian)?,
            segment_offset: blob.read_u64(at + 8, endian)?,
            max_valid_pointer: blob.read_u32(at + 16, endian)?,
            page_count,
            page_starts,
        });
    }
    Ok(starts)
}

fn walk_segment(
    starts: &SegmentStarts,
    segment_fileoff: u64,
    endian: Endian,
    source: &dyn ByteSource,
    out: &mut Vec<Fixup>,
) -> Result<()> {
    let Some(format) = PointerFormat::from_u16(starts.pointer_format) else {
        warn!(
            pointer_format = starts.pointer_format,
            "Skipping chains with an unknown pointer format"
        );
        return Ok(());
    };
    let stride = format.stride();
    let width: u64 = if format.is_64() { 8 } else { 4 };

    let mut walk_chain = |page: usize, offset_in_page: u64| -> Result<()> {
        let mut offset = segment_fileoff
            + page as u64 * u64::from(starts.page_size)
            + offset_in_page;
        loop {
            let data = source.read_exact_at(offset, width)?;
            let raw = if width == 8 {
                data.read_u64(0, endian)?
            } else {
                u64::from(data.read_u32(0, endian)?)
            };
            let pointer = format.decode(raw);
            out.push(Fixup {
                offset,
                raw,
                pointer,
            });
            let next = pointer.next();
            if next == 0 {
                return Ok(());
            }
            offset += next * stride;
        }
    };

    for (page, &start) in starts
        .page_starts
        .iter()
        .take(starts.page_count as usize)
        .enumerate()
    {
        if start == DYLD_CHAINED_PTR_START_NONE {
            continue;
        }
        if start & DYLD_CHAINED_PTR_START_MULTI != 0 && !format.is_64() {
            let mut index = (start & !DYLD_CHAINED_PTR_START_MULTI) as usize;
            loop {
                let Some(&entry) = starts.page_starts.get(index) else {
                    break;
                };
                walk_chain(page, u64::from(entry & !DYLD_CHAINED_PTR_START_LAST))?;
                if entry & DYLD_CHAINED_PTR_START_LAST != 0 {
                    break;
                }
                index += 1;
            }
        } else {
            walk_chain(page, u64::from(start))?;
        }
    }
    Ok(())
}

/// Name of a special library ordinal, or of an out-of-range one.
pub fn special_ordinal_name(ordinal: i32) -> Option<&'static str> {
    match ordinal {
        BIND_SPECIAL_DYLIB_SELF => Some("this-image"),
        BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => Some("main-executable"),
        BIND_SPECIAL_DYLIB_FLAT_LOOKUP => Some("flat-namespace"),
        BIND_SPECIAL_DYLIB_WEAK_LOOKUP => Some("weak-coalesce"),
        o if o < BIND_SPECIAL_DYLIB_WEAK_LOOKUP => Some("unknown-ordinal"),
        _ => None,
    }
}

impl fmt::Display for ChainedPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainedPointer::Rebase { target, auth, next } => write!(
                f,
                "{}rebase target={target:#x} next={next}",
                if *auth { "auth-" } else { "" }
            ),
            ChainedPointer::Bind {
                ordinal,
                addend,
                auth,
                next,
            } => write!(
                f,
                "{}bind ordinal={ordinal} addend={addend:#x} next={next}",
                if *auth { "auth-" } else { "" }
            ),
        }
    }
}
