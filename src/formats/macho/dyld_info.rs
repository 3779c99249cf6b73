//! Compressed dyld info streams and other LINKEDIT tables.
//!
//! Rebase and bind information (`LC_DYLD_INFO[_ONLY]`) is a byte-coded
//! program that drives a small state machine; every `DO_*` opcode emits one
//! or more records. Function starts are a ULEB128 delta list and data-in-code
//! is a flat array of 8-byte entries.

use crate::error::{MachOError, Result};
use crate::formats::macho::segments::Segment;
use crate::formats::macho::types::Endian;
use crate::formats::macho::utils::{read_cstring, read_sleb, read_uleb, EndianRead};
use std::fmt;
use tracing::{trace, warn};

const OPCODE_MASK: u8 = 0xf0;
const IMMEDIATE_MASK: u8 = 0x0f;

const REBASE_OPCODE_DONE: u8 = 0x00;
const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xa0;
const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xb0;
const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xc0;
const BIND_OPCODE_THREADED: u8 = 0xd0;

const BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB: u8 = 0x00;

pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;

/// A pointer slid by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebase {
    pub segment_index: usize,
    pub segment_offset: u64,
    pub address: u64,
    pub kind: u8,
}

/// A pointer bound to an imported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub segment_index: usize,
    pub segment_offset: u64,
    pub address: u64,
    pub kind: u8,
    pub ordinal: i32,
    pub name: String,
    pub addend: i64,
    pub weak_import: bool,
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x} {} (ordinal {})", self.address, self.name, self.ordinal)?;
        if self.addend != 0 {
            write!(f, " + {:#x}", self.addend)?;
        }
        if self.weak_import {
            write!(f, " [weak]")?;
        }
        Ok(())
    }
}

fn segment_address(segments: &[Segment], index: usize, op_offset: usize) -> Result<u64> {
    segments.get(index).map(|s| s.vmaddr).ok_or_else(|| {
        MachOError::format_value(op_offset as u64, "opcode references a missing segment", index as u64)
    })
}

/// Decode a rebase opcode stream.
pub fn parse_rebases(data: &[u8], segments: &[Segment], pointer_size: u64) -> Result<Vec<Rebase>> {
    let mut out = Vec::new();
    let mut kind = 0u8;
    let mut seg_index = 0usize;
    let mut seg_offset = 0u64;
    let mut off = 0usize;

    let emit = |out: &mut Vec<Rebase>, seg_index: usize, seg_offset: u64, kind: u8, at: usize| -> Result<()> {
        let base = segment_address(segments, seg_index, at)?;
        out.push(Rebase {
            segment_index: seg_index,
            segment_offset: seg_offset,
            address: base.wrapping_add(seg_offset),
            kind,
        });
        Ok(())
    };

    while off < data.len() {
        let at = off;
        let byte = data[off];
        off += 1;
        let imm = byte & IMMEDIATE_MASK;
        match byte & OPCODE_MASK {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => kind = imm,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = imm as usize;
                seg_offset = read_uleb(data, &mut off)?;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                seg_offset = seg_offset.wrapping_add(read_uleb(data, &mut off)?);
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                seg_offset = seg_offset.wrapping_add(u64::from(imm) * pointer_size);
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..imm {
                    emit(&mut out, seg_index, seg_offset, kind, at)?;
                    seg_offset = seg_offset.wrapping_add(pointer_size);
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let count = read_uleb(data, &mut off)?;
                for _ in 0..count {
                    emit(&mut out, seg_index, seg_offset, kind, at)?;
                    seg_offset = seg_offset.wrapping_add(pointer_size);
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                emit(&mut out, seg_index, seg_offset, kind, at)?;
                let skip = read_uleb(data, &mut off)?;
                seg_offset = seg_offset.wrapping_add(skip).wrapping_add(pointer_size);
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb(data, &mut off)?;
                let skip = read_uleb(data, &mut off)?;
                for _ in 0..count {
                    emit(&mut out, seg_index, seg_offset, kind, at)?;
                    seg_offset = seg_offset.wrapping_add(skip).wrapping_add(pointer_size);
                }
            }
            other => {
                return Err(MachOError::format_value(at as u64, "unknown rebase opcode", u64::from(other)))
            }
        }
    }

    trace!(count = out.len(), "Decoded rebase opcodes");
    Ok(out)
}

/// Registers of the bind state machine.
struct BindState {
    ordinal: i32,
    name: String,
    weak_import: bool,
    kind: u8,
    addend: i64,
    seg_index: usize,
    seg_offset: u64,
}

impl BindState {
    fn record(&self, segments: &[Segment], at: usize) -> Result<Bind> {
        let base = segment_address(segments, self.seg_index, at)?;
        Ok(Bind {
            segment_index: self.seg_index,
            segment_offset: self.seg_offset,
            address: base.wrapping_add(self.seg_offset),
            kind: self.kind,
            ordinal: self.ordinal,
            name: self.name.clone(),
            addend: self.addend,
            weak_import: self.weak_import,
        })
    }
}

/// Decode a bind opcode stream. Lazy streams use `DONE` as a separator
/// between entries rather than as a terminator.
pub fn parse_binds(data: &[u8], segments: &[Segment], pointer_size: u64, lazy: bool) -> Result<Vec<Bind>> {
    let mut out = Vec::new();
    let mut st = BindState {
        ordinal: 0,
        name: String::new(),
        weak_import: false,
        kind: 1,
        addend: 0,
        seg_index: 0,
        seg_offset: 0,
    };
    let mut off = 0usize;

    while off < data.len() {
        let at = off;
        let byte = data[off];
        off += 1;
        let imm = byte & IMMEDIATE_MASK;

        match byte & OPCODE_MASK {
            BIND_OPCODE_DONE => {
                if !lazy {
                    break;
                }
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => st.ordinal = i32::from(imm),
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => st.ordinal = read_uleb(data, &mut off)? as i32,
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                st.ordinal = if imm == 0 {
                    0
                } else {
                    i32::from((OPCODE_MASK | imm) as i8)
                };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let s = read_cstring(data, off)?;
                off += s.len() + 1;
                st.name = s.to_string();
                st.weak_import = imm & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0;
            }
            BIND_OPCODE_SET_TYPE_IMM => st.kind = imm,
            BIND_OPCODE_SET_ADDEND_SLEB => st.addend = read_sleb(data, &mut off)?,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                st.seg_index = imm as usize;
                st.seg_offset = read_uleb(data, &mut off)?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                st.seg_offset = st.seg_offset.wrapping_add(read_uleb(data, &mut off)?);
            }
            BIND_OPCODE_DO_BIND => {
                out.push(st.record(segments, at)?);
                st.seg_offset = st.seg_offset.wrapping_add(pointer_size);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                out.push(st.record(segments, at)?);
                let skip = read_uleb(data, &mut off)?;
                st.seg_offset = st.seg_offset.wrapping_add(skip).wrapping_add(pointer_size);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                out.push(st.record(segments, at)?);
                st.seg_offset = st
                    .seg_offset
                    .wrapping_add(u64::from(imm) * pointer_size + pointer_size);
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb(data, &mut off)?;
                let skip = read_uleb(data, &mut off)?;
                for _ in 0..count {
                    out.push(st.record(segments, at)?);
                    st.seg_offset = st.seg_offset.wrapping_add(skip).wrapping_add(pointer_size);
                }
            }
            BIND_OPCODE_THREADED => {
                if imm == BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB {
                    read_uleb(data, &mut off)?;
                }
                warn!(offset = at, "Threaded bind opcodes are not expanded");
            }
            other => {
                return Err(MachOError::format_value(at as u64, "unknown bind opcode", u64::from(other)))
            }
        }
    }

    trace!(count = out.len(), lazy, "Decoded bind opcodes");
    Ok(out)
}

/// Decode an `LC_FUNCTION_STARTS` delta list into addresses.
pub fn parse_function_starts(data: &[u8], text_vmaddr: u64) -> Result<Vec<u64>> {
    let mut starts = Vec::new();
    let mut address = text_vmaddr;
    let mut off = 0;
    while off < data.len() {
        let delta = read_uleb(data, &mut off)?;
        if delta == 0 {
            break;
        }
        address = address.wrapping_add(delta);
        starts.push(address);
    }
    Ok(starts)
}

/// One `LC_DATA_IN_CODE` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataInCodeEntry {
    pub offset: u32,
    pub length: u16,
    pub kind: u16,
}

pub const DATA_IN_CODE_ENTRY_SIZE: usize = 8;

pub fn parse_data_in_code(data: &[u8], endian: Endian) -> Result<Vec<DataInCodeEntry>> {
    data.chunks_exact(DATA_IN_CODE_ENTRY_SIZE)
        .map(|chunk| {
            Ok(DataInCodeEntry {
                offset: chunk.read_u32(0, endian)?,
                length: chunk.read_u16(4, endian)?,
                kind: chunk.read_u16(6, endian)?,
            })
        })
        .collect()
}
