//! Export trie decoding
//!
//! Each node starts with a ULEB128 terminal size. A non-zero size is followed
//! by the terminal info (flags and address, or a re-export ordinal and name).
//! The child list follows the terminal info: a child count byte, then for
//! each child a NUL-terminated edge label and the ULEB128 offset of the child
//! node from the start of the trie.

use crate::error::{MachOError, Result};
use crate::formats::macho::utils::{read_cstring, read_uleb, EndianRead};
use bitflags::bitflags;
use std::collections::HashSet;
use std::fmt;
use tracing::trace;

bitflags! {
    /// `EXPORT_SYMBOL_FLAGS_*` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExportFlags: u64 {
        const KIND_THREAD_LOCAL = 0x01;
        const KIND_ABSOLUTE = 0x02;
        const WEAK_DEFINITION = 0x04;
        const REEXPORT = 0x08;
        const STUB_AND_RESOLVER = 0x10;
        const STATIC_RESOLVER = 0x20;
        const _ = !0;
    }
}

pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Regular,
    ThreadLocal,
    Absolute,
    Reserved,
}

impl ExportFlags {
    pub fn kind(&self) -> ExportKind {
        match self.bits() & EXPORT_SYMBOL_FLAGS_KIND_MASK {
            0 => ExportKind::Regular,
            1 => ExportKind::ThreadLocal,
            2 => ExportKind::Absolute,
            _ => ExportKind::Reserved,
        }
    }

    pub fn is_reexport(&self) -> bool {
        self.contains(ExportFlags::REEXPORT)
    }

    pub fn is_weak(&self) -> bool {
        self.contains(ExportFlags::WEAK_DEFINITION)
    }

    pub fn is_stub_and_resolver(&self) -> bool {
        self.contains(ExportFlags::STUB_AND_RESOLVER)
    }
}

/// One exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieEntry {
    pub name: String,
    /// Slid address for regular and thread-local symbols; raw value otherwise.
    pub address: u64,
    pub flags: ExportFlags,
    /// Library ordinal for re-exports, slid resolver address for stubs.
    pub other: u64,
    /// Name in the re-exported library when it differs.
    pub reexport_name: Option<String>,
}

impl TrieEntry {
    /// Whether the symbol lives outside this image's regular code and data.
    pub fn is_indirect(&self) -> bool {
        self.flags.kind() != ExportKind::Regular || self.flags.is_reexport()
    }
}

impl fmt::Display for TrieEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flags.is_reexport() {
            write!(f, "{:#018x} {} (re-exported from ordinal {}", self.address, self.name, self.other)?;
            if let Some(orig) = &self.reexport_name {
                write!(f, " as {orig}")?;
            }
            return write!(f, ")");
        }
        write!(f, "{:#018x} {}", self.address, self.name)?;
        if self.flags.is_stub_and_resolver() {
            write!(f, " (resolver {:#x})", self.other)?;
        }
        Ok(())
    }
}

fn parse_terminal(data: &[u8], mut off: usize, name: String, load_address: u64) -> Result<TrieEntry> {
    let flags = ExportFlags::from_bits_retain(read_uleb(data, &mut off)?);
    if flags.is_reexport() {
        let ordinal = read_uleb(data, &mut off)?;
        let imported = read_cstring(data, off)?;
        return Ok(TrieEntry {
            name,
            address: 0,
            flags,
            other: ordinal,
            reexport_name: (!imported.is_empty()).then(|| imported.to_string()),
        });
    }

    let mut address = read_uleb(data, &mut off)?;
    let mut other = 0;
    if flags.is_stub_and_resolver() {
        other = read_uleb(data, &mut off)?.wrapping_add(load_address);
    }
    if matches!(flags.kind(), ExportKind::Regular | ExportKind::ThreadLocal) {
        address = address.wrapping_add(load_address);
    }
    Ok(TrieEntry {
        name,
        address,
        flags,
        other,
        reexport_name: None,
    })
}

/// Reads a node header, returning the terminal info offset (when present)
/// and the child list offset.
fn node_layout(data: &[u8], node: usize) -> Result<(Option<usize>, usize)> {
    let mut off = node;
    let terminal_size = read_uleb(data, &mut off)? as usize;
    let children = off.checked_add(terminal_size).filter(|&c| c < data.len()).ok_or_else(|| {
        MachOError::format_value(node as u64, "export trie terminal overruns the trie", terminal_size as u64)
    })?;
    Ok(((terminal_size > 0).then_some(off), children))
}

/// Decode every export in the trie.
pub fn parse_trie(data: &[u8], load_address: u64) -> Result<Vec<TrieEntry>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(0usize, String::new())];

    while let Some((node, prefix)) = stack.pop() {
        if !visited.insert(node) {
            return Err(MachOError::format(node as u64, "export trie contains a cycle"));
        }
        let (terminal, children) = node_layout(data, node)?;
        if let Some(t) = terminal {
            entries.push(parse_terminal(data, t, prefix.clone(), load_address)?);
        }

        let mut off = children;
        let count = data.read_u8(off)?;
        off += 1;
        let mut pending = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let label = read_cstring(data, off)?;
            off += label.len() + 1;
            let child = read_uleb(data, &mut off)? as usize;
            if child == 0 || child >= data.len() {
                return Err(MachOError::format_value(
                    off as u64,
                    "export trie child offset out of range",
                    child as u64,
                ));
            }
            pending.push((child, format!("{prefix}{label}")));
        }
        // Reverse so children pop in edge order.
        stack.extend(pending.into_iter().rev());
    }

    trace!(count = entries.len(), "Decoded export trie");
    Ok(entries)
}

/// Follow `symbol` through the trie, returning its terminal info offset.
pub fn walk_trie(data: &[u8], symbol: &str) -> Result<Option<usize>> {
    if data.is_empty() {
        return Ok(None);
    }
    let target = symbol.as_bytes();
    let mut consumed = 0;
    let mut node = 0;
    let mut visited = HashSet::new();

    loop {
        if !visited.insert(node) {
            return Err(MachOError::format(node as u64, "export trie contains a cycle"));
        }
        let (terminal, children) = node_layout(data, node)?;
        if consumed == target.len() {
            return Ok(terminal);
        }

        let mut off = children;
        let count = data.read_u8(off)?;
        off += 1;
        let mut next = None;
        for _ in 0..count {
            let label = read_cstring(data, off)?.as_bytes();
            off += label.len() + 1;
            let child = read_uleb(data, &mut off)? as usize;
            if target[consumed..].starts_with(label) && !label.is_empty() {
                next = Some((child, label.len()));
                break;
            }
        }
        match next {
            Some((child, len)) if child != 0 && child < data.len() => {
                node = child;
                consumed += len;
            }
            Some((child, _)) => {
                return Err(MachOError::format_value(
                    off as u64,
                    "export trie child offset out of range",
                    child as u64,
                ))
            }
            None => return Ok(None),
        }
    }
}

/// Look up one export by name.
pub fn lookup(data: &[u8], symbol: &str, load_address: u64) -> Result<Option<TrieEntry>> {
    walk_trie(data, symbol)?
        .map(|off| parse_terminal(data, off, symbol.to_string(), load_address))
        .transpose()
}
