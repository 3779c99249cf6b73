//! Mach-O image model
//!
//! [`MachO`] couples a parsed [`FileToc`] with the readers its offsets refer
//! to. Queries that need LINKEDIT data (symbols, exports, fixups, opcode
//! streams) decode it on demand; chained fixups are parsed once and kept.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tracing::debug;

pub mod codesign;
pub mod commands;
pub mod converter;
pub mod dyld_info;
pub mod export;
pub mod fat;
pub mod fixups;
pub mod headers;
pub mod parser;
pub mod segments;
pub mod symbols;
pub mod toc;
pub mod trie;
pub mod types;
pub mod utils;

pub use codesign::{SignedImage, Signer, SigningConfig, SpecialSlot};
pub use commands::{
    BuildVersion, Command, Ctx, DyldInfo, Dylib, EntryPoint, LcStr, LinkeditData, LoadCommand,
};
pub use converter::AddressTranslator;
pub use dyld_info::{Bind, DataInCodeEntry, Rebase};
pub use export::{DependencyIndex, ExportOptions, ExportReport, FixupLocation, LinkeditReport, SegmentMap};
pub use fat::{FatArch, FatFile};
pub use fixups::{ChainedFixups, ChainedImport, ChainedPointer, PointerFormat};
pub use parser::ParseConfig;
pub use segments::{Relocation, Section, Segment};
pub use symbols::{Dysymtab, Symbol, Symtab};
pub use toc::FileToc;
pub use trie::{ExportFlags, ExportKind, TrieEntry};
pub use types::*;

use crate::cache::AddressCache;
use crate::config::MachoConfig;
use crate::error::{MachOError, Result};
use crate::io::{ByteSource, IOLimits, MemorySource, SafeReader};

/// A parsed Mach-O image.
pub struct MachO {
    pub(crate) toc: FileToc,
    /// Image bytes: header, load commands and segment contents.
    pub(crate) source: Arc<dyn ByteSource>,
    /// Reader for offsets named by load commands.
    pub(crate) cache: Arc<dyn ByteSource>,
    pub(crate) translator: Option<Arc<dyn AddressTranslator>>,
    config: ParseConfig,
    fixups: OnceCell<Option<ChainedFixups>>,
    pub(crate) strings: AddressCache<String>,
}

impl std::fmt::Debug for MachO {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachO")
            .field("header", &self.toc.header)
            .field("loads", &self.toc.loads.len())
            .field("sections", &self.toc.sections.len())
            .field("config", &self.config)
            .finish()
    }
}

impl MachO {
    /// Parse an image with default settings.
    pub fn parse(source: Arc<dyn ByteSource>) -> Result<Self> {
        Self::with_config(source, ParseConfig::default())
    }

    /// Parse an image with a custom cache reader, translator or filter.
    pub fn with_config(source: Arc<dyn ByteSource>, config: ParseConfig) -> Result<Self> {
        let cache = config.cache.clone().unwrap_or_else(|| Arc::clone(&source));
        let toc = parser::parse_toc(&*source, &*cache, &config.settings)?;
        Ok(Self {
            toc,
            source,
            cache,
            translator: config.translator.clone(),
            config,
            fixups: OnceCell::new(),
            strings: AddressCache::new(),
        })
    }

    /// Parse an in-memory image.
    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        Self::parse(MemorySource::new(data).into_source())
    }

    /// Memory-map and parse a file under the configured I/O limits.
    pub fn open<P: AsRef<Path>>(path: P, config: &MachoConfig) -> Result<Self> {
        let reader = SafeReader::open(path.as_ref(), config.io.clone())?;
        debug!(path = %path.as_ref().display(), "Opened Mach-O file");
        Self::with_config(
            reader.into_source(),
            ParseConfig::with_settings(config.parse.clone()),
        )
    }

    // Table of contents

    pub fn toc(&self) -> &FileToc {
        &self.toc
    }

    /// Mutable access for adding or removing load commands before saving.
    pub fn toc_mut(&mut self) -> &mut FileToc {
        &mut self.toc
    }

    pub fn header(&self) -> &FileHeader {
        &self.toc.header
    }

    pub fn ctx(&self) -> Ctx {
        self.toc.ctx()
    }

    pub fn loads(&self) -> &[LoadCommand] {
        &self.toc.loads
    }

    pub fn sections(&self) -> &[Section] {
        &self.toc.sections
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.toc.segments()
    }

    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }

    pub fn cache_reader(&self) -> &Arc<dyn ByteSource> {
        &self.cache
    }

    pub fn parse_config(&self) -> &ParseConfig {
        &self.config
    }

    pub fn segment(&self, name: &str) -> Result<&Segment> {
        self.toc
            .segment(name)
            .ok_or_else(|| MachOError::not_found("segment", name))
    }

    pub fn section(&self, segname: &str, name: &str) -> Result<&Section> {
        self.toc
            .section(segname, name)
            .ok_or_else(|| MachOError::not_found("section", format!("{segname}.{name}")))
    }

    pub fn segment_for_address(&self, addr: u64) -> Result<&Segment> {
        self.segments()
            .find(|s| s.contains_address(addr))
            .ok_or_else(|| MachOError::not_found("segment for address", format!("{addr:#x}")))
    }

    pub fn section_for_address(&self, addr: u64) -> Result<&Section> {
        self.sections()
            .iter()
            .find(|s| s.contains_address(addr))
            .ok_or_else(|| MachOError::not_found("section for address", format!("{addr:#x}")))
    }

    /// Section contents; zero-fill sections read as zeros.
    pub fn section_data(&self, segname: &str, name: &str) -> Result<Bytes> {
        let section = self.section(segname, name)?;
        if section.is_zerofill() {
            let limit = IOLimits::default().max_read_bytes;
            if section.size > limit {
                return Err(MachOError::format_value(
                    u64::from(section.offset),
                    format!("zero-fill section {segname},{name} exceeds {limit:#x} bytes"),
                    section.size,
                ));
            }
            return Ok(Bytes::from(vec![0u8; section.size as usize]));
        }
        self.read_at_addr(section.addr, section.size)
    }

    pub fn segment_data(&self, name: &str) -> Result<Bytes> {
        let segment = self.segment(name)?;
        self.read_at_addr(segment.vmaddr, segment.filesize)
    }

    /// Relocation entries of a section, decoded on first use.
    pub fn relocations(&self, segname: &str, name: &str) -> Result<&[Relocation]> {
        let section = self.section(segname, name)?;
        section.relocations(&*self.cache, self.ctx())
    }

    // Symbols

    pub fn symtab(&self) -> Option<&Symtab> {
        self.toc.loads.iter().find_map(|l| match &l.body {
            Command::Symtab(s) => Some(s),
            _ => None,
        })
    }

    pub fn dysymtab(&self) -> Option<&Dysymtab> {
        self.toc.loads.iter().find_map(|l| match &l.body {
            Command::Dysymtab(d) => Some(d),
            _ => None,
        })
    }

    pub fn symbols(&self) -> &[Symbol] {
        self.symtab().map(|s| s.symbols.as_slice()).unwrap_or(&[])
    }

    pub fn symbol_by_name(&self, name: &str) -> Result<&Symbol> {
        self.symtab()
            .and_then(|s| s.by_name(name))
            .ok_or_else(|| MachOError::not_found("symbol", name))
    }

    /// Address of a defined symbol. Looks in the symbol table, then the
    /// exports, then the symbol table ignoring case.
    pub fn find_symbol_address(&self, name: &str) -> Result<u64> {
        let defined = |s: &&Symbol| !s.is_undefined() && !s.is_stab();
        if let Some(sym) = self.symbols().iter().filter(defined).find(|s| s.name == name) {
            return Ok(sym.value);
        }
        if let Ok(entry) = self.export_trie_lookup(name) {
            return Ok(entry.address);
        }
        self.symbols()
            .iter()
            .filter(defined)
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| s.value)
            .ok_or_else(|| MachOError::not_found("symbol", name))
    }

    /// Undefined symbols named by the dynamic symbol table.
    pub fn imported_symbols(&self) -> Vec<&Symbol> {
        let Some(dysymtab) = self.dysymtab() else {
            return Vec::new();
        };
        if dysymtab.nundefsym == 0 {
            return Vec::new();
        }
        let start = dysymtab.iundefsym as usize;
        let end = start + dysymtab.nundefsym as usize;
        self.symbols()
            .get(start..end)
            .map(|s| s.iter().collect())
            .unwrap_or_default()
    }

    /// Install names of the dylibs this image links, in ordinal order.
    pub fn imported_libraries(&self) -> Vec<&str> {
        self.toc
            .loads
            .iter()
            .filter(|l| lc::is_dylib_load(l.cmd))
            .filter_map(|l| l.as_dylib())
            .map(|d| d.name.value.as_str())
            .collect()
    }

    /// Library named by a two-level namespace ordinal.
    pub fn library_ordinal_name(&self, ordinal: i32) -> String {
        if let Some(special) = fixups::special_ordinal_name(ordinal) {
            return special.to_string();
        }
        self.imported_libraries()
            .get(ordinal as usize - 1)
            .map_or_else(|| "unknown-ordinal".to_string(), |s| s.to_string())
    }

    // Metadata

    pub fn uuid(&self) -> Option<uuid::Uuid> {
        self.toc.loads.iter().find_map(|l| match &l.body {
            Command::Uuid(bytes) => Some(uuid::Uuid::from_bytes(*bytes)),
            _ => None,
        })
    }

    pub fn build_version(&self) -> Option<&BuildVersion> {
        self.toc.loads.iter().find_map(|l| match &l.body {
            Command::BuildVersion(b) => Some(b),
            _ => None,
        })
    }

    pub fn source_version(&self) -> Option<SourceVersion> {
        self.toc.loads.iter().find_map(|l| match &l.body {
            Command::SourceVersion(v) => Some(*v),
            _ => None,
        })
    }

    pub fn entry_point(&self) -> Option<&EntryPoint> {
        self.toc.loads.iter().find_map(|l| match &l.body {
            Command::EntryPoint(e) => Some(e),
            _ => None,
        })
    }

    /// The image's own install name, for dylibs.
    pub fn dylib_id(&self) -> Option<&Dylib> {
        self.toc.find_load(lc::ID_DYLIB).and_then(|(_, l)| l.as_dylib())
    }

    pub fn rpaths(&self) -> Vec<&str> {
        self.toc
            .loads
            .iter()
            .filter_map(|l| match &l.body {
                Command::Rpath(p) => Some(p.value.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn linkedit_data(&self, cmd: u32) -> Option<LinkeditData> {
        self.toc
            .find_load(cmd)
            .and_then(|(_, l)| l.as_linkedit_data().copied())
    }

    pub fn code_signature(&self) -> Option<LinkeditData> {
        self.linkedit_data(lc::CODE_SIGNATURE)
    }

    pub fn dyld_info(&self) -> Option<&DyldInfo> {
        self.toc.loads.iter().find_map(|l| match &l.body {
            Command::DyldInfo(d) => Some(d),
            _ => None,
        })
    }

    /// Whether the image was extracted from a shared cache.
    pub fn is_cache_resident(&self) -> bool {
        self.toc.header.flags.contains(HeaderFlags::DYLIB_IN_CACHE)
    }

    pub(crate) fn read_linkedit(&self, offset: u32, size: u32) -> Result<Bytes> {
        Ok(self.cache.read_exact_at(u64::from(offset), u64::from(size))?)
    }

    pub fn function_starts(&self) -> Result<Vec<u64>> {
        let Some(ld) = self.linkedit_data(lc::FUNCTION_STARTS) else {
            return Ok(Vec::new());
        };
        let data = self.read_linkedit(ld.offset, ld.size)?;
        dyld_info::parse_function_starts(&data, self.preferred_load_address())
    }

    pub fn data_in_code(&self) -> Result<Vec<DataInCodeEntry>> {
        let Some(ld) = self.linkedit_data(lc::DATA_IN_CODE) else {
            return Ok(Vec::new());
        };
        let data = self.read_linkedit(ld.offset, ld.size)?;
        dyld_info::parse_data_in_code(&data, self.toc.header.endian)
    }

    // Dyld information

    /// Raw export trie: `LC_DYLD_EXPORTS_TRIE`, else the dyld-info export blob.
    pub fn export_trie_data(&self) -> Result<Option<Bytes>> {
        if let Some(ld) = self.linkedit_data(lc::DYLD_EXPORTS_TRIE) {
            return self.read_linkedit(ld.offset, ld.size).map(Some);
        }
        match self.dyld_info() {
            Some(info) if info.export_size > 0 => {
                self.read_linkedit(info.export_off, info.export_size).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Every exported symbol, with addresses slid to the preferred load address.
    pub fn dyld_exports(&self) -> Result<Vec<TrieEntry>> {
        match self.export_trie_data()? {
            Some(data) => trie::parse_trie(&data, self.preferred_load_address()),
            None => Ok(Vec::new()),
        }
    }

    pub fn export_trie_lookup(&self, name: &str) -> Result<TrieEntry> {
        let data = self
            .export_trie_data()?
            .ok_or_else(|| MachOError::not_found("export trie", name))?;
        trie::lookup(&data, name, self.preferred_load_address())?
            .ok_or_else(|| MachOError::not_found("export", name))
    }

    /// Chained fixups, parsed on first use.
    pub fn chained_fixups(&self) -> Result<Option<&ChainedFixups>> {
        self.fixups
            .get_or_try_init(|| {
                let Some(ld) = self.linkedit_data(lc::DYLD_CHAINED_FIXUPS) else {
                    return Ok(None);
                };
                let blob = self.read_linkedit(ld.offset, ld.size)?;
                let segments: Vec<Segment> = self.segments().cloned().collect();
                ChainedFixups::parse(&blob, self.toc.header.endian, &segments, &*self.cache)
                    .map(Some)
            })
            .map(Option::as_ref)
    }

    /// Rebase records from the dyld-info opcode stream.
    pub fn rebases(&self) -> Result<Vec<Rebase>> {
        let Some(info) = self.dyld_info().copied() else {
            return Ok(Vec::new());
        };
        if info.rebase_size == 0 {
            return Ok(Vec::new());
        }
        let data = self.read_linkedit(info.rebase_off, info.rebase_size)?;
        let segments: Vec<Segment> = self.segments().cloned().collect();
        dyld_info::parse_rebases(&data, &segments, self.toc.header.pointer_size())
    }

    /// Bind, weak-bind and lazy-bind records, in that order.
    pub fn binds(&self) -> Result<Vec<Bind>> {
        let Some(info) = self.dyld_info().copied() else {
            return Ok(Vec::new());
        };
        let segments: Vec<Segment> = self.segments().cloned().collect();
        let ptr = self.toc.header.pointer_size();
        let mut out = Vec::new();
        for (off, size, lazy) in [
            (info.bind_off, info.bind_size, false),
            (info.weak_bind_off, info.weak_bind_size, false),
            (info.lazy_bind_off, info.lazy_bind_size, true),
        ] {
            if size > 0 {
                let data = self.read_linkedit(off, size)?;
                out.extend(dyld_info::parse_binds(&data, &segments, ptr, lazy)?);
            }
        }
        Ok(out)
    }

    // Serialization

    /// Encode the image: header and load commands followed by each segment's
    /// bytes at its file offset.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let head = self.toc.to_bytes()?;
        let available = self.cache.size();
        let mut end = head.len() as u64;
        for seg in self.segments().filter(|s| s.filesize > 0) {
            match seg.fileoff.checked_add(seg.filesize) {
                Some(seg_end) if seg_end <= available => end = end.max(seg_end),
                _ => {
                    return Err(MachOError::Truncated {
                        offset: usize::try_from(seg.fileoff).unwrap_or(usize::MAX),
                        needed: usize::try_from(seg.filesize).unwrap_or(usize::MAX),
                    })
                }
            }
        }
        let mut out = vec![0u8; end as usize];

        for seg in self.segments().filter(|s| s.filesize > 0) {
            let data = self.cache.read_exact_at(seg.fileoff, seg.filesize)?;
            let start = seg.fileoff as usize;
            out[start..start + data.len()].copy_from_slice(&data);
        }

        let limit = self.first_section_offset().unwrap_or(end);
        if head.len() as u64 > limit {
            return Err(MachOError::Capacity {
                reserved: limit,
                written: head.len() as u64,
            });
        }
        out[..head.len()].copy_from_slice(&head);
        Ok(out)
    }

    /// Write the encoded image to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), &bytes)?;
        debug!(path = %path.as_ref().display(), size = bytes.len(), "Saved Mach-O image");
        Ok(())
    }

    /// Lowest non-zero file offset of any section in `__TEXT`; load commands
    /// must end before it.
    pub(crate) fn first_section_offset(&self) -> Option<u64> {
        let text = self.toc.segment("__TEXT")?;
        self.toc
            .sections_of(text)
            .iter()
            .filter(|s| s.offset != 0 && !s.is_zerofill())
            .map(|s| u64::from(s.offset))
            .min()
    }

    /// Load-command space available before the first section, rounded down
    /// to the word size.
    pub fn load_command_capacity(&self) -> u64 {
        let limit = self.first_section_offset().unwrap_or(0);
        let header = self.toc.header.size() as u64;
        let word = self.toc.header.pointer_size();
        limit.saturating_sub(header) / word * word
    }
}
