//! Standalone image export
//!
//! Exporting lays segments out back to back on page boundaries, rewrites
//! every offset-bearing load-command field through the resulting segment map
//! and writes the segment bytes at their new offsets. Images extracted from a
//! shared cache also get a freshly synthesized `__LINKEDIT` holding only
//! their own tables. The parsed image is never modified; the new command
//! list is built from a copy.

use crate::config::ExportSettings;
use crate::error::{MachOError, Result};
use crate::formats::macho::commands::Command;
use crate::formats::macho::fixups::{ChainedFixups, ChainedPointer};
use crate::formats::macho::segments::Segment;
use crate::formats::macho::symbols::{remap_indirect_index, Symbol};
use crate::formats::macho::toc::FileToc;
use crate::formats::macho::types::{lc, nlist, HeaderFlags};
use crate::formats::macho::utils::{align_up, pad_to, EndianWrite};
use crate::formats::macho::MachO;
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Inputs to [`MachO::export`].
#[derive(Debug, Clone, Default)]
pub struct ExportOptions<'a> {
    /// Fixups whose locations are reported in the new layout.
    pub chained_fixups: Option<&'a ChainedFixups>,
    /// Load address used to report rebase targets.
    pub base_address: u64,
    /// Local symbols to add when rebuilding the symbol table.
    pub locals: Vec<Symbol>,
    pub settings: ExportSettings,
}

/// Old and new file range of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMapEntry {
    pub segment: String,
    pub old_start: u64,
    pub old_end: u64,
    pub new_start: u64,
    pub new_end: u64,
}

impl fmt::Display for SegmentMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} {:#010x}-{:#010x} -> {:#010x}-{:#010x}",
            self.segment, self.old_start, self.old_end, self.new_start, self.new_end
        )
    }
}

/// Old-to-new file offset mapping for one export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentMap {
    /// In segment load order.
    pub entries: Vec<SegmentMapEntry>,
    /// Entry indices ordered by old start.
    sorted: Vec<usize>,
}

impl SegmentMap {
    /// Assign each segment the next `alignment`-aligned range after the
    /// previous one, in load order.
    pub fn build<'a>(segments: impl IntoIterator<Item = &'a Segment>, alignment: u64) -> Self {
        let mut cursor = 0u64;
        let entries: Vec<SegmentMapEntry> = segments
            .into_iter()
            .map(|seg| {
                let new_start = cursor;
                let new_end = new_start + align_up(seg.filesize, alignment);
                cursor = new_end;
                SegmentMapEntry {
                    segment: seg.name.clone(),
                    old_start: seg.fileoff,
                    old_end: seg.fileoff + seg.filesize,
                    new_start,
                    new_end,
                }
            })
            .collect();
        let mut sorted: Vec<usize> = (0..entries.len()).collect();
        sorted.sort_by_key(|&i| entries[i].old_start);
        Self { entries, sorted }
    }

    /// New offset of an old file offset. An offset inside a segment maps
    /// through that segment; an offset equal to a segment's end maps to the
    /// end of its new range when no segment starts there.
    pub fn remap(&self, offset: u64) -> Result<u64> {
        let ordered = || self.sorted.iter().map(|&i| &self.entries[i]);
        ordered()
            .find(|e| e.old_start <= offset && offset < e.old_end)
            .or_else(|| ordered().find(|e| offset == e.old_end))
            .map(|e| offset - e.old_start + e.new_start)
            .ok_or(MachOError::Remap { offset })
    }

    pub fn entry(&self, segment_index: usize) -> Option<&SegmentMapEntry> {
        self.entries.get(segment_index)
    }
}

/// Dylib load commands seen during export, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyIndex {
    pub count: u32,
    /// 1-based ordinals of `LC_REEXPORT_DYLIB` commands.
    pub reexport_ordinals: Vec<u32>,
}

impl DependencyIndex {
    pub fn is_reexport(&self, ordinal: u64) -> bool {
        self.reexport_ordinals.iter().any(|&o| u64::from(o) == ordinal)
    }
}

/// Outcome of a `__LINKEDIT` rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkeditReport {
    /// Bytes of tables written before padding.
    pub written: u64,
    /// Final segment file size.
    pub reserved: u64,
    pub nsyms: u32,
    pub injected_locals: u32,
    /// Offset added to each kept symbol's index, less the dropped symbols
    /// that preceded it.
    pub indirect_shift: u32,
}

/// A fixup location carried into the new layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupLocation {
    pub old_offset: u64,
    pub new_offset: u64,
    pub pointer: ChainedPointer,
    /// Rebase target at the requested base address.
    pub target: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub segment_map: SegmentMap,
    pub dependencies: DependencyIndex,
    pub linkedit: Option<LinkeditReport>,
    pub fixups: Vec<FixupLocation>,
    pub bytes_written: u64,
}

const N_INDR_EXT: u8 = nlist::N_INDR | nlist::N_EXT;

fn remap_u32(map: &SegmentMap, offset: u32) -> Result<u32> {
    map.remap(u64::from(offset)).map(|v| v as u32)
}

fn remap_nonzero_u32(map: &SegmentMap, offset: &mut u32) -> Result<()> {
    if *offset != 0 {
        *offset = remap_u32(map, *offset)?;
    }
    Ok(())
}

/// Rewrite the offset-bearing fields of `toc` through `map`.
fn rewrite_offsets(toc: &mut FileToc, map: &SegmentMap, cache_resident: bool) -> Result<DependencyIndex> {
    let mut deps = DependencyIndex::default();
    let FileToc { loads, sections, .. } = toc;
    let mut segment_index = 0usize;

    for load in loads.iter_mut() {
        match &mut load.body {
            Command::Segment(seg) => {
                let entry = map.entry(segment_index).ok_or_else(|| {
                    MachOError::not_found("segment map entry", seg.name.clone())
                })?;
                segment_index += 1;
                seg.fileoff = entry.new_start;
                seg.filesize = entry.new_end - entry.new_start;
                seg.vmsize = seg.vmsize.max(seg.filesize);

                let first = seg.first_section;
                let owned = sections
                    .get_mut(first..first + seg.nsects as usize)
                    .unwrap_or(&mut []);
                for section in owned {
                    for field in [&mut section.offset, &mut section.reloff] {
                        if *field == 0 {
                            continue;
                        }
                        match remap_u32(map, *field) {
                            Ok(v) => *field = v,
                            Err(err) => warn!(
                                section = %section.name,
                                error = %err,
                                "Leaving unmappable section offset unchanged"
                            ),
                        }
                    }
                }
            }
            Command::EncryptionInfo(enc) => enc.offset = remap_u32(map, enc.offset)?,
            Command::EntryPoint(entry) => entry.entry_offset = map.remap(entry.entry_offset)?,
            Command::FilesetEntry(entry) => entry.file_offset = map.remap(entry.file_offset)?,
            Command::LinkeditData(ld) => remap_nonzero_u32(map, &mut ld.offset)?,
            Command::Symtab(symtab) if !cache_resident => {
                remap_nonzero_u32(map, &mut symtab.symoff)?;
                remap_nonzero_u32(map, &mut symtab.stroff)?;
            }
            Command::Dysymtab(d) if !cache_resident => {
                for field in [
                    &mut d.tocoff,
                    &mut d.modtaboff,
                    &mut d.extrefsymoff,
                    &mut d.indirectsymoff,
                    &mut d.extreloff,
                    &mut d.locreloff,
                ] {
                    remap_nonzero_u32(map, field)?;
                }
            }
            Command::DyldInfo(info) if !cache_resident => {
                for field in [
                    &mut info.rebase_off,
                    &mut info.bind_off,
                    &mut info.weak_bind_off,
                    &mut info.lazy_bind_off,
                    &mut info.export_off,
                ] {
                    remap_nonzero_u32(map, field)?;
                }
            }
            Command::Dylib(_) if lc::is_dylib_load(load.cmd) => {
                deps.count += 1;
                if load.cmd == lc::REEXPORT_DYLIB {
                    deps.reexport_ordinals.push(deps.count);
                }
            }
            _ => {}
        }
    }
    Ok(deps)
}

fn linkedit_data_mut(toc: &mut FileToc, cmd: u32) -> Option<&mut crate::formats::macho::commands::LinkeditData> {
    toc.loads.iter_mut().find(|l| l.cmd == cmd).and_then(|l| match &mut l.body {
        Command::LinkeditData(ld) => Some(ld),
        _ => None,
    })
}

impl MachO {
    /// Synthesize a `__LINKEDIT` for a cache-resident image and point the
    /// commands in `toc` at it. `linkedit_off` is the segment's new offset and
    /// `limit` the file space the segment map reserved for it.
    fn rebuild_linkedit(
        &self,
        toc: &mut FileToc,
        linkedit_off: u64,
        limit: u64,
        deps: &DependencyIndex,
        options: &ExportOptions<'_>,
    ) -> Result<(Vec<u8>, LinkeditReport)> {
        let ctx = toc.ctx();
        let ptr = toc.header.pointer_size();
        let mut buf: Vec<u8> = Vec::new();
        let here = |buf: &Vec<u8>| (linkedit_off + buf.len() as u64) as u32;

        for cmd in [lc::DYLD_EXPORTS_TRIE, lc::DATA_IN_CODE, lc::FUNCTION_STARTS] {
            let Some(orig) = self.linkedit_data(cmd) else {
                continue;
            };
            let new_off = here(&buf);
            if orig.size > 0 {
                buf.extend_from_slice(&self.read_linkedit(orig.offset, orig.size)?);
                pad_to(&mut buf, ptr);
            }
            if let Some(ld) = linkedit_data_mut(toc, cmd) {
                ld.offset = new_off;
            }
        }

        if let Some(orig) = self.dyld_info().copied() {
            let mut fields = [
                (orig.rebase_off, orig.rebase_size),
                (orig.bind_off, orig.bind_size),
                (orig.weak_bind_off, orig.weak_bind_size),
                (orig.lazy_bind_off, orig.lazy_bind_size),
                (orig.export_off, orig.export_size),
            ];
            for (off, size) in fields.iter_mut() {
                if *size == 0 {
                    continue;
                }
                let data = self.read_linkedit(*off, *size)?;
                *off = here(&buf);
                buf.extend_from_slice(&data);
                pad_to(&mut buf, ptr);
            }
            if let Some(Command::DyldInfo(info)) = toc
                .loads
                .iter_mut()
                .map(|l| &mut l.body)
                .find(|b| matches!(b, Command::DyldInfo(_)))
            {
                info.rebase_off = fields[0].0;
                info.bind_off = fields[1].0;
                info.weak_bind_off = fields[2].0;
                info.lazy_bind_off = fields[3].0;
                info.export_off = fields[4].0;
            }
        }

        let mut report = LinkeditReport::default();

        if let Some(symtab) = self.symtab() {
            let existing: HashSet<&str> = symtab.symbols.iter().map(|s| s.name.as_str()).collect();
            let injected: Vec<&Symbol> = options
                .locals
                .iter()
                .filter(|s| !existing.contains(s.name.as_str()))
                .collect();

            let exports = self.dyld_exports()?;
            let mut pool = vec![0u8];
            let mut table = Vec::new();
            let mut symbols = Vec::new();
            let mut push = |sym: Symbol, extra: Option<&str>, table: &mut Vec<u8>, pool: &mut Vec<u8>| {
                let strx = pool.len() as u32;
                pool.extend_from_slice(sym.name.as_bytes());
                pool.push(0);
                if let Some(extra) = extra {
                    pool.extend_from_slice(extra.as_bytes());
                    pool.push(0);
                }
                sym.write_nlist(table, ctx, strx);
                symbols.push(Symbol { name_offset: strx, ..sym });
            };

            for sym in &injected {
                push((*sym).clone(), None, &mut table, &mut pool);
            }
            let kept: Vec<bool> = symtab
                .symbols
                .iter()
                .map(|s| s.name != options.settings.redacted_symbol)
                .collect();
            for (sym, _) in symtab.symbols.iter().zip(&kept).filter(|(_, k)| **k) {
                push(sym.clone(), None, &mut table, &mut pool);
            }
            for exp in exports.iter().filter(|e| e.is_indirect()) {
                if options.settings.skip_reexported_dylib_symbols
                    && exp.flags.is_reexport()
                    && deps.is_reexport(exp.other)
                {
                    continue;
                }
                let sym = Symbol::new(exp.name.clone(), N_INDR_EXT, 0, 0, exp.address);
                push(sym, Some(exp.reexport_name.as_deref().unwrap_or("")), &mut table, &mut pool);
            }

            let symoff = here(&buf);
            buf.extend_from_slice(&table);
            pad_to(&mut buf, ptr);

            let shift = injected.len() as u32;
            let mut next = shift;
            let new_index: Vec<Option<u32>> = kept
                .iter()
                .map(|&k| {
                    k.then(|| {
                        next += 1;
                        next - 1
                    })
                })
                .collect();
            if let Some(dysymtab) = self.dysymtab() {
                let indirect_off = here(&buf);
                let shifted: Vec<u32> = dysymtab
                    .indirect_symbols
                    .iter()
                    .map(|&e| remap_indirect_index(e, &new_index))
                    .collect();
                for &entry in &shifted {
                    buf.put_u32(entry, ctx.endian);
                }
                pad_to(&mut buf, ptr);

                if let Some(Command::Dysymtab(d)) = toc
                    .loads
                    .iter_mut()
                    .map(|l| &mut l.body)
                    .find(|b| matches!(b, Command::Dysymtab(_)))
                {
                    d.indirectsymoff = indirect_off;
                    d.indirect_symbols = shifted;
                    // Partitions follow the kept symbols; injected locals lead.
                    let kept_before = |index: u32| {
                        let end = (index as usize).min(kept.len());
                        kept[..end].iter().filter(|k| **k).count() as u32
                    };
                    let local_end = kept_before(d.ilocalsym + d.nlocalsym);
                    d.nlocalsym = shift + local_end - kept_before(d.ilocalsym);
                    d.ilocalsym = 0;
                    let ext = (kept_before(d.iextdefsym), kept_before(d.iextdefsym + d.nextdefsym));
                    d.iextdefsym = shift + ext.0;
                    d.nextdefsym = ext.1 - ext.0;
                    let undef = (kept_before(d.iundefsym), kept_before(d.iundefsym + d.nundefsym));
                    d.iundefsym = shift + undef.0;
                    d.nundefsym = undef.1 - undef.0;
                }
            }

            pad_to(&mut pool, ptr);
            let stroff = here(&buf);
            buf.extend_from_slice(&pool);

            let nsyms = symbols.len() as u32;
            if let Some(Command::Symtab(s)) = toc
                .loads
                .iter_mut()
                .map(|l| &mut l.body)
                .find(|b| matches!(b, Command::Symtab(_)))
            {
                s.symoff = symoff;
                s.nsyms = nsyms;
                s.stroff = stroff;
                s.strsize = pool.len() as u32;
                s.symbols = symbols;
                s.strtab = pool.into();
            }
            report.nsyms = nsyms;
            report.injected_locals = shift;
            report.indirect_shift = shift;
        }

        let written = buf.len() as u64;
        if written > limit {
            return Err(MachOError::Capacity {
                reserved: limit,
                written,
            });
        }
        let filesz = align_up(written, options.settings.linkedit_file_alignment);
        buf.resize(filesz as usize, 0);

        if let Some(Command::Segment(seg)) = toc
            .loads
            .iter_mut()
            .map(|l| &mut l.body)
            .find(|b| matches!(b, Command::Segment(s) if s.name == "__LINKEDIT"))
        {
            seg.filesize = filesz;
            seg.vmsize = align_up(filesz, options.settings.linkedit_vm_alignment);
        }

        report.written = written;
        report.reserved = filesz;
        debug!(
            written,
            reserved = filesz,
            nsyms = report.nsyms,
            injected = report.injected_locals,
            "Rebuilt __LINKEDIT"
        );
        Ok((buf, report))
    }

    /// Build the standalone image in memory.
    pub fn export_bytes(&self, options: &ExportOptions<'_>) -> Result<(Vec<u8>, ExportReport)> {
        let cache_resident = self.is_cache_resident();
        let _span = crate::span_trace!("export", cache_resident).entered();
        let original: Vec<Segment> = self.segments().cloned().collect();
        let map = SegmentMap::build(&original, options.settings.segment_alignment);
        for entry in &map.entries {
            debug!(%entry, "Segment map");
        }

        let mut toc = self.toc.clone();
        let dependencies = rewrite_offsets(&mut toc, &map, cache_resident)
            .map_err(|e| crate::log_error!(e, "load command offsets do not map"))?;

        let mut linkedit_report = None;
        let mut linkedit_buf = None;
        if cache_resident {
            if let Some((new_off, limit)) = toc.segment("__LINKEDIT").map(|s| (s.fileoff, s.filesize)) {
                let (buf, report) =
                    self.rebuild_linkedit(&mut toc, new_off, limit, &dependencies, options)?;
                linkedit_buf = Some(buf);
                linkedit_report = Some(report);
            }
        }

        toc.header.flags.remove(HeaderFlags::DYLIB_IN_CACHE);
        toc.sync_header();

        let head = toc.to_bytes()?;
        let end_of_loads = head.len() as u64;
        if let Some(text) = toc.segment("__TEXT") {
            let limit = toc
                .sections_of(text)
                .iter()
                .filter(|s| s.offset != 0 && !s.is_zerofill())
                .map(|s| u64::from(s.offset))
                .min()
                .unwrap_or(text.fileoff + text.filesize);
            if end_of_loads > limit {
                return Err(MachOError::Capacity {
                    reserved: limit,
                    written: end_of_loads,
                });
            }
        }

        let mut out = head;
        let new_segments: Vec<Segment> = toc.segments().cloned().collect();
        for (old, new) in original.iter().zip(&new_segments) {
            if new.filesize == 0 {
                continue;
            }
            let data = if new.name == "__LINKEDIT" {
                match &linkedit_buf {
                    Some(buf) => bytes::Bytes::copy_from_slice(buf),
                    None => self.cache.read_exact_at(old.fileoff, old.filesize)?,
                }
            } else {
                self.read_at_addr(old.vmaddr, old.filesize)?
            };

            let start = new.fileoff as usize;
            let skip = if new.fileoff == 0 { end_of_loads as usize } else { 0 };
            if out.len() < start + skip {
                out.resize(start + skip, 0);
            }
            let body = data.get(skip.min(data.len())..).unwrap_or(&[]);
            out.truncate(start + skip);
            out.extend_from_slice(body);
            out.resize(start + new.filesize as usize, 0);
        }

        let mut fixups = Vec::new();
        if let Some(dcf) = options.chained_fixups {
            let base = self.preferred_load_address();
            for fixup in &dcf.fixups {
                match map.remap(fixup.offset) {
                    Ok(new_offset) => fixups.push(FixupLocation {
                        old_offset: fixup.offset,
                        new_offset,
                        pointer: fixup.pointer,
                        target: dcf
                            .is_rebase(fixup.raw, base)
                            .map(|t| t.wrapping_add(options.base_address)),
                    }),
                    Err(err) => warn!(error = %err, "Fixup outside every segment"),
                }
            }
        }

        let report = ExportReport {
            segment_map: map,
            dependencies,
            linkedit: linkedit_report,
            fixups,
            bytes_written: out.len() as u64,
        };
        Ok((out, report))
    }

    /// Write a standalone image to `sink`.
    pub fn export<W: Write>(&self, sink: &mut W, options: &ExportOptions<'_>) -> Result<ExportReport> {
        let (bytes, report) = self.export_bytes(options)?;
        sink.write_all(&bytes)?;
        sink.flush()?;
        Ok(report)
    }

    /// Write a standalone image to `path`, creating parent directories. The
    /// file is marked executable on Unix.
    pub fn export_to_path<P: AsRef<Path>>(&self, path: P, options: &ExportOptions<'_>) -> Result<ExportReport> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let (bytes, report) = self.export_bytes(options)?;
        std::fs::write(path, &bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }
        info!(
            path = %path.display(),
            size = report.bytes_written,
            cache_resident = self.is_cache_resident(),
            "Exported Mach-O image"
        );
        Ok(report)
    }
}
