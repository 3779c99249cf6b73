//! Segment, section and relocation records

use crate::error::{MachOError, Result};
use crate::formats::macho::commands::Ctx;
use crate::formats::macho::types::{lc, section_flags, VmProt};
use crate::formats::macho::utils::{
    put_fixed_name, put_word, read_fixed_name, read_word, EndianRead, EndianWrite,
};
use crate::io::ByteSource;
use once_cell::sync::OnceCell;
use std::fmt;

/// A mapped region of the image (`LC_SEGMENT` / `LC_SEGMENT_64`).
///
/// Sections are owned by the table of contents; the segment refers to its
/// run by `first_section..first_section + nsects`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: VmProt,
    pub initprot: VmProt,
    pub nsects: u32,
    pub flags: u32,
    pub first_section: usize,
}

impl Segment {
    pub fn command_kind(ctx: Ctx) -> u32 {
        if ctx.is_64() {
            lc::SEGMENT_64
        } else {
            lc::SEGMENT
        }
    }

    /// Parse a segment command and its trailing section headers.
    ///
    /// `raw` spans the whole command, including the tag and size words.
    pub fn parse(
        raw: &[u8],
        ctx: Ctx,
        cmd_offset: u64,
        first_section: usize,
    ) -> Result<(Segment, Vec<Section>)> {
        let e = ctx.endian;
        let is_64 = ctx.is_64();
        let fixed = ctx.word_size.segment_command_size();
        if raw.len() < fixed {
            return Err(MachOError::format_value(
                cmd_offset,
                "segment command too small",
                raw.len() as u64,
            ));
        }

        let w = if is_64 { 8 } else { 4 };
        let mut off = 24;
        let vmaddr = read_word(raw, off, is_64, e)?;
        off += w;
        let vmsize = read_word(raw, off, is_64, e)?;
        off += w;
        let fileoff = read_word(raw, off, is_64, e)?;
        off += w;
        let filesize = read_word(raw, off, is_64, e)?;
        off += w;

        let segment = Segment {
            name: read_fixed_name(raw, 8)?,
            vmaddr,
            vmsize,
            fileoff,
            filesize,
            maxprot: VmProt::from_bits_retain(raw.read_u32(off, e)?),
            initprot: VmProt::from_bits_retain(raw.read_u32(off + 4, e)?),
            nsects: raw.read_u32(off + 8, e)?,
            flags: raw.read_u32(off + 12, e)?,
            first_section,
        };

        let sect_size = ctx.word_size.section_size();
        let needed = (segment.nsects as usize)
            .checked_mul(sect_size)
            .and_then(|n| n.checked_add(fixed));
        if !matches!(needed, Some(n) if n <= raw.len()) {
            return Err(MachOError::format_value(
                cmd_offset,
                format!("segment {} section table overruns its command", segment.name),
                u64::from(segment.nsects),
            ));
        }

        let mut sections = Vec::with_capacity(segment.nsects as usize);
        for i in 0..segment.nsects as usize {
            sections.push(Section::parse(raw, fixed + i * sect_size, ctx)?);
        }
        Ok((segment, sections))
    }

    pub fn command_size(&self, ctx: Ctx) -> usize {
        ctx.word_size.segment_command_size() + self.nsects as usize * ctx.word_size.section_size()
    }

    /// Append the segment command followed by its sections.
    pub fn write(&self, buf: &mut Vec<u8>, ctx: Ctx, cmdsize: u32, sections: &[Section]) -> Result<()> {
        let e = ctx.endian;
        let is_64 = ctx.is_64();
        let owned = self.sections_in(sections).ok_or_else(|| {
            MachOError::format_value(
                self.first_section as u64,
                format!("segment {} sections missing from the section list", self.name),
                u64::from(self.nsects),
            )
        })?;

        buf.put_u32(Self::command_kind(ctx), e);
        buf.put_u32(cmdsize, e);
        put_fixed_name(buf, &self.name);
        put_word(buf, self.vmaddr, is_64, e);
        put_word(buf, self.vmsize, is_64, e);
        put_word(buf, self.fileoff, is_64, e);
        put_word(buf, self.filesize, is_64, e);
        buf.put_u32(self.maxprot.bits(), e);
        buf.put_u32(self.initprot.bits(), e);
        buf.put_u32(self.nsects, e);
        buf.put_u32(self.flags, e);
        for section in owned {
            section.write(buf, ctx);
        }
        Ok(())
    }

    /// The sections owned by this segment, if the global list holds them.
    pub fn sections_in<'a>(&self, sections: &'a [Section]) -> Option<&'a [Section]> {
        sections.get(self.first_section..self.first_section + self.nsects as usize)
    }

    pub fn contains_address(&self, addr: u64) -> bool {
        self.vmaddr <= addr && addr < self.vmaddr.saturating_add(self.vmsize)
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        self.fileoff <= offset && offset < self.fileoff.saturating_add(self.filesize)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} addr={:#x}-{:#x} off={:#x}-{:#x} {}/{} nsects={}",
            self.name,
            self.vmaddr,
            self.vmaddr.saturating_add(self.vmsize),
            self.fileoff,
            self.fileoff.saturating_add(self.filesize),
            self.initprot,
            self.maxprot,
            self.nsects
        )
    }
}

/// A named sub-range of a segment.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    /// Only present in 64-bit section headers.
    pub reserved3: u32,
    relocs: OnceCell<Vec<Relocation>>,
}

impl PartialEq for Section {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.segname == other.segname
            && self.addr == other.addr
            && self.size == other.size
            && self.offset == other.offset
            && self.align == other.align
            && self.reloff == other.reloff
            && self.nreloc == other.nreloc
            && self.flags == other.flags
            && self.reserved1 == other.reserved1
            && self.reserved2 == other.reserved2
            && self.reserved3 == other.reserved3
    }
}

impl Eq for Section {}

impl Section {
    pub fn new(segname: &str, name: &str, addr: u64, size: u64, offset: u32, flags: u32) -> Self {
        Self {
            name: name.to_string(),
            segname: segname.to_string(),
            addr,
            size,
            offset,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
            relocs: OnceCell::new(),
        }
    }

    fn parse(raw: &[u8], off: usize, ctx: Ctx) -> Result<Section> {
        let e = ctx.endian;
        let is_64 = ctx.is_64();
        let w = if is_64 { 8 } else { 4 };
        let addr = read_word(raw, off + 32, is_64, e)?;
        let size = read_word(raw, off + 32 + w, is_64, e)?;
        let base = off + 32 + 2 * w;
        Ok(Section {
            name: read_fixed_name(raw, off)?,
            segname: read_fixed_name(raw, off + 16)?,
            addr,
            size,
            offset: raw.read_u32(base, e)?,
            align: raw.read_u32(base + 4, e)?,
            reloff: raw.read_u32(base + 8, e)?,
            nreloc: raw.read_u32(base + 12, e)?,
            flags: raw.read_u32(base + 16, e)?,
            reserved1: raw.read_u32(base + 20, e)?,
            reserved2: raw.read_u32(base + 24, e)?,
            reserved3: if is_64 { raw.read_u32(base + 28, e)? } else { 0 },
            relocs: OnceCell::new(),
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>, ctx: Ctx) {
        let e = ctx.endian;
        let is_64 = ctx.is_64();
        put_fixed_name(buf, &self.name);
        put_fixed_name(buf, &self.segname);
        put_word(buf, self.addr, is_64, e);
        put_word(buf, self.size, is_64, e);
        buf.put_u32(self.offset, e);
        buf.put_u32(self.align, e);
        buf.put_u32(self.reloff, e);
        buf.put_u32(self.nreloc, e);
        buf.put_u32(self.flags, e);
        buf.put_u32(self.reserved1, e);
        buf.put_u32(self.reserved2, e);
        if is_64 {
            buf.put_u32(self.reserved3, e);
        }
    }

    pub fn section_type(&self) -> u32 {
        self.flags & section_flags::SECTION_TYPE
    }

    /// Zero-fill sections occupy no file bytes.
    pub fn is_zerofill(&self) -> bool {
        matches!(
            self.section_type(),
            section_flags::S_ZEROFILL
                | section_flags::S_GB_ZEROFILL
                | section_flags::S_THREAD_LOCAL_ZEROFILL
        )
    }

    pub fn contains_address(&self, addr: u64) -> bool {
        self.addr <= addr && addr < self.addr.saturating_add(self.size)
    }

    /// Relocation entries, decoded on first use.
    pub fn relocations(&self, source: &dyn ByteSource, ctx: Ctx) -> Result<&[Relocation]> {
        self.relocs
            .get_or_try_init(|| Relocation::read_table(source, ctx, self.reloff, self.nreloc))
            .map(Vec::as_slice)
    }

    /// Relocations decoded so far, without touching the source.
    pub fn cached_relocations(&self) -> Option<&[Relocation]> {
        self.relocs.get().map(Vec::as_slice)
    }
}

/// One relocation entry. Scattered entries carry an address-valued `value`;
/// normal entries carry a symbol or section number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub addr: u32,
    pub value: u32,
    pub kind: u8,
    /// log2 of the relocated width.
    pub len: u8,
    pub pcrel: bool,
    pub is_extern: bool,
    pub scattered: bool,
}

const R_SCATTERED: u32 = 0x8000_0000;

impl Relocation {
    /// Decode one 8-byte entry.
    pub fn decode(word0: u32, word1: u32, ctx: Ctx) -> Relocation {
        if word0 & R_SCATTERED != 0 {
            return Relocation {
                addr: word0 & 0x00ff_ffff,
                kind: ((word0 >> 24) & 0xf) as u8,
                len: ((word0 >> 28) & 0x3) as u8,
                pcrel: word0 & (1 << 30) != 0,
                value: word1,
                is_extern: false,
                scattered: true,
            };
        }
        if ctx.endian.is_little_endian() {
            Relocation {
                addr: word0,
                value: word1 & 0x00ff_ffff,
                pcrel: (word1 >> 24) & 1 != 0,
                len: ((word1 >> 25) & 0x3) as u8,
                is_extern: (word1 >> 27) & 1 != 0,
                kind: (word1 >> 28) as u8,
                scattered: false,
            }
        } else {
            Relocation {
                addr: word0,
                value: word1 >> 8,
                pcrel: (word1 >> 7) & 1 != 0,
                len: ((word1 >> 5) & 0x3) as u8,
                is_extern: (word1 >> 4) & 1 != 0,
                kind: (word1 & 0xf) as u8,
                scattered: false,
            }
        }
    }

    pub fn read_table(
        source: &dyn ByteSource,
        ctx: Ctx,
        reloff: u32,
        nreloc: u32,
    ) -> Result<Vec<Relocation>> {
        if nreloc == 0 {
            return Ok(Vec::new());
        }
        let data = source.read_exact_at(u64::from(reloff), u64::from(nreloc) * 8)?;
        (0..nreloc as usize)
            .map(|i| {
                let w0 = data.read_u32(i * 8, ctx.endian)?;
                let w1 = data.read_u32(i * 8 + 4, ctx.endian)?;
                Ok(Relocation::decode(w0, w1, ctx))
            })
            .collect()
    }
}
