//! Symbol table (`LC_SYMTAB`) and dynamic symbol table (`LC_DYSYMTAB`)

use crate::error::{MachOError, Result};
use crate::formats::macho::commands::Ctx;
use crate::formats::macho::types::{nlist, INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL};
use crate::formats::macho::utils::{put_word, read_word, EndianRead, EndianWrite};
use crate::io::ByteSource;
use bytes::Bytes;
use std::fmt;
use tracing::debug;

/// One `nlist` entry with its resolved name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Offset of the name in the string table (`n_strx`).
    pub name_offset: u32,
    pub n_type: u8,
    pub sect: u8,
    pub desc: u16,
    pub value: u64,
}

impl Symbol {
    pub fn new(name: impl Into<String>, n_type: u8, sect: u8, desc: u16, value: u64) -> Self {
        Self {
            name: name.into(),
            name_offset: 0,
            n_type,
            sect,
            desc,
            value,
        }
    }

    pub fn is_stab(&self) -> bool {
        self.n_type & nlist::N_STAB != 0
    }

    pub fn is_external(&self) -> bool {
        self.n_type & nlist::N_EXT != 0
    }

    pub fn type_bits(&self) -> u8 {
        self.n_type & nlist::N_TYPE
    }

    pub fn is_undefined(&self) -> bool {
        !self.is_stab() && self.type_bits() == nlist::N_UNDF
    }

    /// Library ordinal of an undefined symbol under two-level namespace.
    pub fn library_ordinal(&self) -> u8 {
        (self.desc >> 8) as u8
    }

    /// Append the on-disk `nlist` encoding with the given string offset.
    pub fn write_nlist(&self, buf: &mut Vec<u8>, ctx: Ctx, strx: u32) {
        let e = ctx.endian;
        buf.put_u32(strx, e);
        buf.put_u8(self.n_type);
        buf.put_u8(self.sect);
        buf.put_u16(self.desc, e);
        put_word(buf, self.value, ctx.is_64(), e);
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#018x} type={:#04x} sect={} desc={:#06x} {}",
            self.value, self.n_type, self.sect, self.desc, self.name
        )
    }
}

/// `LC_SYMTAB` fields plus the decoded symbols and owned string table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Symtab {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
    pub symbols: Vec<Symbol>,
    pub strtab: Bytes,
}

impl Symtab {
    pub const SIZE: usize = 24;

    /// Decode the command fields and pull symbol and string bytes from `source`.
    pub fn parse(raw: &[u8], ctx: Ctx, cmd_offset: u64, source: &dyn ByteSource) -> Result<Symtab> {
        let e = ctx.endian;
        let mut symtab = Symtab::parse_fields(raw, ctx)?;

        symtab.strtab = source.read_exact_at(u64::from(symtab.stroff), u64::from(symtab.strsize))?;
        let entry = ctx.word_size.nlist_size();
        let table = source.read_exact_at(
            u64::from(symtab.symoff),
            u64::from(symtab.nsyms) * entry as u64,
        )?;

        let mut symbols = Vec::with_capacity(symtab.nsyms as usize);
        for i in 0..symtab.nsyms as usize {
            let off = i * entry;
            let strx = table.read_u32(off, e)?;
            if strx as usize >= symtab.strtab.len() {
                return Err(MachOError::format_value(
                    u64::from(symtab.symoff) + off as u64,
                    "symbol name offset outside string table",
                    u64::from(strx),
                ));
            }
            let raw_name = &symtab.strtab[strx as usize..];
            let end = memchr::memchr(0, raw_name).unwrap_or(raw_name.len());
            symbols.push(Symbol {
                name: String::from_utf8_lossy(&raw_name[..end]).into_owned(),
                name_offset: strx,
                n_type: table.read_u8(off + 4)?,
                sect: table.read_u8(off + 5)?,
                desc: table.read_u16(off + 6, e)?,
                value: read_word(&table, off + 8, ctx.is_64(), e)?,
            });
        }
        symtab.symbols = symbols;

        debug!(
            cmd_offset,
            nsyms = symtab.nsyms,
            strsize = symtab.strsize,
            "Parsed symbol table"
        );
        Ok(symtab)
    }

    /// Decode only the command fields.
    pub fn parse_fields(raw: &[u8], ctx: Ctx) -> Result<Symtab> {
        let e = ctx.endian;
        Ok(Symtab {
            symoff: raw.read_u32(8, e)?,
            nsyms: raw.read_u32(12, e)?,
            stroff: raw.read_u32(16, e)?,
            strsize: raw.read_u32(20, e)?,
            symbols: Vec::new(),
            strtab: Bytes::new(),
        })
    }

    pub fn write_fields(&self, buf: &mut Vec<u8>, ctx: Ctx) {
        let e = ctx.endian;
        buf.put_u32(self.symoff, e);
        buf.put_u32(self.nsyms, e);
        buf.put_u32(self.stroff, e);
        buf.put_u32(self.strsize, e);
    }

    pub fn by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

/// `LC_DYSYMTAB` partitions plus the indirect symbol table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dysymtab {
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
    pub indirect_symbols: Vec<u32>,
}

impl Dysymtab {
    pub const SIZE: usize = 80;

    /// Decode the command and read the indirect table from `source`.
    ///
    /// `nsyms` is the symbol count of an already parsed symbol table, used to
    /// validate the undefined-symbol partition.
    pub fn parse(
        raw: &[u8],
        ctx: Ctx,
        cmd_offset: u64,
        nsyms: Option<usize>,
        source: &dyn ByteSource,
    ) -> Result<Dysymtab> {
        let mut dysymtab = Dysymtab::parse_fields(raw, ctx)?;

        if let Some(count) = nsyms {
            let end = u64::from(dysymtab.iundefsym) + u64::from(dysymtab.nundefsym);
            if end > count as u64 {
                return Err(MachOError::format_value(
                    cmd_offset,
                    format!("undefined symbols end past the {count} symbol entries"),
                    end,
                ));
            }
        }

        if dysymtab.nindirectsyms > 0 {
            let data = source.read_exact_at(
                u64::from(dysymtab.indirectsymoff),
                u64::from(dysymtab.nindirectsyms) * 4,
            )?;
            dysymtab.indirect_symbols = (0..dysymtab.nindirectsyms as usize)
                .map(|i| data.read_u32(i * 4, ctx.endian))
                .collect::<Result<_>>()?;
        }
        Ok(dysymtab)
    }

    pub fn parse_fields(raw: &[u8], ctx: Ctx) -> Result<Dysymtab> {
        let e = ctx.endian;
        let f = |i: usize| raw.read_u32(8 + i * 4, e);
        Ok(Dysymtab {
            ilocalsym: f(0)?,
            nlocalsym: f(1)?,
            iextdefsym: f(2)?,
            nextdefsym: f(3)?,
            iundefsym: f(4)?,
            nundefsym: f(5)?,
            tocoff: f(6)?,
            ntoc: f(7)?,
            modtaboff: f(8)?,
            nmodtab: f(9)?,
            extrefsymoff: f(10)?,
            nextrefsyms: f(11)?,
            indirectsymoff: f(12)?,
            nindirectsyms: f(13)?,
            extreloff: f(14)?,
            nextrel: f(15)?,
            locreloff: f(16)?,
            nlocrel: f(17)?,
            indirect_symbols: Vec::new(),
        })
    }

    pub fn write_fields(&self, buf: &mut Vec<u8>, ctx: Ctx) {
        let e = ctx.endian;
        for v in [
            self.ilocalsym,
            self.nlocalsym,
            self.iextdefsym,
            self.nextdefsym,
            self.iundefsym,
            self.nundefsym,
            self.tocoff,
            self.ntoc,
            self.modtaboff,
            self.nmodtab,
            self.extrefsymoff,
            self.nextrefsyms,
            self.indirectsymoff,
            self.nindirectsyms,
            self.extreloff,
            self.nextrel,
            self.locreloff,
            self.nlocrel,
        ] {
            buf.put_u32(v, e);
        }
    }
}

/// Rewrite an indirect-table entry through `new_index`, which maps each old
/// symbol index to its position in a rebuilt table. The local and absolute
/// markers pass through; entries naming a dropped or missing symbol become
/// [`INDIRECT_SYMBOL_LOCAL`].
pub fn remap_indirect_index(entry: u32, new_index: &[Option<u32>]) -> u32 {
    if entry & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
        return entry;
    }
    new_index
        .get(entry as usize)
        .copied()
        .flatten()
        .unwrap_or(INDIRECT_SYMBOL_LOCAL)
}
