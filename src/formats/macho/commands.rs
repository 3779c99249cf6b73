//! Load-command catalog
//!
//! Every load command is a [`LoadCommand`]: its raw tag, its declared size and
//! a typed [`Command`] payload. Commands re-encode to exactly their declared
//! size when unmodified; a command whose payload outgrew its declared size is
//! re-sized to the next 8-byte boundary (4 for a few legacy kinds). Tags
//! outside the catalog are kept as opaque bytes.

use crate::error::{MachOError, Result};
use crate::formats::macho::segments::{Section, Segment};
use crate::formats::macho::symbols::{Dysymtab, Symtab};
use crate::formats::macho::types::{lc, platform_name, Endian, SourceVersion, Version, WordSize};
use crate::formats::macho::utils::{
    align_up, put_fixed_name, read_fixed_name, EndianRead, EndianWrite,
};
use std::fmt;

/// Byte order and word size shared by every record of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ctx {
    pub endian: Endian,
    pub word_size: WordSize,
}

impl Ctx {
    pub fn new(endian: Endian, word_size: WordSize) -> Self {
        Self { endian, word_size }
    }

    pub fn is_64(&self) -> bool {
        self.word_size == WordSize::W64
    }

    /// Segment commands carry their own layout regardless of the header.
    pub fn for_command(self, cmd: u32) -> Ctx {
        match cmd {
            lc::SEGMENT => Ctx::new(self.endian, WordSize::W32),
            lc::SEGMENT_64 => Ctx::new(self.endian, WordSize::W64),
            _ => self,
        }
    }
}

/// A string stored inside its command at `offset` bytes from the command start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcStr {
    pub offset: u32,
    pub value: String,
}

impl LcStr {
    pub fn new(offset: u32, value: impl Into<String>) -> Self {
        Self {
            offset,
            value: value.into(),
        }
    }

    fn parse(raw: &[u8], field: usize, ctx: Ctx, cmd_offset: u64) -> Result<LcStr> {
        let offset = raw.read_u32(field, ctx.endian)?;
        if offset as usize >= raw.len() {
            return Err(MachOError::format_value(
                cmd_offset,
                "string offset outside its load command",
                u64::from(offset),
            ));
        }
        let tail = &raw[offset as usize..];
        let end = memchr::memchr(0, tail).unwrap_or(tail.len());
        Ok(LcStr {
            offset,
            value: String::from_utf8_lossy(&tail[..end]).into_owned(),
        })
    }

    /// Bytes needed to hold the string when the fixed part is `fixed` bytes.
    fn required(&self, fixed: usize) -> usize {
        (self.offset as usize).max(fixed) + self.value.len() + 1
    }

    fn put(&self, buf: &mut Vec<u8>) {
        if buf.len() < self.offset as usize {
            buf.resize(self.offset as usize, 0);
        }
        buf.extend_from_slice(self.value.as_bytes());
        buf.push(0);
    }
}

impl fmt::Display for LcStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dylib {
    pub name: LcStr,
    pub timestamp: u32,
    pub current_version: Version,
    pub compat_version: Version,
}

impl Dylib {
    pub fn new(name: &str, current: Version, compat: Version) -> Self {
        Self {
            name: LcStr::new(24, name),
            timestamp: 2,
            current_version: current,
            compat_version: compat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FvmLib {
    pub name: LcStr,
    pub minor_version: u32,
    pub header_addr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FvmFile {
    pub name: LcStr,
    pub header_addr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreboundDylib {
    pub name: LcStr,
    pub nmodules: u32,
    pub linked_modules_offset: u32,
    /// Bit vector of linked modules, one bit per module.
    pub linked_modules: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadState {
    pub flavor: u32,
    pub state: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routines {
    pub init_address: u64,
    pub init_module: u64,
    pub reserved: [u64; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkeditData {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub offset: u32,
    pub size: u32,
    pub cryptid: u32,
    /// Trailing pad word of `LC_ENCRYPTION_INFO_64`.
    pub pad: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DyldInfo {
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMin {
    pub version: Version,
    pub sdk: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub entry_offset: u64,
    pub stack_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildTool {
    pub tool: u32,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVersion {
    pub platform: u32,
    pub minos: Version,
    pub sdk: Version,
    pub tools: Vec<BuildTool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub data_owner: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesetEntry {
    pub addr: u64,
    pub file_offset: u64,
    pub entry_id: LcStr,
    pub reserved: u32,
}

/// Typed payload of a load command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Segment(Segment),
    Symtab(Symtab),
    Symseg(LinkeditData),
    Thread(Vec<ThreadState>),
    FvmLib(FvmLib),
    Ident(Vec<String>),
    FvmFile(FvmFile),
    Prepage,
    Dysymtab(Dysymtab),
    Dylib(Dylib),
    Dylinker(LcStr),
    PreboundDylib(PreboundDylib),
    Routines(Routines),
    SubFramework(LcStr),
    SubUmbrella(LcStr),
    SubClient(LcStr),
    SubLibrary(LcStr),
    TwolevelHints { offset: u32, nhints: u32 },
    PrebindCksum(u32),
    Uuid([u8; 16]),
    Rpath(LcStr),
    LinkeditData(LinkeditData),
    EncryptionInfo(EncryptionInfo),
    DyldInfo(DyldInfo),
    VersionMin(VersionMin),
    EntryPoint(EntryPoint),
    SourceVersion(SourceVersion),
    LinkerOption(Vec<String>),
    BuildVersion(BuildVersion),
    Note(Note),
    FilesetEntry(FilesetEntry),
    /// A tag outside the catalog; the bytes after the tag and size words.
    Unknown(Vec<u8>),
}

fn too_small(cmd: u32, cmd_offset: u64, len: usize) -> MachOError {
    MachOError::format_value(
        cmd_offset,
        format!("{} command too small", lc::name(cmd)),
        len as u64,
    )
}

fn parse_strings(raw: &[u8]) -> Vec<String> {
    raw.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

impl Command {
    /// Fixed size of the record for a tag, including the tag and size words.
    pub fn fixed_size(cmd: u32, ctx: Ctx) -> usize {
        match cmd {
            lc::SEGMENT | lc::SEGMENT_64 => ctx.word_size.segment_command_size(),
            lc::SYMTAB => Symtab::SIZE,
            lc::DYSYMTAB => Dysymtab::SIZE,
            lc::SYMSEG => 16,
            lc::THREAD | lc::UNIXTHREAD | lc::IDENT | lc::PREPAGE => 8,
            lc::LOADFVMLIB | lc::IDFVMLIB => 20,
            lc::FVMFILE => 16,
            lc::LOAD_DYLIB
            | lc::ID_DYLIB
            | lc::LOAD_WEAK_DYLIB
            | lc::REEXPORT_DYLIB
            | lc::LAZY_LOAD_DYLIB
            | lc::LOAD_UPWARD_DYLIB => 24,
            lc::LOAD_DYLINKER
            | lc::ID_DYLINKER
            | lc::DYLD_ENVIRONMENT
            | lc::RPATH
            | lc::SUB_FRAMEWORK
            | lc::SUB_UMBRELLA
            | lc::SUB_CLIENT
            | lc::SUB_LIBRARY => 12,
            lc::PREBOUND_DYLIB => 20,
            lc::ROUTINES => 40,
            lc::ROUTINES_64 => 72,
            lc::TWOLEVEL_HINTS => 16,
            lc::PREBIND_CKSUM => 12,
            lc::UUID => 24,
            lc::CODE_SIGNATURE
            | lc::SEGMENT_SPLIT_INFO
            | lc::FUNCTION_STARTS
            | lc::DATA_IN_CODE
            | lc::DYLIB_CODE_SIGN_DRS
            | lc::LINKER_OPTIMIZATION_HINT
            | lc::DYLD_EXPORTS_TRIE
            | lc::DYLD_CHAINED_FIXUPS
            | lc::ATOM_INFO => 16,
            lc::ENCRYPTION_INFO => 20,
            lc::ENCRYPTION_INFO_64 => 24,
            lc::DYLD_INFO | lc::DYLD_INFO_ONLY => 48,
            lc::VERSION_MIN_MACOSX
            | lc::VERSION_MIN_IPHONEOS
            | lc::VERSION_MIN_TVOS
            | lc::VERSION_MIN_WATCHOS => 16,
            lc::MAIN => 24,
            lc::SOURCE_VERSION => 16,
            lc::LINKER_OPTION => 12,
            lc::BUILD_VERSION => 24,
            lc::NOTE => 40,
            lc::FILESET_ENTRY => 32,
            _ => 8,
        }
    }

    /// Decode a command other than a segment. `raw` spans the whole record.
    ///
    /// Symbol tables are decoded here without their data; the parser pulls
    /// symbol and string bytes separately.
    pub fn parse(cmd: u32, raw: &[u8], ctx: Ctx, cmd_offset: u64) -> Result<Command> {
        let e = ctx.endian;
        let fixed = Command::fixed_size(cmd, ctx);
        if raw.len() < fixed {
            return Err(too_small(cmd, cmd_offset, raw.len()));
        }
        let u32_at = |off: usize| raw.read_u32(off, e);
        let u64_at = |off: usize| raw.read_u64(off, e);
        let lcstr = |field: usize| LcStr::parse(raw, field, ctx, cmd_offset);

        let body = match cmd {
            lc::SYMTAB => Command::Symtab(Symtab::parse_fields(raw, ctx)?),
            lc::DYSYMTAB => Command::Dysymtab(Dysymtab::parse_fields(raw, ctx)?),
            lc::SYMSEG => Command::Symseg(LinkeditData {
                offset: u32_at(8)?,
                size: u32_at(12)?,
            }),
            lc::THREAD | lc::UNIXTHREAD => {
                let mut states = Vec::new();
                let mut off = 8;
                while off + 8 <= raw.len() {
                    let flavor = u32_at(off)?;
                    let count = u32_at(off + 4)? as usize;
                    off += 8;
                    if count > (raw.len() - off) / 4 {
                        return Err(MachOError::format_value(
                            cmd_offset,
                            "thread state count overruns its command",
                            count as u64,
                        ));
                    }
                    let state = (0..count)
                        .map(|i| u32_at(off + i * 4))
                        .collect::<Result<Vec<_>>>()?;
                    off += count * 4;
                    states.push(ThreadState { flavor, state });
                }
                Command::Thread(states)
            }
            lc::LOADFVMLIB | lc::IDFVMLIB => Command::FvmLib(FvmLib {
                name: lcstr(8)?,
                minor_version: u32_at(12)?,
                header_addr: u32_at(16)?,
            }),
            lc::IDENT => Command::Ident(parse_strings(&raw[8..])),
            lc::FVMFILE => Command::FvmFile(FvmFile {
                name: lcstr(8)?,
                header_addr: u32_at(12)?,
            }),
            lc::PREPAGE => Command::Prepage,
            lc::LOAD_DYLIB
            | lc::ID_DYLIB
            | lc::LOAD_WEAK_DYLIB
            | lc::REEXPORT_DYLIB
            | lc::LAZY_LOAD_DYLIB
            | lc::LOAD_UPWARD_DYLIB => Command::Dylib(Dylib {
                name: lcstr(8)?,
                timestamp: u32_at(12)?,
                current_version: Version(u32_at(16)?),
                compat_version: Version(u32_at(20)?),
            }),
            lc::LOAD_DYLINKER | lc::ID_DYLINKER | lc::DYLD_ENVIRONMENT => {
                Command::Dylinker(lcstr(8)?)
            }
            lc::PREBOUND_DYLIB => {
                let name = lcstr(8)?;
                let nmodules = u32_at(12)?;
                let linked_modules_offset = u32_at(16)?;
                if linked_modules_offset as usize >= raw.len() {
                    return Err(MachOError::format_value(
                        cmd_offset,
                        "linked modules offset outside its load command",
                        u64::from(linked_modules_offset),
                    ));
                }
                let nbytes = (nmodules as usize).div_ceil(8);
                let start = linked_modules_offset as usize;
                let end = (start + nbytes).min(raw.len());
                Command::PreboundDylib(PreboundDylib {
                    name,
                    nmodules,
                    linked_modules_offset,
                    linked_modules: raw[start..end].to_vec(),
                })
            }
            lc::ROUTINES => {
                let mut reserved = [0u64; 6];
                for (i, r) in reserved.iter_mut().enumerate() {
                    *r = u64::from(u32_at(16 + i * 4)?);
                }
                Command::Routines(Routines {
                    init_address: u64::from(u32_at(8)?),
                    init_module: u64::from(u32_at(12)?),
                    reserved,
                })
            }
            lc::ROUTINES_64 => {
                let mut reserved = [0u64; 6];
                for (i, r) in reserved.iter_mut().enumerate() {
                    *r = u64_at(24 + i * 8)?;
                }
                Command::Routines(Routines {
                    init_address: u64_at(8)?,
                    init_module: u64_at(16)?,
                    reserved,
                })
            }
            lc::SUB_FRAMEWORK => Command::SubFramework(lcstr(8)?),
            lc::SUB_UMBRELLA => Command::SubUmbrella(lcstr(8)?),
            lc::SUB_CLIENT => Command::SubClient(lcstr(8)?),
            lc::SUB_LIBRARY => Command::SubLibrary(lcstr(8)?),
            lc::TWOLEVEL_HINTS => Command::TwolevelHints {
                offset: u32_at(8)?,
                nhints: u32_at(12)?,
            },
            lc::PREBIND_CKSUM => Command::PrebindCksum(u32_at(8)?),
            lc::UUID => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(raw.read_bytes(8, 16)?);
                Command::Uuid(uuid)
            }
            lc::RPATH => Command::Rpath(lcstr(8)?),
            lc::CODE_SIGNATURE
            | lc::SEGMENT_SPLIT_INFO
            | lc::FUNCTION_STARTS
            | lc::DATA_IN_CODE
            | lc::DYLIB_CODE_SIGN_DRS
            | lc::LINKER_OPTIMIZATION_HINT
            | lc::DYLD_EXPORTS_TRIE
            | lc::DYLD_CHAINED_FIXUPS
            | lc::ATOM_INFO => Command::LinkeditData(LinkeditData {
                offset: u32_at(8)?,
                size: u32_at(12)?,
            }),
            lc::ENCRYPTION_INFO | lc::ENCRYPTION_INFO_64 => {
                Command::EncryptionInfo(EncryptionInfo {
                    offset: u32_at(8)?,
                    size: u32_at(12)?,
                    cryptid: u32_at(16)?,
                    pad: if cmd == lc::ENCRYPTION_INFO_64 {
                        Some(u32_at(20)?)
                    } else {
                        None
                    },
                })
            }
            lc::DYLD_INFO | lc::DYLD_INFO_ONLY => Command::DyldInfo(DyldInfo {
                rebase_off: u32_at(8)?,
                rebase_size: u32_at(12)?,
                bind_off: u32_at(16)?,
                bind_size: u32_at(20)?,
                weak_bind_off: u32_at(24)?,
                weak_bind_size: u32_at(28)?,
                lazy_bind_off: u32_at(32)?,
                lazy_bind_size: u32_at(36)?,
                export_off: u32_at(40)?,
                export_size: u32_at(44)?,
            }),
            lc::VERSION_MIN_MACOSX
            | lc::VERSION_MIN_IPHONEOS
            | lc::VERSION_MIN_TVOS
            | lc::VERSION_MIN_WATCHOS => Command::VersionMin(VersionMin {
                version: Version(u32_at(8)?),
                sdk: Version(u32_at(12)?),
            }),
            lc::MAIN => Command::EntryPoint(EntryPoint {
                entry_offset: u64_at(8)?,
                stack_size: u64_at(16)?,
            }),
            lc::SOURCE_VERSION => Command::SourceVersion(SourceVersion(u64_at(8)?)),
            lc::LINKER_OPTION => {
                let count = u32_at(8)? as usize;
                let mut options = parse_strings(&raw[12..]);
                if options.len() < count {
                    return Err(MachOError::format_value(
                        cmd_offset,
                        "linker option count exceeds the strings present",
                        count as u64,
                    ));
                }
                options.truncate(count);
                Command::LinkerOption(options)
            }
            lc::BUILD_VERSION => {
                let ntools = u32_at(20)? as usize;
                if ntools > (raw.len() - 24) / 8 {
                    return Err(MachOError::format_value(
                        cmd_offset,
                        "build tool count overruns its command",
                        ntools as u64,
                    ));
                }
                let tools = (0..ntools)
                    .map(|i| {
                        Ok(BuildTool {
                            tool: u32_at(24 + i * 8)?,
                            version: Version(u32_at(28 + i * 8)?),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Command::BuildVersion(BuildVersion {
                    platform: u32_at(8)?,
                    minos: Version(u32_at(12)?),
                    sdk: Version(u32_at(16)?),
                    tools,
                })
            }
            lc::NOTE => Command::Note(Note {
                data_owner: read_fixed_name(raw, 8)?,
                offset: u64_at(24)?,
                size: u64_at(32)?,
            }),
            lc::FILESET_ENTRY => Command::FilesetEntry(FilesetEntry {
                addr: u64_at(8)?,
                file_offset: u64_at(16)?,
                entry_id: lcstr(24)?,
                reserved: u32_at(28)?,
            }),
            _ => Command::Unknown(raw[8..].to_vec()),
        };
        Ok(body)
    }

    /// Bytes the payload needs, including the tag and size words.
    pub fn required_size(&self, cmd: u32, ctx: Ctx) -> usize {
        let fixed = Command::fixed_size(cmd, ctx);
        match self {
            Command::Segment(seg) => seg.command_size(ctx.for_command(cmd)),
            Command::Thread(states) => {
                8 + states.iter().map(|s| 8 + s.state.len() * 4).sum::<usize>()
            }
            Command::Ident(strings) => 8 + strings.iter().map(|s| s.len() + 1).sum::<usize>(),
            Command::FvmLib(f) => f.name.required(fixed),
            Command::FvmFile(f) => f.name.required(fixed),
            Command::Dylib(d) => d.name.required(fixed),
            Command::Dylinker(s)
            | Command::Rpath(s)
            | Command::SubFramework(s)
            | Command::SubUmbrella(s)
            | Command::SubClient(s)
            | Command::SubLibrary(s) => s.required(fixed),
            Command::PreboundDylib(p) => {
                let name_end = p.name.required(fixed);
                let modules_end = p.linked_modules_offset as usize + p.linked_modules.len();
                if p.linked_modules.is_empty() {
                    name_end
                } else {
                    name_end.max(modules_end)
                }
            }
            Command::LinkerOption(opts) => fixed + opts.iter().map(|s| s.len() + 1).sum::<usize>(),
            Command::BuildVersion(bv) => fixed + bv.tools.len() * 8,
            Command::FilesetEntry(f) => f.entry_id.required(fixed),
            Command::Unknown(raw) => 8 + raw.len(),
            _ => fixed,
        }
    }

    /// Alignment used when a command must be re-sized.
    pub fn alignment(cmd: u32) -> u64 {
        match cmd {
            lc::IDENT | lc::LOADFVMLIB | lc::IDFVMLIB | lc::FVMFILE | lc::SYMSEG => 4,
            _ => 8,
        }
    }

    /// Append the fields after the tag and size words. `buf` starts at the
    /// command start so that string offsets are relative to it.
    fn write_fields(&self, buf: &mut Vec<u8>, ctx: Ctx) {
        let e = ctx.endian;
        match self {
            Command::Segment(_) => {}
            Command::Symtab(s) => s.write_fields(buf, ctx),
            Command::Dysymtab(d) => d.write_fields(buf, ctx),
            Command::Symseg(l) | Command::LinkeditData(l) => {
                buf.put_u32(l.offset, e);
                buf.put_u32(l.size, e);
            }
            Command::Thread(states) => {
                for s in states {
                    buf.put_u32(s.flavor, e);
                    buf.put_u32(s.state.len() as u32, e);
                    for w in &s.state {
                        buf.put_u32(*w, e);
                    }
                }
            }
            Command::FvmLib(f) => {
                buf.put_u32(f.name.offset, e);
                buf.put_u32(f.minor_version, e);
                buf.put_u32(f.header_addr, e);
                f.name.put(buf);
            }
            Command::Ident(strings) => {
                for s in strings {
                    buf.extend_from_slice(s.as_bytes());
                    buf.push(0);
                }
            }
            Command::FvmFile(f) => {
                buf.put_u32(f.name.offset, e);
                buf.put_u32(f.header_addr, e);
                f.name.put(buf);
            }
            Command::Prepage => {}
            Command::Dylib(d) => {
                buf.put_u32(d.name.offset, e);
                buf.put_u32(d.timestamp, e);
                buf.put_u32(d.current_version.0, e);
                buf.put_u32(d.compat_version.0, e);
                d.name.put(buf);
            }
            Command::Dylinker(s)
            | Command::Rpath(s)
            | Command::SubFramework(s)
            | Command::SubUmbrella(s)
            | Command::SubClient(s)
            | Command::SubLibrary(s) => {
                buf.put_u32(s.offset, e);
                s.put(buf);
            }
            Command::PreboundDylib(p) => {
                buf.put_u32(p.name.offset, e);
                buf.put_u32(p.nmodules, e);
                buf.put_u32(p.linked_modules_offset, e);
                p.name.put(buf);
                if !p.linked_modules.is_empty() {
                    let start = p.linked_modules_offset as usize;
                    let end = start + p.linked_modules.len();
                    if buf.len() < end {
                        buf.resize(end, 0);
                    }
                    buf[start..end].copy_from_slice(&p.linked_modules);
                }
            }
            Command::Routines(r) => {
                if ctx.is_64() {
                    buf.put_u64(r.init_address, e);
                    buf.put_u64(r.init_module, e);
                    for v in r.reserved {
                        buf.put_u64(v, e);
                    }
                } else {
                    buf.put_u32(r.init_address as u32, e);
                    buf.put_u32(r.init_module as u32, e);
                    for v in r.reserved {
                        buf.put_u32(v as u32, e);
                    }
                }
            }
            Command::TwolevelHints { offset, nhints } => {
                buf.put_u32(*offset, e);
                buf.put_u32(*nhints, e);
            }
            Command::PrebindCksum(c) => buf.put_u32(*c, e),
            Command::Uuid(u) => buf.extend_from_slice(u),
            Command::EncryptionInfo(info) => {
                buf.put_u32(info.offset, e);
                buf.put_u32(info.size, e);
                buf.put_u32(info.cryptid, e);
                if let Some(pad) = info.pad {
                    buf.put_u32(pad, e);
                }
            }
            Command::DyldInfo(d) => {
                for v in [
                    d.rebase_off,
                    d.rebase_size,
                    d.bind_off,
                    d.bind_size,
                    d.weak_bind_off,
                    d.weak_bind_size,
                    d.lazy_bind_off,
                    d.lazy_bind_size,
                    d.export_off,
                    d.export_size,
                ] {
                    buf.put_u32(v, e);
                }
            }
            Command::VersionMin(v) => {
                buf.put_u32(v.version.0, e);
                buf.put_u32(v.sdk.0, e);
            }
            Command::EntryPoint(ep) => {
                buf.put_u64(ep.entry_offset, e);
                buf.put_u64(ep.stack_size, e);
            }
            Command::SourceVersion(v) => buf.put_u64(v.0, e),
            Command::LinkerOption(opts) => {
                buf.put_u32(opts.len() as u32, e);
                for s in opts {
                    buf.extend_from_slice(s.as_bytes());
                    buf.push(0);
                }
            }
            Command::BuildVersion(bv) => {
                buf.put_u32(bv.platform, e);
                buf.put_u32(bv.minos.0, e);
                buf.put_u32(bv.sdk.0, e);
                buf.put_u32(bv.tools.len() as u32, e);
                for t in &bv.tools {
                    buf.put_u32(t.tool, e);
                    buf.put_u32(t.version.0, e);
                }
            }
            Command::Note(n) => {
                put_fixed_name(buf, &n.data_owner);
                buf.put_u64(n.offset, e);
                buf.put_u64(n.size, e);
            }
            Command::FilesetEntry(f) => {
                buf.put_u64(f.addr, e);
                buf.put_u64(f.file_offset, e);
                buf.put_u32(f.entry_id.offset, e);
                buf.put_u32(f.reserved, e);
                f.entry_id.put(buf);
            }
            Command::Unknown(raw) => buf.extend_from_slice(raw),
        }
    }
}

/// One load command: raw tag, declared size and typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub body: Command,
}

impl LoadCommand {
    /// Build a new command sized to fit its payload.
    pub fn new(cmd: u32, body: Command, ctx: Ctx) -> Self {
        let required = body.required_size(cmd, ctx) as u64;
        let cmdsize = align_up(required, Command::alignment(cmd)) as u32;
        Self { cmd, cmdsize, body }
    }

    /// On-disk size: the declared size, unless the payload no longer fits.
    pub fn size(&self, ctx: Ctx) -> u32 {
        let required = self.body.required_size(self.cmd, ctx) as u64;
        if u64::from(self.cmdsize) >= required {
            self.cmdsize
        } else {
            align_up(required, Command::alignment(self.cmd)) as u32
        }
    }

    /// Append the encoded command. Segments emit their sections from the
    /// global `sections` list.
    pub fn write(&self, out: &mut Vec<u8>, ctx: Ctx, sections: &[Section]) -> Result<()> {
        let size = self.size(ctx);
        if let Command::Segment(seg) = &self.body {
            let start = out.len();
            seg.write(out, ctx.for_command(self.cmd), size, sections)?;
            out.resize(start + size as usize, 0);
            return Ok(());
        }
        let mut buf = Vec::with_capacity(size as usize);
        buf.put_u32(self.cmd, ctx.endian);
        buf.put_u32(size, ctx.endian);
        self.body.write_fields(&mut buf, ctx);
        buf.resize(size as usize, 0);
        out.extend_from_slice(&buf);
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        lc::name(self.cmd)
    }

    pub fn as_segment(&self) -> Option<&Segment> {
        match &self.body {
            Command::Segment(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dylib(&self) -> Option<&Dylib> {
        match &self.body {
            Command::Dylib(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_linkedit_data(&self) -> Option<&LinkeditData> {
        match &self.body {
            Command::LinkeditData(l) => Some(l),
            _ => None,
        }
    }
}

impl fmt::Display for LoadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<28} size={:<5} ", self.name(), self.cmdsize)?;
        match &self.body {
            Command::Segment(s) => write!(f, "{s}"),
            Command::Symtab(s) => write!(
                f,
                "symoff={:#x} nsyms={} stroff={:#x} strsize={:#x}",
                s.symoff, s.nsyms, s.stroff, s.strsize
            ),
            Command::Dysymtab(d) => write!(
                f,
                "locals={} exported={} undefined={} indirect={}",
                d.nlocalsym, d.nextdefsym, d.nundefsym, d.nindirectsyms
            ),
            Command::Dylib(d) => write!(
                f,
                "{} ({}/{})",
                d.name, d.current_version, d.compat_version
            ),
            Command::Dylinker(s)
            | Command::Rpath(s)
            | Command::SubFramework(s)
            | Command::SubUmbrella(s)
            | Command::SubClient(s)
            | Command::SubLibrary(s) => write!(f, "{s}"),
            Command::FvmLib(l) => write!(f, "{} minor={}", l.name, l.minor_version),
            Command::FvmFile(l) => write!(f, "{} header={:#x}", l.name, l.header_addr),
            Command::PreboundDylib(p) => write!(f, "{} nmodules={}", p.name, p.nmodules),
            Command::Uuid(u) => {
                let text = uuid::Uuid::from_bytes(*u).hyphenated().to_string();
                f.write_str(&text.to_uppercase())
            }
            Command::LinkeditData(l) | Command::Symseg(l) => {
                let end = u64::from(l.offset) + u64::from(l.size);
                write!(f, "offset={:#x}-{:#x}", l.offset, end)
            }
            Command::EncryptionInfo(i) => write!(
                f,
                "offset={:#x} size={:#x} cryptid={}",
                i.offset, i.size, i.cryptid
            ),
            Command::DyldInfo(d) => write!(
                f,
                "rebase={:#x} bind={:#x} weak={:#x} lazy={:#x} export={:#x}",
                d.rebase_off, d.bind_off, d.weak_bind_off, d.lazy_bind_off, d.export_off
            ),
            Command::VersionMin(v) => write!(f, "version={} sdk={}", v.version, v.sdk),
            Command::EntryPoint(ep) => write!(
                f,
                "entryoff={:#x} stacksize={:#x}",
                ep.entry_offset, ep.stack_size
            ),
            Command::SourceVersion(v) => write!(f, "{v}"),
            Command::BuildVersion(bv) => write!(
                f,
                "platform={} minos={} sdk={} ntools={}",
                platform_name(bv.platform),
                bv.minos,
                bv.sdk,
                bv.tools.len()
            ),
            Command::Note(n) => write!(
                f,
                "owner={} offset={:#x} size={:#x}",
                n.data_owner, n.offset, n.size
            ),
            Command::FilesetEntry(fe) => write!(
                f,
                "{} addr={:#x} fileoff={:#x}",
                fe.entry_id, fe.addr, fe.file_offset
            ),
            Command::LinkerOption(opts) => write!(f, "{}", opts.join(" ")),
            Command::Ident(strings) => write!(f, "{}", strings.join(" ")),
            Command::Thread(states) => write!(f, "flavors={}", states.len()),
            Command::Routines(r) => write!(f, "init={:#x} module={}", r.init_address, r.init_module),
            Command::TwolevelHints { offset, nhints } => {
                write!(f, "offset={offset:#x} nhints={nhints}")
            }
            Command::PrebindCksum(c) => write!(f, "cksum={c:#x}"),
            Command::Prepage => Ok(()),
            Command::Unknown(raw) => write!(f, "{} opaque bytes", raw.len()),
        }
    }
}
