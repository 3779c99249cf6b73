//! Core Mach-O types and constants

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_CIGAM: u32 = 0xcefa_edfe;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;

pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_MAGIC_64: u32 = 0xcafe_babf;

/// Byte order of a Mach-O image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn is_little_endian(&self) -> bool {
        matches!(self, Endian::Little)
    }
}

/// Word width of a Mach-O image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WordSize {
    W32,
    W64,
}

impl WordSize {
    pub fn bits(&self) -> u8 {
        match self {
            WordSize::W32 => 32,
            WordSize::W64 => 64,
        }
    }

    pub fn pointer_size(&self) -> u64 {
        match self {
            WordSize::W32 => 4,
            WordSize::W64 => 8,
        }
    }

    pub fn header_size(&self) -> usize {
        match self {
            WordSize::W32 => 28,
            WordSize::W64 => 32,
        }
    }

    pub fn segment_command_size(&self) -> usize {
        match self {
            WordSize::W32 => 56,
            WordSize::W64 => 72,
        }
    }

    pub fn section_size(&self) -> usize {
        match self {
            WordSize::W32 => 68,
            WordSize::W64 => 80,
        }
    }

    pub fn nlist_size(&self) -> usize {
        match self {
            WordSize::W32 => 12,
            WordSize::W64 => 16,
        }
    }
}

/// Mach-O file type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Object,
    Execute,
    FvmLib,
    Core,
    Preload,
    Dylib,
    Dylinker,
    Bundle,
    DylibStub,
    Dsym,
    KextBundle,
    Fileset,
    GpuExecute,
    GpuDylib,
    Unknown(u32),
}

impl From<u32> for FileType {
    fn from(val: u32) -> Self {
        match val {
            0x1 => FileType::Object,
            0x2 => FileType::Execute,
            0x3 => FileType::FvmLib,
            0x4 => FileType::Core,
            0x5 => FileType::Preload,
            0x6 => FileType::Dylib,
            0x7 => FileType::Dylinker,
            0x8 => FileType::Bundle,
            0x9 => FileType::DylibStub,
            0xa => FileType::Dsym,
            0xb => FileType::KextBundle,
            0xc => FileType::Fileset,
            0xd => FileType::GpuExecute,
            0xe => FileType::GpuDylib,
            other => FileType::Unknown(other),
        }
    }
}

impl From<FileType> for u32 {
    fn from(val: FileType) -> Self {
        match val {
            FileType::Object => 0x1,
            FileType::Execute => 0x2,
            FileType::FvmLib => 0x3,
            FileType::Core => 0x4,
            FileType::Preload => 0x5,
            FileType::Dylib => 0x6,
            FileType::Dylinker => 0x7,
            FileType::Bundle => 0x8,
            FileType::DylibStub => 0x9,
            FileType::Dsym => 0xa,
            FileType::KextBundle => 0xb,
            FileType::Fileset => 0xc,
            FileType::GpuExecute => 0xd,
            FileType::GpuDylib => 0xe,
            FileType::Unknown(v) => v,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Object => "MH_OBJECT",
            FileType::Execute => "MH_EXECUTE",
            FileType::FvmLib => "MH_FVMLIB",
            FileType::Core => "MH_CORE",
            FileType::Preload => "MH_PRELOAD",
            FileType::Dylib => "MH_DYLIB",
            FileType::Dylinker => "MH_DYLINKER",
            FileType::Bundle => "MH_BUNDLE",
            FileType::DylibStub => "MH_DYLIB_STUB",
            FileType::Dsym => "MH_DSYM",
            FileType::KextBundle => "MH_KEXT_BUNDLE",
            FileType::Fileset => "MH_FILESET",
            FileType::GpuExecute => "MH_GPU_EXECUTE",
            FileType::GpuDylib => "MH_GPU_DYLIB",
            FileType::Unknown(v) => return write!(f, "{v:#x}"),
        };
        f.write_str(name)
    }
}

pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
pub const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;
pub const CPU_TYPE_X86: u32 = 7;
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM64_32: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;
pub const CPU_TYPE_PPC: u32 = 18;
pub const CPU_TYPE_PPC64: u32 = CPU_TYPE_PPC | CPU_ARCH_ABI64;
pub const CPU_SUBTYPE_MASK: u32 = 0x00ff_ffff;
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

/// Human-readable CPU name.
pub fn cpu_name(cputype: u32, cpusubtype: u32) -> &'static str {
    match cputype {
        CPU_TYPE_X86 => "i386",
        CPU_TYPE_X86_64 => "x86_64",
        CPU_TYPE_ARM => "arm",
        CPU_TYPE_ARM64 if cpusubtype & CPU_SUBTYPE_MASK == CPU_SUBTYPE_ARM64E => "arm64e",
        CPU_TYPE_ARM64 => "arm64",
        CPU_TYPE_ARM64_32 => "arm64_32",
        CPU_TYPE_PPC => "ppc",
        CPU_TYPE_PPC64 => "ppc64",
        _ => "unknown",
    }
}

bitflags! {
    /// Mach-O header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u32 {
        const NOUNDEFS = 0x1;
        const INCRLINK = 0x2;
        const DYLDLINK = 0x4;
        const BINDATLOAD = 0x8;
        const PREBOUND = 0x10;
        const SPLIT_SEGS = 0x20;
        const LAZY_INIT = 0x40;
        const TWOLEVEL = 0x80;
        const FORCE_FLAT = 0x100;
        const NOMULTIDEFS = 0x200;
        const NOFIXPREBINDING = 0x400;
        const PREBINDABLE = 0x800;
        const ALLMODSBOUND = 0x1000;
        const SUBSECTIONS_VIA_SYMBOLS = 0x2000;
        const CANONICAL = 0x4000;
        const WEAK_DEFINES = 0x8000;
        const BINDS_TO_WEAK = 0x1_0000;
        const ALLOW_STACK_EXECUTION = 0x2_0000;
        const ROOT_SAFE = 0x4_0000;
        const SETUID_SAFE = 0x8_0000;
        const NO_REEXPORTED_DYLIBS = 0x10_0000;
        const PIE = 0x20_0000;
        const DEAD_STRIPPABLE_DYLIB = 0x40_0000;
        const HAS_TLV_DESCRIPTORS = 0x80_0000;
        const NO_HEAP_EXECUTION = 0x100_0000;
        const APP_EXTENSION_SAFE = 0x200_0000;
        const NLIST_OUTOFSYNC_WITH_DYLDINFO = 0x400_0000;
        const SIM_SUPPORT = 0x800_0000;
        const IMPLICIT_PAGEZERO = 0x1000_0000;
        /// The image lives inside a dyld shared cache.
        const DYLIB_IN_CACHE = 0x8000_0000;
    }
}

bitflags! {
    /// Virtual-memory protections of a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

impl fmt::Display for VmProt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(VmProt::READ) { 'r' } else { '-' };
        let w = if self.contains(VmProt::WRITE) { 'w' } else { '-' };
        let x = if self.contains(VmProt::EXECUTE) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// The fixed Mach-O file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub endian: Endian,
    pub word_size: WordSize,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: FileType,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: HeaderFlags,
    /// Present only in 64-bit headers.
    pub reserved: u32,
}

impl FileHeader {
    pub fn size(&self) -> usize {
        self.word_size.header_size()
    }

    pub fn is_64(&self) -> bool {
        self.word_size == WordSize::W64
    }

    pub fn pointer_size(&self) -> u64 {
        self.word_size.pointer_size()
    }

    pub fn cpu_name(&self) -> &'static str {
        cpu_name(self.cputype, self.cpusubtype)
    }
}

/// A packed `xxxx.yy.zz` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(pub u32);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        let (major, minor, patch) = (v >> 16, (v >> 8) & 0xff, v & 0xff);
        if patch == 0 {
            write!(f, "{major}.{minor}")
        } else {
            write!(f, "{major}.{minor}.{patch}")
        }
    }
}

/// A packed `a.b.c.d.e` source version (24.10.10.10.10 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SourceVersion(pub u64);

impl fmt::Display for SourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        let a = v >> 40;
        let parts = [(v >> 30) & 0x3ff, (v >> 20) & 0x3ff, (v >> 10) & 0x3ff, v & 0x3ff];
        write!(f, "{a}")?;
        let used = parts.iter().rposition(|&p| p != 0).map_or(0, |i| i + 1);
        for p in &parts[..used] {
            write!(f, ".{p}")?;
        }
        Ok(())
    }
}

/// Platform named by `LC_BUILD_VERSION`.
pub fn platform_name(platform: u32) -> &'static str {
    match platform {
        1 => "macOS",
        2 => "iOS",
        3 => "tvOS",
        4 => "watchOS",
        5 => "bridgeOS",
        6 => "macCatalyst",
        7 => "iOSSimulator",
        8 => "tvOSSimulator",
        9 => "watchOSSimulator",
        10 => "DriverKit",
        11 => "visionOS",
        12 => "visionOSSimulator",
        _ => "unknown",
    }
}

/// Load-command tags.
pub mod lc {
    pub const REQ_DYLD: u32 = 0x8000_0000;

    pub const SEGMENT: u32 = 0x1;
    pub const SYMTAB: u32 = 0x2;
    pub const SYMSEG: u32 = 0x3;
    pub const THREAD: u32 = 0x4;
    pub const UNIXTHREAD: u32 = 0x5;
    pub const LOADFVMLIB: u32 = 0x6;
    pub const IDFVMLIB: u32 = 0x7;
    pub const IDENT: u32 = 0x8;
    pub const FVMFILE: u32 = 0x9;
    pub const PREPAGE: u32 = 0xa;
    pub const DYSYMTAB: u32 = 0xb;
    pub const LOAD_DYLIB: u32 = 0xc;
    pub const ID_DYLIB: u32 = 0xd;
    pub const LOAD_DYLINKER: u32 = 0xe;
    pub const ID_DYLINKER: u32 = 0xf;
    pub const PREBOUND_DYLIB: u32 = 0x10;
    pub const ROUTINES: u32 = 0x11;
    pub const SUB_FRAMEWORK: u32 = 0x12;
    pub const SUB_UMBRELLA: u32 = 0x13;
    pub const SUB_CLIENT: u32 = 0x14;
    pub const SUB_LIBRARY: u32 = 0x15;
    pub const TWOLEVEL_HINTS: u32 = 0x16;
    pub const PREBIND_CKSUM: u32 = 0x17;
    pub const LOAD_WEAK_DYLIB: u32 = 0x18 | REQ_DYLD;
    pub const SEGMENT_64: u32 = 0x19;
    pub const ROUTINES_64: u32 = 0x1a;
    pub const UUID: u32 = 0x1b;
    pub const RPATH: u32 = 0x1c | REQ_DYLD;
    pub const CODE_SIGNATURE: u32 = 0x1d;
    pub const SEGMENT_SPLIT_INFO: u32 = 0x1e;
    pub const REEXPORT_DYLIB: u32 = 0x1f | REQ_DYLD;
    pub const LAZY_LOAD_DYLIB: u32 = 0x20;
    pub const ENCRYPTION_INFO: u32 = 0x21;
    pub const DYLD_INFO: u32 = 0x22;
    pub const DYLD_INFO_ONLY: u32 = 0x22 | REQ_DYLD;
    pub const LOAD_UPWARD_DYLIB: u32 = 0x23 | REQ_DYLD;
    pub const VERSION_MIN_MACOSX: u32 = 0x24;
    pub const VERSION_MIN_IPHONEOS: u32 = 0x25;
    pub const FUNCTION_STARTS: u32 = 0x26;
    pub const DYLD_ENVIRONMENT: u32 = 0x27;
    pub const MAIN: u32 = 0x28 | REQ_DYLD;
    pub const DATA_IN_CODE: u32 = 0x29;
    pub const SOURCE_VERSION: u32 = 0x2a;
    pub const DYLIB_CODE_SIGN_DRS: u32 = 0x2b;
    pub const ENCRYPTION_INFO_64: u32 = 0x2c;
    pub const LINKER_OPTION: u32 = 0x2d;
    pub const LINKER_OPTIMIZATION_HINT: u32 = 0x2e;
    pub const VERSION_MIN_TVOS: u32 = 0x2f;
    pub const VERSION_MIN_WATCHOS: u32 = 0x30;
    pub const NOTE: u32 = 0x31;
    pub const BUILD_VERSION: u32 = 0x32;
    pub const DYLD_EXPORTS_TRIE: u32 = 0x33 | REQ_DYLD;
    pub const DYLD_CHAINED_FIXUPS: u32 = 0x34 | REQ_DYLD;
    pub const FILESET_ENTRY: u32 = 0x35 | REQ_DYLD;
    pub const ATOM_INFO: u32 = 0x36;

    /// Symbolic name of a load-command tag.
    pub fn name(cmd: u32) -> &'static str {
        match cmd {
            SEGMENT => "LC_SEGMENT",
            SYMTAB => "LC_SYMTAB",
            SYMSEG => "LC_SYMSEG",
            THREAD => "LC_THREAD",
            UNIXTHREAD => "LC_UNIXTHREAD",
            LOADFVMLIB => "LC_LOADFVMLIB",
            IDFVMLIB => "LC_IDFVMLIB",
            IDENT => "LC_IDENT",
            FVMFILE => "LC_FVMFILE",
            PREPAGE => "LC_PREPAGE",
            DYSYMTAB => "LC_DYSYMTAB",
            LOAD_DYLIB => "LC_LOAD_DYLIB",
            ID_DYLIB => "LC_ID_DYLIB",
            LOAD_DYLINKER => "LC_LOAD_DYLINKER",
            ID_DYLINKER => "LC_ID_DYLINKER",
            PREBOUND_DYLIB => "LC_PREBOUND_DYLIB",
            ROUTINES => "LC_ROUTINES",
            SUB_FRAMEWORK => "LC_SUB_FRAMEWORK",
            SUB_UMBRELLA => "LC_SUB_UMBRELLA",
            SUB_CLIENT => "LC_SUB_CLIENT",
            SUB_LIBRARY => "LC_SUB_LIBRARY",
            TWOLEVEL_HINTS => "LC_TWOLEVEL_HINTS",
            PREBIND_CKSUM => "LC_PREBIND_CKSUM",
            LOAD_WEAK_DYLIB => "LC_LOAD_WEAK_DYLIB",
            SEGMENT_64 => "LC_SEGMENT_64",
            ROUTINES_64 => "LC_ROUTINES_64",
            UUID => "LC_UUID",
            RPATH => "LC_RPATH",
            CODE_SIGNATURE => "LC_CODE_SIGNATURE",
            SEGMENT_SPLIT_INFO => "LC_SEGMENT_SPLIT_INFO",
            REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
            LAZY_LOAD_DYLIB => "LC_LAZY_LOAD_DYLIB",
            ENCRYPTION_INFO => "LC_ENCRYPTION_INFO",
            DYLD_INFO => "LC_DYLD_INFO",
            DYLD_INFO_ONLY => "LC_DYLD_INFO_ONLY",
            LOAD_UPWARD_DYLIB => "LC_LOAD_UPWARD_DYLIB",
            VERSION_MIN_MACOSX => "LC_VERSION_MIN_MACOSX",
            VERSION_MIN_IPHONEOS => "LC_VERSION_MIN_IPHONEOS",
            FUNCTION_STARTS => "LC_FUNCTION_STARTS",
            DYLD_ENVIRONMENT => "LC_DYLD_ENVIRONMENT",
            MAIN => "LC_MAIN",
            DATA_IN_CODE => "LC_DATA_IN_CODE",
            SOURCE_VERSION => "LC_SOURCE_VERSION",
            DYLIB_CODE_SIGN_DRS => "LC_DYLIB_CODE_SIGN_DRS",
            ENCRYPTION_INFO_64 => "LC_ENCRYPTION_INFO_64",
            LINKER_OPTION => "LC_LINKER_OPTION",
            LINKER_OPTIMIZATION_HINT => "LC_LINKER_OPTIMIZATION_HINT",
            VERSION_MIN_TVOS => "LC_VERSION_MIN_TVOS",
            VERSION_MIN_WATCHOS => "LC_VERSION_MIN_WATCHOS",
            NOTE => "LC_NOTE",
            BUILD_VERSION => "LC_BUILD_VERSION",
            DYLD_EXPORTS_TRIE => "LC_DYLD_EXPORTS_TRIE",
            DYLD_CHAINED_FIXUPS => "LC_DYLD_CHAINED_FIXUPS",
            FILESET_ENTRY => "LC_FILESET_ENTRY",
            ATOM_INFO => "LC_ATOM_INFO",
            _ => "LC_UNKNOWN",
        }
    }

    /// Commands that load a dependent dylib and therefore consume a library ordinal.
    pub fn is_dylib_load(cmd: u32) -> bool {
        matches!(
            cmd,
            LOAD_DYLIB | LOAD_WEAK_DYLIB | REEXPORT_DYLIB | LOAD_UPWARD_DYLIB | LAZY_LOAD_DYLIB
        )
    }
}

/// Symbol-table type bits.
pub mod nlist {
    pub const N_STAB: u8 = 0xe0;
    pub const N_PEXT: u8 = 0x10;
    pub const N_TYPE: u8 = 0x0e;
    pub const N_EXT: u8 = 0x01;

    pub const N_UNDF: u8 = 0x0;
    pub const N_ABS: u8 = 0x2;
    pub const N_SECT: u8 = 0xe;
    pub const N_PBUD: u8 = 0xc;
    pub const N_INDR: u8 = 0xa;

    pub const NO_SECT: u8 = 0;
}

/// Indirect-symbol-table markers that are not symbol indices.
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

/// Section type and attribute bits.
pub mod section_flags {
    pub const SECTION_TYPE: u32 = 0x0000_00ff;
    pub const SECTION_ATTRIBUTES: u32 = 0xffff_ff00;

    pub const S_REGULAR: u32 = 0x0;
    pub const S_ZEROFILL: u32 = 0x1;
    pub const S_CSTRING_LITERALS: u32 = 0x2;
    pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
    pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
    pub const S_SYMBOL_STUBS: u32 = 0x8;
    pub const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9;
    pub const S_GB_ZEROFILL: u32 = 0xc;
    pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;

    pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
    pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;
}
