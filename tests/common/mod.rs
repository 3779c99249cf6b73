//! Common test utilities and helpers.
//!
//! Images are assembled byte by byte so the parser is checked against
//! layouts it did not produce itself.

#![allow(dead_code)]

use machokit::formats::macho::types::{lc, CPU_TYPE_ARM64, CPU_TYPE_PPC, CPU_TYPE_X86_64};
use std::io::Write;
use tempfile::NamedTempFile;

pub const MH_EXECUTE: u32 = 2;
pub const MH_DYLIB: u32 = 6;
pub const MH_DYLIB_IN_CACHE: u32 = 0x8000_0000;
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;

/// Creates a temporary file with the given content.
pub fn create_temp_file(content: &[u8]) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content).unwrap();
    temp_file
}

#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub name: &'static str,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub flags: u32,
}

/// Raw Mach-O image builder.
pub struct ImageBuilder {
    big_endian: bool,
    is_64: bool,
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    flags: u32,
    commands: Vec<Vec<u8>>,
    blobs: Vec<(usize, Vec<u8>)>,
    size: usize,
}

impl ImageBuilder {
    pub fn new(is_64: bool, big_endian: bool, cputype: u32, filetype: u32) -> Self {
        Self {
            big_endian,
            is_64,
            cputype,
            cpusubtype: 0,
            filetype,
            flags: 0,
            commands: Vec::new(),
            blobs: Vec::new(),
            size: 0,
        }
    }

    pub fn u16(&self, buf: &mut Vec<u8>, v: u16) {
        if self.big_endian {
            buf.extend_from_slice(&v.to_be_bytes());
        } else {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn u32(&self, buf: &mut Vec<u8>, v: u32) {
        if self.big_endian {
            buf.extend_from_slice(&v.to_be_bytes());
        } else {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn u64(&self, buf: &mut Vec<u8>, v: u64) {
        if self.big_endian {
            buf.extend_from_slice(&v.to_be_bytes());
        } else {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn word(&self, buf: &mut Vec<u8>, v: u64) {
        if self.is_64 {
            self.u64(buf, v);
        } else {
            self.u32(buf, v as u32);
        }
    }

    fn name16(buf: &mut Vec<u8>, name: &str) {
        let mut field = [0u8; 16];
        field[..name.len()].copy_from_slice(name.as_bytes());
        buf.extend_from_slice(&field);
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn cpusubtype(mut self, cpusubtype: u32) -> Self {
        self.cpusubtype = cpusubtype;
        self
    }

    /// Total file size; blobs past it still extend the file.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Place `bytes` at file offset `offset`.
    pub fn place(mut self, offset: usize, bytes: Vec<u8>) -> Self {
        self.blobs.push((offset, bytes));
        self
    }

    /// Append a command with `payload` after the 8-byte cmd/cmdsize prefix,
    /// padded to the pointer size.
    pub fn command(mut self, cmd: u32, payload: &[u8]) -> Self {
        let align = if self.is_64 { 8 } else { 4 };
        let size = (8 + payload.len()).div_ceil(align) * align;
        let mut buf = Vec::with_capacity(size);
        self.u32(&mut buf, cmd);
        self.u32(&mut buf, size as u32);
        buf.extend_from_slice(payload);
        buf.resize(size, 0);
        self.commands.push(buf);
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn segment(
        self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        prot: u32,
        sections: &[SectionSpec],
    ) -> Self {
        let mut p = Vec::new();
        Self::name16(&mut p, name);
        self.word(&mut p, vmaddr);
        self.word(&mut p, vmsize);
        self.word(&mut p, fileoff);
        self.word(&mut p, filesize);
        self.u32(&mut p, prot);
        self.u32(&mut p, prot);
        self.u32(&mut p, sections.len() as u32);
        self.u32(&mut p, 0);
        for s in sections {
            Self::name16(&mut p, s.name);
            Self::name16(&mut p, name);
            self.word(&mut p, s.addr);
            self.word(&mut p, s.size);
            self.u32(&mut p, s.offset);
            self.u32(&mut p, 4); // align
            self.u32(&mut p, 0); // reloff
            self.u32(&mut p, 0); // nreloc
            self.u32(&mut p, s.flags);
            self.u32(&mut p, 0);
            self.u32(&mut p, 0);
            if self.is_64 {
                self.u32(&mut p, 0);
            }
        }
        let cmd = if self.is_64 { lc::SEGMENT_64 } else { lc::SEGMENT };
        self.command(cmd, &p)
    }

    pub fn symtab(self, symoff: u32, nsyms: u32, stroff: u32, strsize: u32) -> Self {
        let mut p = Vec::new();
        for v in [symoff, nsyms, stroff, strsize] {
            self.u32(&mut p, v);
        }
        self.command(lc::SYMTAB, &p)
    }

    /// `LC_DYSYMTAB` with local/extdef/undef partitions and an indirect table.
    pub fn dysymtab(self, partitions: [u32; 6], indirectsymoff: u32, nindirectsyms: u32) -> Self {
        let mut p = Vec::new();
        for v in partitions {
            self.u32(&mut p, v);
        }
        for v in [0, 0, 0, 0, 0, 0, indirectsymoff, nindirectsyms, 0, 0, 0, 0] {
            self.u32(&mut p, v);
        }
        self.command(lc::DYSYMTAB, &p)
    }

    pub fn dylib(self, cmd: u32, name: &str) -> Self {
        let mut p = Vec::new();
        self.u32(&mut p, 24);
        self.u32(&mut p, 2);
        self.u32(&mut p, 0x0001_0000);
        self.u32(&mut p, 0x0001_0000);
        p.extend_from_slice(name.as_bytes());
        p.push(0);
        self.command(cmd, &p)
    }

    pub fn linkedit_data(self, cmd: u32, offset: u32, size: u32) -> Self {
        let mut p = Vec::new();
        self.u32(&mut p, offset);
        self.u32(&mut p, size);
        self.command(cmd, &p)
    }

    pub fn uuid(self, uuid: [u8; 16]) -> Self {
        self.command(lc::UUID, &uuid)
    }

    pub fn main(self, entryoff: u64, stacksize: u64) -> Self {
        let mut p = Vec::new();
        self.u64(&mut p, entryoff);
        self.u64(&mut p, stacksize);
        self.command(lc::MAIN, &p)
    }

    pub fn nlist(&self, strx: u32, n_type: u8, sect: u8, desc: u16, value: u64) -> Vec<u8> {
        let mut p = Vec::new();
        self.u32(&mut p, strx);
        p.push(n_type);
        p.push(sect);
        self.u16(&mut p, desc);
        self.word(&mut p, value);
        p
    }

    pub fn u32s(&self, values: &[u32]) -> Vec<u8> {
        let mut p = Vec::new();
        for &v in values {
            self.u32(&mut p, v);
        }
        p
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        let magic = if self.is_64 { 0xfeed_facf } else { 0xfeed_face };
        let sizeofcmds: usize = self.commands.iter().map(Vec::len).sum();
        for v in [
            magic,
            self.cputype,
            self.cpusubtype,
            self.filetype,
            self.commands.len() as u32,
            sizeofcmds as u32,
            self.flags,
        ] {
            self.u32(&mut out, v);
        }
        if self.is_64 {
            self.u32(&mut out, 0);
        }
        for c in &self.commands {
            out.extend_from_slice(c);
        }
        let end = self
            .blobs
            .iter()
            .map(|(off, b)| off + b.len())
            .max()
            .unwrap_or(0)
            .max(self.size)
            .max(out.len());
        out.resize(end, 0);
        for (off, b) in &self.blobs {
            out[*off..off + b.len()].copy_from_slice(b);
        }
        out
    }
}

fn uleb(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// One export for [`export_trie`].
pub enum TrieSpec<'a> {
    Regular { name: &'a str, offset: u64 },
    Reexport { name: &'a str, ordinal: u64, import: &'a str },
}

/// A flat export trie: every export hangs directly off the root.
pub fn export_trie(entries: &[TrieSpec<'_>]) -> Vec<u8> {
    let name = |e: &TrieSpec<'_>| match e {
        TrieSpec::Regular { name, .. } | TrieSpec::Reexport { name, .. } => name.to_string(),
    };
    let nodes: Vec<Vec<u8>> = entries
        .iter()
        .map(|e| {
            let mut info = Vec::new();
            match e {
                TrieSpec::Regular { offset, .. } => {
                    uleb(&mut info, 0);
                    uleb(&mut info, *offset);
                }
                TrieSpec::Reexport { ordinal, import, .. } => {
                    uleb(&mut info, 0x08);
                    uleb(&mut info, *ordinal);
                    info.extend_from_slice(import.as_bytes());
                    info.push(0);
                }
            }
            let mut node = Vec::new();
            uleb(&mut node, info.len() as u64);
            node.extend_from_slice(&info);
            node.push(0);
            node
        })
        .collect();

    let root_len = 2 + entries.iter().map(|e| name(e).len() + 2).sum::<usize>();
    let mut out = vec![0u8, entries.len() as u8];
    let mut child = root_len;
    for (e, node) in entries.iter().zip(&nodes) {
        assert!(child < 0x80, "fixture trie needs single-byte offsets");
        out.extend_from_slice(name(e).as_bytes());
        out.push(0);
        out.push(child as u8);
        child += node.len();
    }
    for node in nodes {
        out.extend_from_slice(&node);
    }
    out
}

pub mod fixtures {
    use super::*;

    pub const EXE_TEXT_VMADDR: u64 = 0x1_0000_0000;
    pub const EXE_UUID: [u8; 16] = [
        0x3f, 0x2a, 0x81, 0x14, 0x6d, 0x52, 0x4b, 0x1c, 0x9e, 0x07, 0x5a, 0x33, 0xc0, 0x18, 0x44, 0x21,
    ];

    /// Little-endian x86-64 executable. `__LINKEDIT` sits at 0x4000 after a
    /// gap, so exporting moves it to 0x1000.
    pub fn executable() -> Vec<u8> {
        let b = ImageBuilder::new(true, false, CPU_TYPE_X86_64, MH_EXECUTE).cpusubtype(3);
        let symbols = [
            b.nlist(1, 0x0e, 1, 0, 0x1_0000_0f10),
            b.nlist(9, 0x0f, 1, 0, 0x1_0000_0f00),
            b.nlist(15, 0x01, 0, 0x0100, 0),
        ]
        .concat();
        let strings = b"\0_helper\0_main\0_printf\0\0".to_vec();
        let indirect = b.u32s(&[2]);
        // uleb deltas 0xf00, 0x10
        let starts = vec![0x80, 0x1e, 0x10, 0, 0, 0, 0, 0];
        let code = vec![0x90u8; 0x20];

        b.segment("__PAGEZERO", 0, 0x1_0000_0000, 0, 0, 0, &[])
            .segment(
                "__TEXT",
                EXE_TEXT_VMADDR,
                0x1000,
                0,
                0x1000,
                5,
                &[SectionSpec {
                    name: "__text",
                    addr: 0x1_0000_0f00,
                    size: 0x20,
                    offset: 0xf00,
                    flags: S_ATTR_PURE_INSTRUCTIONS,
                }],
            )
            .segment("__LINKEDIT", 0x1_0000_1000, 0x1000, 0x4000, 0x1000, 1, &[])
            .symtab(0x4000, 3, 0x4040, 24)
            .dysymtab([0, 1, 1, 1, 2, 1], 0x4060, 1)
            .uuid(EXE_UUID)
            .main(0xf00, 0)
            .dylib(lc::LOAD_DYLIB, "/usr/lib/libSystem.B.dylib")
            .linkedit_data(lc::FUNCTION_STARTS, 0x4080, 8)
            .place(0xf00, code)
            .place(0x4000, symbols)
            .place(0x4040, strings)
            .place(0x4060, indirect)
            .place(0x4080, starts)
            .size(0x5000)
            .build()
    }

    /// Big-endian 32-bit PowerPC executable with one symbol.
    pub fn be32_executable() -> Vec<u8> {
        let b = ImageBuilder::new(false, true, CPU_TYPE_PPC, MH_EXECUTE);
        let symbols = b.nlist(1, 0x0f, 1, 0, 0x1800);
        let strings = b"\0_start\0".to_vec();
        b.segment(
            "__TEXT",
            0x1000,
            0x1000,
            0,
            0x1000,
            5,
            &[SectionSpec {
                name: "__text",
                addr: 0x1800,
                size: 0x40,
                offset: 0x800,
                flags: S_ATTR_PURE_INSTRUCTIONS,
            }],
        )
        .segment("__LINKEDIT", 0x2000, 0x1000, 0x1000, 0x100, 1, &[])
        .symtab(0x1000, 1, 0x1010, 8)
        .place(0x800, vec![0x60, 0, 0, 0])
        .place(0x1000, symbols)
        .place(0x1010, strings)
        .size(0x1100)
        .build()
    }

    pub const CACHE_TEXT_VMADDR: u64 = 0x1_8000_0000;

    /// A dylib as extracted from a shared cache: `__LINKEDIT` at 0x20000,
    /// three symbols, a three-entry indirect table, one regular export and
    /// one re-export from the second dependency.
    pub fn cache_dylib() -> Vec<u8> {
        let b = ImageBuilder::new(true, false, CPU_TYPE_ARM64, MH_DYLIB).flags(MH_DYLIB_IN_CACHE);
        let symbols = [
            b.nlist(1, 0x0e, 1, 0, 0x1_8000_1000),
            b.nlist(11, 0x0f, 1, 0, 0x1_8000_1010),
            b.nlist(21, 0x0f, 1, 0, 0x1_8000_1020),
        ]
        .concat();
        let strings = b"\0_local_fn\0_exported\0_other\0\0\0\0\0".to_vec();
        let indirect = b.u32s(&[1, 0x8000_0000, 2]);
        let trie = export_trie(&[
            TrieSpec::Regular {
                name: "_exported",
                offset: 0x1010,
            },
            TrieSpec::Reexport {
                name: "_reexp",
                ordinal: 2,
                import: "_orig",
            },
        ]);
        let trie_len = trie.len() as u32;
        let starts = vec![0x80, 0x20, 0x10, 0, 0, 0, 0, 0];

        b.segment(
            "__TEXT",
            CACHE_TEXT_VMADDR,
            0x4000,
            0,
            0x4000,
            5,
            &[SectionSpec {
                name: "__text",
                addr: 0x1_8000_1000,
                size: 0x100,
                offset: 0x1000,
                flags: S_ATTR_PURE_INSTRUCTIONS,
            }],
        )
        .segment(
            "__DATA",
            0x1_8000_8000,
            0x1000,
            0x8000,
            0x1000,
            3,
            &[SectionSpec {
                name: "__data",
                addr: 0x1_8000_8000,
                size: 0x10,
                offset: 0x8000,
                flags: 0,
            }],
        )
        .segment("__LINKEDIT", 0x1_8002_0000, 0x3000, 0x20000, 0x3000, 1, &[])
        .dylib(lc::ID_DYLIB, "/usr/lib/libcached.dylib")
        .dylib(lc::LOAD_DYLIB, "/usr/lib/libSystem.B.dylib")
        .dylib(lc::REEXPORT_DYLIB, "/usr/lib/libreexp.dylib")
        .symtab(0x20000, 3, 0x20100, 32)
        .dysymtab([0, 1, 1, 2, 3, 0], 0x20200, 3)
        .linkedit_data(lc::DYLD_EXPORTS_TRIE, 0x20300, trie_len)
        .linkedit_data(lc::FUNCTION_STARTS, 0x20400, 8)
        .place(0x1000, vec![0x1f, 0x20, 0x03, 0xd5])
        .place(0x8000, b"cached data\0".to_vec())
        .place(0x20000, symbols)
        .place(0x20100, strings)
        .place(0x20200, indirect)
        .place(0x20300, trie)
        .place(0x20400, starts)
        .size(0x23000)
        .build()
    }

    /// Chained-fixups blob with one `DYLD_CHAINED_PTR_64_OFFSET` chain in
    /// segment 1 starting at its first byte, and a single import `_foo`
    /// bound to the image itself.
    pub fn chained_fixups_blob() -> Vec<u8> {
        let b = ImageBuilder::new(true, false, CPU_TYPE_ARM64, MH_EXECUTE);
        let mut blob = Vec::new();
        // header: version, starts, imports, symbols, count, format, symbols format
        for v in [0u32, 32, 88, 92, 1, 1, 0, 0] {
            b.u32(&mut blob, v);
        }
        // starts in image: two segments, only the second has chains
        for v in [2u32, 0, 16, 0] {
            b.u32(&mut blob, v);
        }
        // starts in segment
        b.u32(&mut blob, 24);
        b.u16(&mut blob, 0x1000);
        b.u16(&mut blob, 6);
        b.u64(&mut blob, 0x4000);
        b.u32(&mut blob, 0);
        b.u16(&mut blob, 1);
        b.u16(&mut blob, 0);
        blob.resize(88, 0);
        // import: ordinal 0 (self), name offset 1
        b.u32(&mut blob, 1 << 9);
        blob.extend_from_slice(b"\0_foo\0");
        blob
    }

    pub const FIXUP_REBASE: u64 = (2u64 << 51) | 0x3f00;
    pub const FIXUP_BIND: u64 = 1u64 << 63;

    /// Executable whose `__DATA` holds a rebase followed by a bind to `_foo`.
    pub fn chained_executable() -> Vec<u8> {
        let b = ImageBuilder::new(true, false, CPU_TYPE_ARM64, MH_EXECUTE);
        let blob = chained_fixups_blob();
        let blob_len = blob.len() as u32;
        let symbols = b.nlist(1, 0x0f, 1, 0, 0x1_0000_0f00);
        let strings = b"\0_foo\0\0\0".to_vec();
        let mut data = Vec::new();
        b.u64(&mut data, FIXUP_REBASE);
        b.u64(&mut data, FIXUP_BIND);

        b.segment(
            "__TEXT",
            EXE_TEXT_VMADDR,
            0x4000,
            0,
            0x4000,
            5,
            &[SectionSpec {
                name: "__text",
                addr: 0x1_0000_0f00,
                size: 0x10,
                offset: 0xf00,
                flags: S_ATTR_PURE_INSTRUCTIONS,
            }],
        )
        .segment("__DATA", 0x1_0000_4000, 0x1000, 0x4000, 0x1000, 3, &[])
        .segment("__LINKEDIT", 0x1_0000_8000, 0x1000, 0x8000, 0x1000, 1, &[])
        .symtab(0x8100, 1, 0x8120, 8)
        .linkedit_data(lc::DYLD_CHAINED_FIXUPS, 0x8000, blob_len)
        .place(0x4000, data)
        .place(0x8000, blob)
        .place(0x8100, symbols)
        .place(0x8120, strings)
        .size(0x9000)
        .build()
    }

    /// Universal binary holding the given thin images at 0x1000-aligned offsets.
    pub fn fat(thin: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xcafe_babeu32.to_be_bytes());
        out.extend_from_slice(&(thin.len() as u32).to_be_bytes());
        let mut offset = 0x1000usize;
        let mut placed = Vec::new();
        for (cpu, image) in thin {
            out.extend_from_slice(&cpu.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&(offset as u32).to_be_bytes());
            out.extend_from_slice(&(image.len() as u32).to_be_bytes());
            out.extend_from_slice(&12u32.to_be_bytes());
            placed.push((offset, image));
            offset = (offset + image.len()).div_ceil(0x1000) * 0x1000;
        }
        for (at, image) in placed {
            out.resize(at, 0);
            out.extend_from_slice(image);
        }
        out
    }
}
