use crate::common::fixtures;
use machokit::formats::macho::types::{lc, Endian, FileType, WordSize, CPU_TYPE_PPC, CPU_TYPE_X86_64};
use machokit::{ByteSource, MachO, MachOError, MachoConfig, ParseConfig, ParseSettings};

#[test]
fn test_executable_catalog() {
    let m = MachO::from_bytes(fixtures::executable()).unwrap();
    let header = m.header();
    assert_eq!(header.endian, Endian::Little);
    assert_eq!(header.word_size, WordSize::W64);
    assert_eq!(header.cputype, CPU_TYPE_X86_64);
    assert_eq!(header.filetype, FileType::Execute);
    assert_eq!(header.ncmds as usize, m.loads().len());

    let names: Vec<_> = m.segments().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["__PAGEZERO", "__TEXT", "__LINKEDIT"]);
    let text = m.section("__TEXT", "__text").unwrap();
    assert_eq!(text.addr, 0x1_0000_0f00);
    assert_eq!(text.offset, 0xf00);
    assert_eq!(&m.section_data("__TEXT", "__text").unwrap()[..], &[0x90u8; 0x20][..]);

    assert_eq!(m.uuid().unwrap().as_bytes(), &fixtures::EXE_UUID);
    assert_eq!(m.entry_point().unwrap().entry_offset, 0xf00);
    assert_eq!(m.imported_libraries(), ["/usr/lib/libSystem.B.dylib"]);
    assert_eq!(m.library_ordinal_name(1), "/usr/lib/libSystem.B.dylib");
    assert_eq!(
        m.function_starts().unwrap(),
        vec![0x1_0000_0f00, 0x1_0000_0f10]
    );
}

#[test]
fn test_symbols() {
    let m = MachO::from_bytes(fixtures::executable()).unwrap();
    let names: Vec<_> = m.symbols().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["_helper", "_main", "_printf"]);

    let imported: Vec<_> = m.imported_symbols().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(imported, ["_printf"]);
    assert_eq!(m.symbol_by_name("_printf").unwrap().library_ordinal(), 1);

    assert_eq!(m.find_symbol_address("_main").unwrap(), 0x1_0000_0f00);
    // Case-insensitive fallback.
    assert_eq!(m.find_symbol_address("_HELPER").unwrap(), 0x1_0000_0f10);
    // Undefined symbols have no address.
    assert!(m.find_symbol_address("_printf").unwrap_err().is_not_found());
    assert_eq!(m.dysymtab().unwrap().indirect_symbols, vec![2]);
}

#[test]
fn test_no_undefined_symbols() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    assert_eq!(m.dysymtab().unwrap().nundefsym, 0);
    assert!(m.imported_symbols().is_empty());
}

#[test]
fn test_round_trip_is_identical() {
    for image in [fixtures::executable(), fixtures::be32_executable()] {
        let m = MachO::from_bytes(image.clone()).unwrap();
        let bytes = m.to_bytes().unwrap();
        assert_eq!(bytes, image);
        let again = MachO::from_bytes(bytes).unwrap();
        assert_eq!(again.toc(), m.toc());
    }
}

#[test]
fn test_sections_inside_segments() {
    for image in [
        fixtures::executable(),
        fixtures::be32_executable(),
        fixtures::cache_dylib(),
    ] {
        let m = MachO::from_bytes(image).unwrap();
        for seg in m.segments() {
            for section in m.toc().sections_of(seg) {
                assert!(section.addr >= seg.vmaddr);
                assert!(section.addr + section.size <= seg.vmaddr + seg.vmsize);
                if section.offset != 0 {
                    let off = u64::from(section.offset);
                    assert!(off >= seg.fileoff && off + section.size <= seg.fileoff + seg.filesize);
                }
            }
        }
    }
}

#[test]
fn test_big_endian_32() {
    let m = MachO::from_bytes(fixtures::be32_executable()).unwrap();
    assert_eq!(m.header().endian, Endian::Big);
    assert_eq!(m.header().word_size, WordSize::W32);
    assert_eq!(m.header().cputype, CPU_TYPE_PPC);
    assert_eq!(m.header().size(), 28);
    assert_eq!(m.segment("__TEXT").unwrap().vmaddr, 0x1000);
    assert_eq!(m.symbols()[0].name, "_start");
    assert_eq!(m.find_symbol_address("_start").unwrap(), 0x1800);
    assert_eq!(&m.section_data("__TEXT", "__text").unwrap()[..4], &[0x60, 0, 0, 0]);
}

#[test]
fn test_bad_magic() {
    let mut image = fixtures::executable();
    image[..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
    match MachO::from_bytes(image).unwrap_err() {
        MachOError::Format { offset, .. } => assert_eq!(offset, 0),
        other => panic!("unexpected error: {other}"),
    }
    assert!(MachO::from_bytes(Vec::new()).is_err());
}

#[test]
fn test_command_filter() {
    let settings = ParseSettings {
        exclude_commands: vec![lc::UUID, lc::FUNCTION_STARTS],
        ..ParseSettings::default()
    };
    let source = machokit::MemorySource::new(fixtures::executable()).into_source();
    let m = MachO::with_config(source, ParseConfig::with_settings(settings)).unwrap();
    assert!(m.uuid().is_none());
    assert!(m.function_starts().unwrap().is_empty());
    assert!(m.loads().len() < m.header().ncmds as usize);
}

#[test]
fn test_open_file() {
    let file = crate::common::create_temp_file(&fixtures::executable());
    let m = MachO::open(file.path(), &MachoConfig::default()).unwrap();
    assert_eq!(m.segments().count(), 3);
    assert!(m.source().size() > 0);
}

#[test]
fn test_open_respects_size_limit() {
    let file = crate::common::create_temp_file(&fixtures::executable());
    let mut config = MachoConfig::default();
    config.io.max_file_size = 0x100;
    assert!(MachO::open(file.path(), &config).is_err());
}

#[test]
fn test_oversized_segment_is_an_error() {
    let mut image = fixtures::executable();
    // __LINKEDIT follows the header, __PAGEZERO and __TEXT (one section).
    let linkedit_at = 32 + 72 + 152;
    assert_eq!(&image[linkedit_at + 8..linkedit_at + 18], b"__LINKEDIT");
    image[linkedit_at + 48..linkedit_at + 56].copy_from_slice(&0x4000_0000_0000u64.to_le_bytes());

    let m = MachO::from_bytes(image).unwrap();
    let err = m.to_bytes().unwrap_err();
    assert!(matches!(err, MachOError::Truncated { offset: 0x4000, .. }));
}

#[test]
fn test_oversized_zerofill_section() {
    use crate::common::{ImageBuilder, SectionSpec, MH_EXECUTE};
    use machokit::formats::macho::types::section_flags::S_ZEROFILL;

    let huge = 1u64 << 40;
    let image = ImageBuilder::new(true, false, CPU_TYPE_X86_64, MH_EXECUTE)
        .segment("__TEXT", 0x1_0000_0000, 0x1000, 0, 0x1000, 5, &[])
        .segment(
            "__DATA",
            0x1_0000_1000,
            huge,
            0,
            0,
            3,
            &[
                SectionSpec {
                    name: "__bss",
                    addr: 0x1_0000_1000,
                    size: huge,
                    offset: 0,
                    flags: S_ZEROFILL,
                },
                SectionSpec {
                    name: "__common",
                    addr: 0x1_0000_1000,
                    size: 0x40,
                    offset: 0,
                    flags: S_ZEROFILL,
                },
            ],
        )
        .size(0x1000)
        .build();
    let m = MachO::from_bytes(image).unwrap();
    let err = m.section_data("__DATA", "__bss").unwrap_err();
    assert!(matches!(err, MachOError::Format { value: Some(v), .. } if v == huge));
    assert_eq!(m.section_data("__DATA", "__common").unwrap(), vec![0u8; 0x40]);
}
