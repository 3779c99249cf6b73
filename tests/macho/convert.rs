use crate::common::fixtures;
use machokit::formats::macho::fixups::{ChainedPointer, PointerFormat};
use machokit::{AddressTranslator, MachO, MemorySource, ParseConfig, Result};
use std::sync::Arc;

#[test]
fn test_offset_to_address() {
    let m = MachO::from_bytes(fixtures::executable()).unwrap();
    assert_eq!(m.get_vm_address(0xf00).unwrap(), 0x1_0000_0f00);
    assert_eq!(m.get_offset(0x1_0000_0f00).unwrap(), 0xf00);
    assert_eq!(m.get_vm_address(0x4010).unwrap(), 0x1_0000_1010);
    // The gap between __TEXT and __LINKEDIT is not mapped.
    assert!(m.get_vm_address(0x2000).unwrap_err().is_not_found());
    assert!(m.get_offset(0x2_0000_0000).unwrap_err().is_not_found());
}

#[test]
fn test_address_offset_inverse() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    for addr in [0x1_8000_1000u64, 0x1_8000_8004, 0x1_8002_0100] {
        let offset = m.get_offset(addr).unwrap();
        assert_eq!(m.get_vm_address(offset).unwrap(), addr);
    }
}

#[test]
fn test_cstring_and_pointer_reads() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    assert_eq!(m.get_cstring(0x1_8000_8000).unwrap(), "cached data");
    assert_eq!(m.get_pointer_at_address(0x1_8000_1000).unwrap() & 0xffff_ffff, 0xd503_201f);
}

#[test]
fn test_chained_pointers() {
    let m = MachO::from_bytes(fixtures::chained_executable()).unwrap();
    let dcf = m.chained_fixups().unwrap().unwrap();
    assert_eq!(dcf.pointer_format, Some(PointerFormat::Ptr64Offset));
    assert_eq!(dcf.fixups.len(), 2);
    assert!(matches!(dcf.fixups[0].pointer, ChainedPointer::Rebase { target: 0x3f00, .. }));
    assert!(matches!(dcf.fixups[1].pointer, ChainedPointer::Bind { ordinal: 0, .. }));

    // Rebase target plus the preferred load address.
    assert_eq!(m.convert_to_vm_addr(fixtures::FIXUP_REBASE), 0x1_0000_3f00);
    // Bind to a symbol of this image.
    assert_eq!(m.convert_to_vm_addr(fixtures::FIXUP_BIND), 0x1_0000_0f00);
    assert_eq!(m.slide_pointer_at(0x1_0000_4000).unwrap(), 0x1_0000_3f00);
    assert_eq!(m.slide_pointer_at(0x1_0000_4008).unwrap(), 0x1_0000_0f00);
    assert_eq!(m.convert_to_vm_addr(0), 0);
}

#[test]
fn test_unfixed_pointers_pass_through() {
    let m = MachO::from_bytes(fixtures::executable()).unwrap();
    assert!(m.chained_fixups().unwrap().is_none());
    assert_eq!(m.convert_to_vm_addr(0x1_0000_3f00), 0x1_0000_3f00);
}

/// Places the image at 0x10000 inside a larger buffer.
struct Embedded;

impl AddressTranslator for Embedded {
    fn to_offset(&self, addr: u64) -> Result<u64> {
        Ok(addr - fixtures::CACHE_TEXT_VMADDR + 0x10000)
    }
    fn to_address(&self, offset: u64) -> Result<u64> {
        Ok(offset - 0x10000 + fixtures::CACHE_TEXT_VMADDR)
    }
}

#[test]
fn test_translator_addresses() {
    let image = fixtures::cache_dylib();
    let mut container = vec![0u8; 0x10000];
    container.extend_from_slice(&image);

    let config = ParseConfig::default()
        .with_cache(MemorySource::new(container).into_source())
        .with_translator(Arc::new(Embedded));
    let source = MemorySource::new(image[..0x1000].to_vec()).into_source();
    // Load-command offsets here are image-relative, so skip the tables.
    let mut config = config;
    config.settings.exclude_commands = vec![
        machokit::formats::macho::types::lc::SYMTAB,
        machokit::formats::macho::types::lc::DYSYMTAB,
    ];
    let m = MachO::with_config(source, config).unwrap();

    assert_eq!(m.get_offset(0x1_8000_8000).unwrap(), 0x18000);
    assert_eq!(m.get_vm_address(0x18000).unwrap(), 0x1_8000_8000);
    assert_eq!(m.get_cstring(0x1_8000_8000).unwrap(), "cached data");
}

#[test]
fn test_tables_come_from_cache_reader() {
    let image = fixtures::cache_dylib();
    let config = ParseConfig::default().with_cache(MemorySource::new(image.clone()).into_source());
    // The image source holds only the header and load commands.
    let source = MemorySource::new(image[..0x1000].to_vec()).into_source();
    let m = MachO::with_config(source, config).unwrap();

    assert!(m.is_cache_resident());
    assert_eq!(m.symbols().len(), 3);
    assert_eq!(m.symbols()[1].name, "_exported");
    assert_eq!(m.get_cstring(0x1_8000_8000).unwrap(), "cached data");
    assert_eq!(m.find_symbol_address("_reexp").unwrap(), 0);
}

#[test]
fn test_chained_fixups_import_count_past_blob() {
    let mut image = fixtures::chained_executable();
    let blob = MachO::from_bytes(image.clone())
        .unwrap()
        .linkedit_data(machokit::formats::macho::types::lc::DYLD_CHAINED_FIXUPS)
        .unwrap()
        .offset as usize;
    // dyld_chained_fixups_header.imports_count
    image[blob + 16..blob + 20].copy_from_slice(&u32::MAX.to_le_bytes());

    let m = MachO::from_bytes(image).unwrap();
    let err = m.chained_fixups().unwrap_err();
    assert!(matches!(err, machokit::MachOError::Truncated { .. }));
}
