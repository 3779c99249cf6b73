use crate::common::fixtures;
use machokit::formats::macho::fat::is_fat;
use machokit::formats::macho::types::{CPU_TYPE_ARM64, CPU_TYPE_X86_64};
use machokit::{FatFile, MemorySource, ParseConfig};

#[test]
fn test_open_each_slice() {
    let data = fixtures::fat(&[
        (CPU_TYPE_X86_64, fixtures::executable()),
        (CPU_TYPE_ARM64, fixtures::chained_executable()),
    ]);
    let source = MemorySource::new(data).into_source();
    assert!(is_fat(&*source));

    let fat = FatFile::parse(source).unwrap();
    assert_eq!(fat.arches.len(), 2);
    assert_eq!(fat.arches[0].offset, 0x1000);
    assert_eq!(fat.arches[1].offset % 0x1000, 0);

    let x86 = fat.open_cpu(CPU_TYPE_X86_64, ParseConfig::default()).unwrap();
    assert_eq!(x86.find_symbol_address("_main").unwrap(), 0x1_0000_0f00);
    assert_eq!(x86.get_vm_address(0xf00).unwrap(), 0x1_0000_0f00);

    let arm = fat.open(1, ParseConfig::default()).unwrap();
    assert_eq!(arm.slide_pointer_at(0x1_0000_4008).unwrap(), 0x1_0000_0f00);
}

#[test]
fn test_thin_image_is_not_fat() {
    let source = MemorySource::new(fixtures::executable()).into_source();
    assert!(!is_fat(&*source));
    assert!(FatFile::parse(source).is_err());
}
