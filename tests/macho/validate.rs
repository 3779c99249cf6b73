//! Cross-checks exported and signed images with an independent parser.

use crate::common::fixtures;
use machokit::formats::macho::Symbol;
use machokit::{ExportOptions, MachO, Signer, SigningConfig};
use object::{Architecture, BinaryFormat, Object, ObjectSection, ObjectSegment, ObjectSymbol};

fn segment_names(file: &object::File<'_>) -> Vec<String> {
    file.segments()
        .filter_map(|s| s.name().ok().flatten().map(str::to_string))
        .collect()
}

#[test]
fn test_exported_executable_parses() {
    let m = MachO::from_bytes(fixtures::executable()).unwrap();
    let (out, _) = m.export_bytes(&ExportOptions::default()).unwrap();

    let file = object::File::parse(&*out).unwrap();
    assert_eq!(file.format(), BinaryFormat::MachO);
    assert_eq!(file.architecture(), Architecture::X86_64);
    assert!(file.is_64() && file.is_little_endian());
    assert_eq!(segment_names(&file), ["__PAGEZERO", "__TEXT", "__LINKEDIT"]);

    let text = file.section_by_name("__text").unwrap();
    assert_eq!(text.address(), 0x1_0000_0f00);
    assert_eq!(text.data().unwrap(), &[0x90u8; 0x20][..]);
    let names: Vec<_> = file.symbols().filter_map(|s| s.name().ok()).collect();
    assert!(names.contains(&"_main"));
}

#[test]
fn test_exported_cache_dylib_parses() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    let options = ExportOptions {
        locals: vec![Symbol::new("_injected", 0x0e, 1, 0, 0x1_8000_1040)],
        ..ExportOptions::default()
    };
    let (out, _) = m.export_bytes(&options).unwrap();

    let file = object::File::parse(&*out).unwrap();
    assert_eq!(file.architecture(), Architecture::Aarch64);
    assert_eq!(segment_names(&file), ["__TEXT", "__DATA", "__LINKEDIT"]);
    let data = file.section_by_name("__data").unwrap();
    assert_eq!(&data.data().unwrap()[..11], b"cached data");
    let names: Vec<_> = file.symbols().filter_map(|s| s.name().ok()).collect();
    assert!(names.contains(&"_injected"));
    assert!(names.contains(&"_exported"));
}

struct Zeros;

impl Signer for Zeros {
    fn sign(&self, _code: &dyn machokit::ByteSource, _config: &SigningConfig) -> anyhow::Result<Vec<u8>> {
        Ok(vec![0; 64])
    }
}

#[test]
fn test_signed_executable_parses() {
    let m = MachO::from_bytes(fixtures::executable()).unwrap();
    let signed = m.code_sign(&SigningConfig::new("id"), &Zeros).unwrap();
    let file = object::File::parse(signed.as_bytes()).unwrap();
    assert_eq!(file.format(), BinaryFormat::MachO);
    let linkedit = file
        .segments()
        .find(|s| s.name().ok().flatten() == Some("__LINKEDIT"))
        .unwrap();
    assert_eq!(linkedit.file_range(), (0x4000, 0x4000));
}
