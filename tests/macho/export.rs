use crate::common::fixtures;
use machokit::formats::macho::types::{lc, INDIRECT_SYMBOL_LOCAL};
use machokit::formats::macho::Symbol;
use machokit::{ExportOptions, ExportSettings, MachO, MachOError};

/// Name each indirect entry resolves to; markers resolve to `None`.
fn indirect_names(m: &MachO) -> Vec<Option<String>> {
    m.dysymtab()
        .unwrap()
        .indirect_symbols
        .iter()
        .map(|&i| m.symbols().get(i as usize).map(|s| s.name.clone()))
        .collect()
}

fn injected_locals() -> Vec<Symbol> {
    vec![
        Symbol::new("_injected_a", 0x0e, 1, 0, 0x1_8000_1040),
        Symbol::new("_injected_b", 0x0e, 1, 0, 0x1_8000_1080),
        // Already present; not injected again.
        Symbol::new("_local_fn", 0x0e, 1, 0, 0x1_8000_1000),
    ]
}

#[test]
fn test_export_executable_moves_linkedit() {
    let m = MachO::from_bytes(fixtures::executable()).unwrap();
    let mut out = Vec::new();
    let report = m.export(&mut out, &ExportOptions::default()).unwrap();

    assert!(report.linkedit.is_none());
    assert_eq!(report.dependencies.count, 1);
    assert_eq!(report.bytes_written as usize, out.len());
    assert_eq!(out.len(), 0x2000);

    let e = MachO::from_bytes(out).unwrap();
    let linkedit = e.segment("__LINKEDIT").unwrap();
    assert_eq!(linkedit.fileoff, 0x1000);
    assert_eq!(e.symtab().unwrap().symoff, 0x1000);
    assert_eq!(e.dysymtab().unwrap().indirectsymoff, 0x1060);
    assert_eq!(e.linkedit_data(lc::FUNCTION_STARTS).unwrap().offset, 0x1080);

    assert_eq!(e.symbols(), m.symbols());
    assert_eq!(e.function_starts().unwrap(), m.function_starts().unwrap());
    assert_eq!(e.entry_point().unwrap().entry_offset, 0xf00);
    assert_eq!(
        e.section_data("__TEXT", "__text").unwrap(),
        m.section_data("__TEXT", "__text").unwrap()
    );
}

#[test]
fn test_segment_offsets_monotonic() {
    for image in [fixtures::executable(), fixtures::cache_dylib(), fixtures::chained_executable()] {
        let m = MachO::from_bytes(image).unwrap();
        let (_, report) = m.export_bytes(&ExportOptions::default()).unwrap();
        let mut prev_end = 0;
        for entry in &report.segment_map.entries {
            assert_eq!(entry.new_start % 0x1000, 0);
            assert!(entry.new_start >= prev_end);
            prev_end = entry.new_end;
        }
    }
}

#[test]
fn test_export_cache_dylib() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    let orig_nsyms = m.symbols().len() as u32;
    let options = ExportOptions {
        locals: injected_locals(),
        ..ExportOptions::default()
    };
    let mut out = Vec::new();
    let report = m.export(&mut out, &options).unwrap();

    assert_eq!(report.dependencies.count, 2);
    assert_eq!(report.dependencies.reexport_ordinals, vec![2]);
    let linkedit = report.linkedit.clone().unwrap();
    assert_eq!(linkedit.injected_locals, 2);
    assert_eq!(linkedit.indirect_shift, 2);
    // Two injected locals, every original symbol and one re-export.
    assert_eq!(linkedit.nsyms, 2 + orig_nsyms + 1);
    assert!(linkedit.reserved >= linkedit.written);

    let e = MachO::from_bytes(out).unwrap();
    assert!(!e.is_cache_resident());

    let seg = e.segment("__LINKEDIT").unwrap();
    assert_eq!(seg.fileoff, 0x5000);
    assert_eq!(seg.filesize % 0x4000, 0);
    assert!(seg.filesize >= linkedit.written);
    assert_eq!(seg.vmsize % 0x8000, 0);
    assert_eq!(e.segment("__DATA").unwrap().fileoff, 0x4000);
    assert_eq!(e.section("__DATA", "__data").unwrap().offset, 0x4000);
    assert_eq!(e.get_cstring(0x1_8000_8000).unwrap(), "cached data");

    let names: Vec<_> = e.symbols().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        ["_injected_a", "_injected_b", "_local_fn", "_exported", "_other", "_reexp"]
    );
    let reexp = e.symbol_by_name("_reexp").unwrap();
    assert_eq!(reexp.n_type, 0x0b);

    let d = e.dysymtab().unwrap();
    assert_eq!(d.indirect_symbols, vec![3, INDIRECT_SYMBOL_LOCAL, 4]);
    assert_eq!(d.nlocalsym, 3);
    assert_eq!(d.iextdefsym, 3);

    // LINKEDIT blobs were carried into the new segment.
    assert_eq!(e.function_starts().unwrap(), m.function_starts().unwrap());
    assert_eq!(e.dyld_exports().unwrap(), m.dyld_exports().unwrap());
    let trie = e.linkedit_data(lc::DYLD_EXPORTS_TRIE).unwrap();
    assert_eq!(u64::from(trie.offset), seg.fileoff);
}

#[test]
fn test_export_without_locals_keeps_indices() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    let (out, report) = m.export_bytes(&ExportOptions::default()).unwrap();
    assert_eq!(report.linkedit.unwrap().indirect_shift, 0);
    let e = MachO::from_bytes(out).unwrap();
    assert_eq!(e.dysymtab().unwrap().indirect_symbols, vec![1, INDIRECT_SYMBOL_LOCAL, 2]);
}

#[test]
fn test_export_drops_redacted_and_reexported() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    let options = ExportOptions {
        settings: ExportSettings {
            redacted_symbol: "_other".to_string(),
            skip_reexported_dylib_symbols: true,
            ..ExportSettings::default()
        },
        ..ExportOptions::default()
    };
    let (out, _) = m.export_bytes(&options).unwrap();
    let e = MachO::from_bytes(out).unwrap();
    let names: Vec<_> = e.symbols().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["_local_fn", "_exported"]);
}

#[test]
fn test_export_reports_fixups() {
    let m = MachO::from_bytes(fixtures::chained_executable()).unwrap();
    let dcf = m.chained_fixups().unwrap().unwrap();
    let options = ExportOptions {
        chained_fixups: Some(dcf),
        base_address: 0x2_0000_0000,
        ..ExportOptions::default()
    };
    let (out, report) = m.export_bytes(&options).unwrap();
    assert_eq!(report.fixups.len(), 2);
    assert_eq!(report.fixups[0].new_offset, 0x4000);
    assert_eq!(report.fixups[0].target, Some(0x2_0000_3f00));
    assert_eq!(report.fixups[1].new_offset, 0x4008);
    assert_eq!(report.fixups[1].target, None);

    // Fixup chains are carried, not rewritten.
    let e = MachO::from_bytes(out).unwrap();
    assert_eq!(e.slide_pointer_at(0x1_0000_4000).unwrap(), 0x1_0000_3f00);
}

#[test]
fn test_export_unmappable_offset() {
    let mut image = fixtures::executable();
    // Point LC_MAIN past every segment: cmd offset of LC_MAIN is after
    // three segments, symtab, dysymtab and uuid.
    let main_at = 32 + 72 + 152 + 72 + 24 + 80 + 24;
    assert_eq!(u32::from_le_bytes(image[main_at..main_at + 4].try_into().unwrap()), lc::MAIN);
    image[main_at + 8..main_at + 16].copy_from_slice(&0x9000u64.to_le_bytes());
    let m = MachO::from_bytes(image).unwrap();
    let err = m.export(&mut Vec::new(), &ExportOptions::default()).unwrap_err();
    assert!(matches!(err, MachOError::Remap { offset: 0x9000 }));
}

#[test]
fn test_export_to_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/out/libcached.dylib");
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    let report = m.export_to_path(&path, &ExportOptions::default()).unwrap();
    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len() as u64, report.bytes_written);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[test]
fn test_redacted_local_keeps_indirect_names() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    let before = indirect_names(&m);
    assert_eq!(
        before,
        [Some("_exported".to_string()), None, Some("_other".to_string())]
    );

    let redact = |locals: Vec<Symbol>| ExportOptions {
        locals,
        settings: ExportSettings {
            redacted_symbol: "_local_fn".to_string(),
            ..ExportSettings::default()
        },
        ..ExportOptions::default()
    };
    // Dropped local alone, then replaced by one injected local.
    for locals in [vec![], vec![Symbol::new("_injected", 0x0e, 1, 0, 0x1_8000_1040)]] {
        let injected = locals.len() as u32;
        let (out, _) = m.export_bytes(&redact(locals)).unwrap();
        let e = MachO::from_bytes(out).unwrap();
        assert_eq!(indirect_names(&e), before);
        let d = e.dysymtab().unwrap();
        assert_eq!(d.indirect_symbols, vec![injected, INDIRECT_SYMBOL_LOCAL, injected + 1]);
        assert_eq!(d.nlocalsym, injected);
        assert_eq!(d.iextdefsym, injected);
    }
}

#[test]
fn test_indirect_names_survive_injection() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    let options = ExportOptions {
        locals: injected_locals(),
        ..ExportOptions::default()
    };
    let (out, _) = m.export_bytes(&options).unwrap();
    let e = MachO::from_bytes(out).unwrap();
    assert_eq!(indirect_names(&e), indirect_names(&m));
}

#[test]
fn test_linkedit_over_capacity() {
    let m = MachO::from_bytes(fixtures::cache_dylib()).unwrap();
    let reserved = m.segment("__LINKEDIT").unwrap().filesize;
    let options = ExportOptions {
        locals: (0..1000u64)
            .map(|i| Symbol::new(format!("_filler_{i}"), 0x0e, 1, 0, 0x1_8000_1000 + i * 4))
            .collect(),
        ..ExportOptions::default()
    };
    let err = m.export_bytes(&options).unwrap_err();
    match err {
        MachOError::Capacity { reserved: r, written } => {
            assert_eq!(r, reserved);
            assert!(written > reserved);
        }
        other => panic!("unexpected error: {other}"),
    }
}
