#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(m) = machokit::MachO::from_bytes(data.to_vec()) {
        let _ = m.export_bytes(&machokit::ExportOptions::default());
    }
});
