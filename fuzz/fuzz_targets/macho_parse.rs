#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(m) = machokit::MachO::from_bytes(data.to_vec()) else {
        return;
    };
    let _ = m.dyld_exports();
    let _ = m.chained_fixups();
    let _ = m.rebases();
    let _ = m.binds();
    let _ = m.function_starts();
    let _ = m.to_bytes();
});
