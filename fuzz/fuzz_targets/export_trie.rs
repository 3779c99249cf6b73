#![no_main]
use libfuzzer_sys::fuzz_target;
use machokit::formats::macho::trie;

fuzz_target!(|data: &[u8]| {
    let _ = trie::parse_trie(data, 0x1_0000_0000);
    let _ = trie::lookup(data, "_main", 0x1_0000_0000);
});
