use machokit::logging::LogLevel;
use machokit::MachoConfig;

#[test]
fn test_defaults() {
    let config = MachoConfig::default();
    assert_eq!(config.export.segment_alignment, 0x1000);
    assert_eq!(config.export.linkedit_file_alignment, 0x4000);
    assert_eq!(config.export.linkedit_vm_alignment, 0x8000);
    assert_eq!(config.export.redacted_symbol, "<redacted>");
    assert_eq!(config.signing.signature_alignment, 16);
    assert_eq!(config.signing.page_size, 4096);
    assert!(config.parse.relocations);
}

#[test]
fn test_json_round_trip() {
    let mut config = MachoConfig::default();
    config.export.skip_reexported_dylib_symbols = true;
    config.log_level = LogLevel::Debug;
    let json = config.to_json().unwrap();
    assert_eq!(MachoConfig::from_json(&json).unwrap(), config);
}

#[test]
fn test_partial_json() {
    let config = MachoConfig::from_json(r#"{"export": {"segment_alignment": 16384}}"#).unwrap();
    assert_eq!(config.export.segment_alignment, 0x4000);
    assert_eq!(config.export.linkedit_file_alignment, 0x4000);
    assert!(MachoConfig::from_json("{not json").is_err());
}
