//! Configuration for parsing, export and signing.
//!
//! Provides centralized configuration with sensible defaults. Every struct
//! round-trips through JSON so tools can persist or override settings.

use crate::error::{MachOError, Result};
use crate::io::IOLimits;
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};

/// Master configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachoConfig {
    /// I/O limits for file-backed sources.
    pub io: IOLimits,
    /// Parser behaviour.
    pub parse: ParseSettings,
    /// Export/relink layout.
    pub export: ExportSettings,
    /// Code-signature placement.
    pub signing: SigningSettings,
    /// Default log level for `logging::init_tracing_with_level`.
    pub log_level: LogLevel,
}

impl MachoConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| MachOError::Unsupported(format!("invalid configuration: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| MachOError::Unsupported(format!("unserializable configuration: {e}")))
    }
}

/// Parser configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseSettings {
    /// When non-empty, only these load-command tags are decoded.
    pub include_commands: Vec<u32>,
    /// Load-command tags that are skipped entirely.
    pub exclude_commands: Vec<u32>,
    /// Decode section relocation entries (default: true).
    pub relocations: bool,
}

impl Default for ParseSettings {
    fn default() -> Self {
        Self {
            include_commands: Vec::new(),
            exclude_commands: Vec::new(),
            relocations: true,
        }
    }
}

/// Export/relink configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// File alignment of exported segments (default: 0x1000).
    pub segment_alignment: u64,
    /// File-size alignment of a rebuilt `__LINKEDIT` (default: 0x4000).
    pub linkedit_file_alignment: u64,
    /// VM-size alignment of a rebuilt `__LINKEDIT` (default: 0x8000).
    pub linkedit_vm_alignment: u64,
    /// Symbol name stripped from rebuilt symbol tables (default: "<redacted>").
    pub redacted_symbol: String,
    /// Drop exports sourced from re-exported dylibs when synthesizing
    /// indirect symbols (default: false).
    pub skip_reexported_dylib_symbols: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            segment_alignment: 0x1000,
            linkedit_file_alignment: 0x4000,
            linkedit_vm_alignment: 0x8000,
            redacted_symbol: "<redacted>".to_string(),
            skip_reexported_dylib_symbols: false,
        }
    }
}

/// Code-signature placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSettings {
    /// Alignment of a newly placed signature (default: 16).
    pub signature_alignment: u64,
    /// Code page size used to estimate signature space (default: 4096).
    pub page_size: u64,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            signature_alignment: 16,
            page_size: 4096,
        }
    }
}
