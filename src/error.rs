//! Error types for machokit.
//!
//! A single `thiserror` enum covers parse-time structural violations,
//! export-time remap and capacity failures, recoverable lookup misses, and
//! I/O failures from byte sources and sinks.

use crate::io::error::IoError;
use thiserror::Error;

/// Main error type for Mach-O operations.
#[derive(Debug, Error)]
pub enum MachOError {
    /// Structural violation found while parsing.
    #[error("format error at offset {offset:#x}: {message}{}", fmt_value(.value))]
    Format {
        offset: u64,
        message: String,
        value: Option<u64>,
    },

    /// A blob ended before a field could be read.
    #[error("truncated at {offset:#x}, needed {needed} bytes")]
    Truncated { offset: usize, needed: usize },

    /// An export-time file offset not covered by any segment.
    #[error("offset {offset:#x} is not covered by any segment")]
    Remap { offset: u64 },

    /// Rebuilt data does not fit the space reserved for it.
    #[error("reserved {reserved:#x} bytes but {written:#x} were written")]
    Capacity { reserved: u64, written: u64 },

    /// Lookup miss for a named or addressed item.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// String data that is not valid UTF-8.
    #[error("string not UTF-8 at offset {offset:#x}")]
    InvalidString { offset: usize },

    /// Well-formed input using an encoding this crate does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("reader error: {0}")]
    Reader(#[from] IoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by an external code signer.
    #[error("signer failed: {0}")]
    Signer(anyhow::Error),
}

fn fmt_value(value: &Option<u64>) -> String {
    match value {
        Some(v) => format!(" (value {v:#x})"),
        None => String::new(),
    }
}

impl MachOError {
    pub fn format(offset: u64, message: impl Into<String>) -> Self {
        MachOError::Format {
            offset,
            message: message.into(),
            value: None,
        }
    }

    pub fn format_value(offset: u64, message: impl Into<String>, value: u64) -> Self {
        MachOError::Format {
            offset,
            message: message.into(),
            value: Some(value),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        MachOError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Lookup misses are the expected outcome of optional-metadata probes.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MachOError::NotFound { .. })
    }
}

/// Result type alias for Mach-O operations
pub type Result<T> = std::result::Result<T, MachOError>;
