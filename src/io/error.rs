//! Errors raised by byte sources.
//!
//! These surface through [`crate::MachOError::Reader`] once a parse or
//! export is under way.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    /// The file is larger than `IOLimits::max_file_size`.
    #[error("image of {found} bytes is larger than the {limit} byte limit")]
    FileTooLarge { limit: u64, found: u64 },

    /// Cumulative reads from one `SafeReader` passed `IOLimits::max_read_bytes`.
    #[error("read budget of {limit} bytes exhausted ({current} bytes already read)")]
    ReadLimitExceeded { limit: u64, current: u64 },

    #[error("read of {len} bytes at {offset:#x} runs past the end of a {size} byte source")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("i/o error: {0}")]
    StdIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IoError>;
