//! Mach-O parsing, relinking and re-emission.
//!
//! [`MachO`] parses an image from any [`io::ByteSource`], exposes its load
//! commands, symbols, exports and chained fixups, translates between virtual
//! addresses and file offsets, and writes standalone copies of images that
//! were extracted from a shared cache.

/// Per-address memoization shared across threads
pub mod cache;
/// Library configuration
pub mod config;
/// Error types
pub mod error;
/// Binary container formats
pub mod formats;
/// Bounded byte sources
pub mod io;
/// Tracing setup and helpers
pub mod logging;

pub use config::{ExportSettings, MachoConfig, ParseSettings, SigningSettings};
pub use error::{MachOError, Result};
pub use formats::macho::codesign::{SignedImage, Signer, SigningConfig, SpecialSlot};
pub use formats::macho::export::{DependencyIndex, ExportOptions, ExportReport, SegmentMap};
pub use formats::macho::fat::FatFile;
pub use formats::macho::{AddressTranslator, FileToc, MachO, ParseConfig};
pub use io::{ByteSource, MemorySource, SafeReader};
