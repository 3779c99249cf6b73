//! Mach-O image parsing
//!
//! The header and load-command blob always come from the image source. Data
//! that load commands point at (symbol tables, relocations, LINKEDIT blobs,
//! chain pages) is read through the cache reader, which is the image source
//! itself unless the image is resident in a larger container.

use crate::config::ParseSettings;
use crate::error::{MachOError, Result};
use crate::formats::macho::commands::{Command, Ctx, LoadCommand};
use crate::formats::macho::converter::AddressTranslator;
use crate::formats::macho::headers::parse_header;
use crate::formats::macho::segments::Segment;
use crate::formats::macho::symbols::{Dysymtab, Symtab};
use crate::formats::macho::toc::FileToc;
use crate::formats::macho::types::{lc, FileHeader};
use crate::formats::macho::utils::EndianRead;
use crate::io::ByteSource;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// How an image is parsed and where its referenced data lives.
#[derive(Clone, Default)]
pub struct ParseConfig {
    pub settings: ParseSettings,
    /// Reader for offsets named by load commands; defaults to the image source.
    pub cache: Option<Arc<dyn ByteSource>>,
    /// Address mapping used instead of the image's own segments.
    pub translator: Option<Arc<dyn AddressTranslator>>,
}

impl ParseConfig {
    pub fn with_settings(settings: ParseSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ByteSource>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn AddressTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }
}

impl fmt::Debug for ParseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseConfig")
            .field("settings", &self.settings)
            .field("cache", &self.cache.is_some())
            .field("translator", &self.translator.is_some())
            .finish()
    }
}

impl ParseSettings {
    /// Whether a load command with this tag is decoded.
    pub fn accepts(&self, cmd: u32) -> bool {
        if self.exclude_commands.contains(&cmd) {
            return false;
        }
        self.include_commands.is_empty() || self.include_commands.contains(&cmd)
    }
}

/// Read and validate the fixed header.
pub(crate) fn read_header(source: &dyn ByteSource) -> Result<FileHeader> {
    // 32 bytes covers both header sizes.
    let head = source.read_at(0, 32)?;
    if head.len() < 4 {
        return Err(MachOError::format_value(
            0,
            "file too small for a Mach-O header",
            head.len() as u64,
        ));
    }
    parse_header(&head)
}

/// Decode the load commands of an image into a table of contents.
pub(crate) fn parse_toc(
    source: &dyn ByteSource,
    cache: &dyn ByteSource,
    settings: &ParseSettings,
) -> Result<FileToc> {
    let header = read_header(source)?;
    let header_size = header.size() as u64;
    let blob = source
        .read_exact_at(header_size, u64::from(header.sizeofcmds))
        .map_err(|_| {
            MachOError::format_value(
                header_size,
                "load commands extend past the end of the file",
                u64::from(header.sizeofcmds),
            )
        })?;

    let ctx = Ctx::new(header.endian, header.word_size);
    let e = header.endian;
    let mut toc = FileToc::new(header);
    let mut nsyms = None;
    let mut off = 0usize;

    debug!(
        filetype = %header.filetype,
        cpu = header.cpu_name(),
        ncmds = header.ncmds,
        sizeofcmds = header.sizeofcmds,
        "Parsing Mach-O load commands"
    );

    for index in 0..header.ncmds {
        let cmd_offset = header_size + off as u64;
        let remaining = blob.len() - off;
        if remaining < 8 {
            return Err(MachOError::format_value(
                cmd_offset,
                format!("load command {index} header truncated"),
                remaining as u64,
            ));
        }
        let cmd = blob.read_u32(off, e)?;
        let size = blob.read_u32(off + 4, e)? as usize;
        if size < 8 || size > remaining {
            return Err(MachOError::format_value(
                cmd_offset,
                format!("invalid {} command size", lc::name(cmd)),
                size as u64,
            ));
        }
        let raw = &blob[off..off + size];
        off += size;

        if !settings.accepts(cmd) {
            trace!(cmd = lc::name(cmd), cmd_offset, "Skipping filtered load command");
            continue;
        }

        let body = match cmd {
            lc::SEGMENT | lc::SEGMENT_64 => {
                let seg_ctx = ctx.for_command(cmd);
                let (segment, sections) = Segment::parse(raw, seg_ctx, cmd_offset, toc.sections.len())?;
                if settings.relocations {
                    for section in sections.iter().filter(|s| s.nreloc > 0) {
                        section.relocations(cache, seg_ctx)?;
                    }
                }
                trace!(
                    segment = %segment.name,
                    nsects = sections.len(),
                    "Parsed segment"
                );
                toc.sections.extend(sections);
                Command::Segment(segment)
            }
            lc::SYMTAB => {
                let symtab = Symtab::parse(raw, ctx, cmd_offset, cache)?;
                nsyms = Some(symtab.symbols.len());
                Command::Symtab(symtab)
            }
            lc::DYSYMTAB => Command::Dysymtab(Dysymtab::parse(raw, ctx, cmd_offset, nsyms, cache)?),
            _ => Command::parse(cmd, raw, ctx, cmd_offset)?,
        };

        toc.add_load(LoadCommand {
            cmd,
            cmdsize: size as u32,
            body,
        });
    }

    // Filtered commands leave the declared counters untouched.
    toc.header.ncmds = header.ncmds;
    toc.header.sizeofcmds = header.sizeofcmds;

    debug!(
        loads = toc.loads.len(),
        sections = toc.sections.len(),
        "Parsed load commands"
    );
    Ok(toc)
}
