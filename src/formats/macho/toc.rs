//! File table of contents: header, ordered load commands and sections
//!
//! The TOC owns the section list; segments index into it. Commands are added
//! and removed only through [`FileToc::add_load`] and
//! [`FileToc::remove_load`], which keep `ncmds` and `sizeofcmds` in step.

use crate::error::{MachOError, Result};
use crate::formats::macho::commands::{Command, Ctx, LoadCommand};
use crate::formats::macho::headers::write_header;
use crate::formats::macho::segments::{Section, Segment};
use crate::formats::macho::types::FileHeader;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileToc {
    pub header: FileHeader,
    pub loads: Vec<LoadCommand>,
    pub sections: Vec<Section>,
}

impl FileToc {
    /// A TOC with no commands; header counters are reset.
    pub fn new(mut header: FileHeader) -> Self {
        header.ncmds = 0;
        header.sizeofcmds = 0;
        Self {
            header,
            loads: Vec::new(),
            sections: Vec::new(),
        }
    }

    pub fn ctx(&self) -> Ctx {
        Ctx::new(self.header.endian, self.header.word_size)
    }

    /// Append a command and account for it in the header.
    pub fn add_load(&mut self, load: LoadCommand) {
        let size = load.size(self.ctx());
        trace!(cmd = load.name(), size, "Adding load command");
        self.header.ncmds += 1;
        self.header.sizeofcmds += size;
        self.loads.push(load);
    }

    /// Append a segment command together with its sections.
    pub fn add_segment(&mut self, mut segment: Segment, sections: Vec<Section>) {
        segment.first_section = self.sections.len();
        segment.nsects = sections.len() as u32;
        self.sections.extend(sections);
        let ctx = self.ctx();
        let load = LoadCommand::new(Segment::command_kind(ctx), Command::Segment(segment), ctx);
        self.add_load(load);
    }

    /// Remove the command at `index`. A removed segment takes its sections
    /// with it and later segments are re-indexed.
    pub fn remove_load(&mut self, index: usize) -> Result<LoadCommand> {
        if index >= self.loads.len() {
            return Err(MachOError::not_found("load command", format!("#{index}")));
        }
        let ctx = self.ctx();
        let load = self.loads.remove(index);
        self.header.ncmds = self.header.ncmds.saturating_sub(1);
        self.header.sizeofcmds = self.header.sizeofcmds.saturating_sub(load.size(ctx));

        if let Command::Segment(seg) = &load.body {
            let start = seg.first_section;
            let count = seg.nsects as usize;
            if start + count <= self.sections.len() {
                self.sections.drain(start..start + count);
                for other in &mut self.loads {
                    if let Command::Segment(s) = &mut other.body {
                        if s.first_section > start {
                            s.first_section -= count;
                        }
                    }
                }
            }
        }
        Ok(load)
    }

    /// Total on-disk size of the load commands as they would be written.
    pub fn load_size(&self) -> u64 {
        let ctx = self.ctx();
        self.loads.iter().map(|l| u64::from(l.size(ctx))).sum()
    }

    /// Header plus load-command bytes.
    pub fn header_and_load_size(&self) -> u64 {
        self.header.size() as u64 + self.load_size()
    }

    /// File offset at which load command `index` starts.
    pub fn load_offset(&self, index: usize) -> u64 {
        let ctx = self.ctx();
        self.header.size() as u64
            + self.loads[..index.min(self.loads.len())]
                .iter()
                .map(|l| u64::from(l.size(ctx)))
                .sum::<u64>()
    }

    /// Recompute the header counters from the command list.
    pub fn sync_header(&mut self) {
        self.header.ncmds = self.loads.len() as u32;
        self.header.sizeofcmds = self.load_size() as u32;
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.loads.iter().filter_map(LoadCommand::as_segment)
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments().find(|s| s.name == name)
    }

    pub fn sections_of(&self, segment: &Segment) -> &[Section] {
        segment.sections_in(&self.sections).unwrap_or(&[])
    }

    pub fn section(&self, segname: &str, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.segname == segname && s.name == name)
    }

    /// First command with the given tag.
    pub fn find_load(&self, cmd: u32) -> Option<(usize, &LoadCommand)> {
        self.loads.iter().enumerate().find(|(_, l)| l.cmd == cmd)
    }

    /// Encode the header and every load command.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let ctx = self.ctx();
        let mut out = Vec::with_capacity(self.header_and_load_size() as usize);
        write_header(&self.header, &mut out);
        for load in &self.loads {
            load.write(&mut out, ctx, &self.sections)?;
        }
        Ok(out)
    }
}
