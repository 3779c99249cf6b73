//! Address and offset conversion
//!
//! Virtual addresses map to file offsets through the image's own segments,
//! or through an [`AddressTranslator`] when the image lives inside a larger
//! container whose mapping the segments alone cannot express. Pointer values
//! read from chained-fixup images are converted back to plain virtual
//! addresses with [`MachO::convert_to_vm_addr`].

use crate::error::{MachOError, Result};
use crate::formats::macho::fixups::{PointerFormat, BIND_SPECIAL_DYLIB_SELF};
use crate::formats::macho::utils::read_word;
use crate::formats::macho::MachO;
use bytes::Bytes;
use memchr::memchr;
use tracing::{debug, trace};

/// Address mapping supplied by a container such as a shared cache.
pub trait AddressTranslator: Send + Sync {
    fn to_offset(&self, addr: u64) -> Result<u64>;
    fn to_address(&self, offset: u64) -> Result<u64>;
}

const CSTRING_CHUNK: u64 = 256;

impl MachO {
    /// File offset of a virtual address.
    pub fn get_offset(&self, addr: u64) -> Result<u64> {
        if let Some(t) = &self.translator {
            return t.to_offset(addr);
        }
        self.toc
            .segments()
            .find(|s| s.vmaddr <= addr && addr < s.vmaddr.saturating_add(s.vmsize))
            .map(|s| addr - s.vmaddr + s.fileoff)
            .ok_or_else(|| MachOError::not_found("address", format!("{addr:#x}")))
    }

    /// Virtual address of a file offset.
    pub fn get_vm_address(&self, offset: u64) -> Result<u64> {
        if let Some(t) = &self.translator {
            return t.to_address(offset);
        }
        self.toc
            .segments()
            .find(|s| s.fileoff <= offset && offset < s.fileoff.saturating_add(s.filesize))
            .map(|s| offset - s.fileoff + s.vmaddr)
            .ok_or_else(|| MachOError::not_found("file offset", format!("{offset:#x}")))
    }

    /// Read `len` bytes mapped at `addr`.
    pub fn read_at_addr(&self, addr: u64, len: u64) -> Result<Bytes> {
        let offset = self.get_offset(addr)?;
        Ok(self.cache.read_exact_at(offset, len)?)
    }

    /// Read one pointer-sized value at `addr`.
    pub fn get_pointer_at_address(&self, addr: u64) -> Result<u64> {
        let header = &self.toc.header;
        let data = self.read_at_addr(addr, header.pointer_size())?;
        read_word(&data, 0, header.is_64(), header.endian)
    }

    /// NUL-terminated string mapped at `addr`. Results are memoized per address.
    pub fn get_cstring(&self, addr: u64) -> Result<String> {
        let s = self
            .strings
            .get_or_try_insert_with(addr, || self.read_cstring_at(addr))?;
        Ok(s.as_ref().clone())
    }

    fn read_cstring_at(&self, addr: u64) -> Result<String> {
        let start = self.get_offset(addr)?;
        let mut offset = start;
        let mut bytes = Vec::new();
        loop {
            let chunk = self.cache.read_at(offset, CSTRING_CHUNK)?;
            if chunk.is_empty() {
                return Err(MachOError::Truncated {
                    offset: start as usize,
                    needed: bytes.len() + 1,
                });
            }
            if let Some(end) = memchr(0, &chunk) {
                bytes.extend_from_slice(&chunk[..end]);
                break;
            }
            bytes.extend_from_slice(&chunk);
            offset += chunk.len() as u64;
        }
        trace!(addr, len = bytes.len(), "Read C string");
        String::from_utf8(bytes).map_err(|_| MachOError::InvalidString {
            offset: start as usize,
        })
    }

    /// `__TEXT` base address the image was linked at, or 0.
    pub fn preferred_load_address(&self) -> u64 {
        self.toc.segment("__TEXT").map_or(0, |s| s.vmaddr)
    }

    /// Turn a raw pointer value read from the image into a virtual address.
    ///
    /// Without chained fixups the value is returned unchanged. Rebase
    /// pointers become their target plus the preferred load address; binds
    /// to a symbol of this image resolve to that symbol's address, or 0 when
    /// the symbol is unknown. Anything else passes through.
    pub fn convert_to_vm_addr(&self, value: u64) -> u64 {
        if value == 0 {
            return 0;
        }
        let dcf = match self.chained_fixups() {
            Ok(Some(dcf)) => dcf,
            Ok(None) => return value,
            Err(err) => {
                debug!(error = %err, "Chained fixups unavailable; using raw pointer");
                return value;
            }
        };

        let base = self.preferred_load_address();
        if let Some(target) = dcf.is_rebase(value, base) {
            return match dcf.pointer_format {
                Some(PointerFormat::Ptr64KernelCache | PointerFormat::X86_64KernelCache) => target,
                _ => target.wrapping_add(base),
            };
        }
        if let Some((import, addend)) = dcf.is_bind(value) {
            if import.lib_ordinal == BIND_SPECIAL_DYLIB_SELF {
                return self
                    .find_symbol_address(&import.name)
                    .map_or(0, |addr| addr.wrapping_add(addend as u64));
            }
        }
        value
    }

    /// Read the pointer at `addr` and convert it to a virtual address.
    pub fn slide_pointer_at(&self, addr: u64) -> Result<u64> {
        self.get_pointer_at_address(addr)
            .map(|raw| self.convert_to_vm_addr(raw))
    }
}
