//! Code-signature placement
//!
//! Signing itself is delegated to a [`Signer`]. This module reserves room
//! for the signature at the end of `__LINKEDIT`, lays out the final header
//! and load commands, hands the signer the bytes the signature covers and
//! appends whatever blob it returns.

use crate::config::SigningSettings;
use crate::error::{MachOError, Result};
use crate::formats::macho::commands::{Command, LinkeditData, LoadCommand};
use crate::formats::macho::toc::FileToc;
use crate::formats::macho::types::{lc, FileType};
use crate::formats::macho::utils::align_up;
use crate::formats::macho::MachO;
use crate::io::{ByteSource, MemorySource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

const LINKEDIT_FILE_ALIGNMENT: u64 = 0x4000;
const LINKEDIT_VM_ALIGNMENT: u64 = 0x8000;
const HASH_SIZE: u64 = 32;
const BLOB_OVERHEAD: u64 = 1024;

/// A precomputed hash for one special slot of the code directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialSlot {
    pub slot: u32,
    pub hash: Vec<u8>,
}

impl fmt::Display for SpecialSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-{}: {}", self.slot, hex::encode(&self.hash))
    }
}

/// What the signer is asked to sign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub identifier: String,
    pub team_id: Option<String>,
    pub entitlements: Option<String>,
    pub special_slots: Vec<SpecialSlot>,
    pub is_main_executable: bool,
    /// Bytes covered by the signature; filled in by [`MachO::code_sign`].
    pub code_size: u64,
    pub text_offset: u64,
    pub text_size: u64,
    /// Blob of the signature being replaced, when re-signing. Signers may
    /// take the identifier and team id from it.
    #[serde(skip)]
    pub existing_signature: Option<Vec<u8>>,
}

impl SigningConfig {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }
}

/// External producer of signature blobs.
pub trait Signer {
    /// Sign the first `config.code_size` bytes of `code`.
    fn sign(&self, code: &dyn ByteSource, config: &SigningConfig) -> anyhow::Result<Vec<u8>>;

    /// Upper bound on the blob `sign` returns for `config`.
    fn estimate_size(&self, config: &SigningConfig, settings: &SigningSettings) -> u64 {
        let pages = config.code_size.div_ceil(settings.page_size.max(1));
        let size = pages * HASH_SIZE
            + config.special_slots.len() as u64 * HASH_SIZE
            + config.identifier.len() as u64
            + config.team_id.as_ref().map_or(0, |t| t.len() as u64)
            + config.entitlements.as_ref().map_or(0, |e| e.len() as u64)
            + BLOB_OVERHEAD;
        align_up(size, settings.signature_alignment)
    }
}

/// A signed copy of an image.
#[derive(Debug, Clone)]
pub struct SignedImage {
    toc: FileToc,
    data: Vec<u8>,
    pub signature_offset: u64,
    /// Space reserved for the signature.
    pub signature_size: u64,
    /// Length of the blob the signer returned.
    pub blob_size: u64,
}

impl SignedImage {
    pub fn toc(&self) -> &FileToc {
        &self.toc
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn signature(&self) -> &[u8] {
        let start = self.signature_offset as usize;
        &self.data[start..start + self.blob_size as usize]
    }

    /// Write the image to `path`, creating parent directories. The file is
    /// marked executable on Unix.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &self.data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }
        info!(path = %path.display(), size = self.data.len(), "Saved signed image");
        Ok(())
    }
}

fn signature_mut(toc: &mut FileToc) -> Option<&mut LinkeditData> {
    toc.loads
        .iter_mut()
        .find(|l| l.cmd == lc::CODE_SIGNATURE)
        .and_then(|l| match &mut l.body {
            Command::LinkeditData(ld) => Some(ld),
            _ => None,
        })
}

fn to_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| MachOError::format_value(value, format!("{what} exceeds 32 bits"), value))
}

impl MachO {
    /// Sign the image with default placement settings.
    pub fn code_sign(&self, config: &SigningConfig, signer: &dyn Signer) -> Result<SignedImage> {
        self.code_sign_with_settings(config, signer, &SigningSettings::default())
    }

    /// Reserve signature space after `__LINKEDIT`, lay out the final load
    /// commands and sign everything before the signature.
    pub fn code_sign_with_settings(
        &self,
        config: &SigningConfig,
        signer: &dyn Signer,
        settings: &SigningSettings,
    ) -> Result<SignedImage> {
        let _span = crate::span_trace!("code_sign", identifier = %config.identifier).entered();
        let text = self.segment("__TEXT")?.clone();
        let linkedit = self.segment("__LINKEDIT")?.clone();

        let mut toc = self.toc.clone();
        let existing = self.code_signature().filter(|cs| cs.offset != 0);
        let mut config = config.clone();
        let sig_offset = match existing {
            Some(cs) => {
                match self.read_linkedit(cs.offset, cs.size) {
                    Ok(blob) => config.existing_signature = Some(blob.to_vec()),
                    Err(e) => warn!(error = %e, "Existing code signature is unreadable"),
                }
                u64::from(cs.offset)
            }
            None => {
                if config.identifier.is_empty() {
                    return Err(MachOError::Unsupported(
                        "a new code signature requires an identifier".to_string(),
                    ));
                }
                let offset = align_up(linkedit.fileoff + linkedit.filesize, settings.signature_alignment);
                let ctx = toc.ctx();
                toc.add_load(LoadCommand::new(
                    lc::CODE_SIGNATURE,
                    Command::LinkeditData(LinkeditData {
                        offset: to_u32(offset, "code signature offset")?,
                        size: 0,
                    }),
                    ctx,
                ));
                offset
            }
        };
        if sig_offset < linkedit.fileoff {
            return Err(MachOError::format_value(
                sig_offset,
                "code signature precedes __LINKEDIT",
                linkedit.fileoff,
            ));
        }

        config.is_main_executable |= self.header().filetype == FileType::Execute;
        config.code_size = sig_offset;
        config.text_offset = text.fileoff;
        config.text_size = text.filesize;

        let estimate = align_up(signer.estimate_size(&config, settings), settings.signature_alignment);
        let filesize = align_up(sig_offset - linkedit.fileoff + estimate, LINKEDIT_FILE_ALIGNMENT);
        let end = linkedit.fileoff + filesize;
        let reserved = end - sig_offset;

        if let Some(Command::Segment(seg)) = toc
            .loads
            .iter_mut()
            .map(|l| &mut l.body)
            .find(|b| matches!(b, Command::Segment(s) if s.name == "__LINKEDIT"))
        {
            seg.filesize = filesize;
            seg.vmsize = align_up(filesize, LINKEDIT_VM_ALIGNMENT);
        }
        let (cs_offset, cs_size) = (
            to_u32(sig_offset, "code signature offset")?,
            to_u32(reserved, "code signature size")?,
        );
        if let Some(cs) = signature_mut(&mut toc) {
            cs.offset = cs_offset;
            cs.size = cs_size;
        }

        let head = toc.to_bytes()?;
        let limit = self.first_section_offset().unwrap_or(text.fileoff + text.filesize);
        if head.len() as u64 > limit {
            return Err(MachOError::Capacity {
                reserved: limit,
                written: head.len() as u64,
            });
        }

        let available = self.source.size().min(sig_offset);
        let mut data = self.source.read_exact_at(0, available)?.to_vec();
        data.resize(sig_offset as usize, 0);
        let old_end = (self.toc.header.size() as u64 + u64::from(self.toc.header.sizeofcmds))
            .min(sig_offset) as usize;
        data[..old_end].fill(0);
        data[..head.len()].copy_from_slice(&head);

        debug!(
            identifier = %config.identifier,
            code_size = sig_offset,
            estimate,
            reserved,
            "Requesting code signature"
        );
        let code = MemorySource::new(data.clone());
        let blob = signer.sign(&code, &config).map_err(MachOError::Signer)?;
        if blob.len() as u64 > reserved {
            return Err(MachOError::Capacity {
                reserved,
                written: blob.len() as u64,
            });
        }

        data.extend_from_slice(&blob);
        data.resize(end as usize, 0);
        info!(
            identifier = %config.identifier,
            offset = sig_offset,
            blob = blob.len(),
            "Signed image"
        );
        Ok(SignedImage {
            toc,
            data,
            signature_offset: sig_offset,
            signature_size: reserved,
            blob_size: blob.len() as u64,
        })
    }
}
