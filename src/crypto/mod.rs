// book-loader - ebook DRM removal core
// Copyright (C) 2025 book-loader contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Cryptography and DRM removal for ADEPT assets
//!
//! # Formats
//! - **EPUB**: per-part AES-128-CBC, key wrapped in `META-INF/rights.xml`
//! - **PDF**: `EBX_HANDLER` security handler, RC4 or AES per object, key
//!   wrapped in `/ADEPT_LICENSE`
//! - **Unencrypted**: copied through
//!
//! The wrapped key comes either from a fresh fulfillment (see
//! [`crate::workflow`]) or from the license embedded in the asset
//! ([`remove_drm`]).

pub mod epub;
pub mod pdf;
pub mod unwrap;

pub use epub::{EpubDecryptor, EpubReport};
pub use pdf::{PdfDecryptor, PdfReport};
pub use unwrap::{wrapped_key_from_rights, ContentKey, KeyUnwrapper, KeyUse};

use crate::adept::credential::Credential;
use crate::error::{LoaderError, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::info;

/// Container format, decided from the leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetFormat {
    Epub,
    Pdf,
}

impl AssetFormat {
    /// `PK` → EPUB, `%PDF` → PDF
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"PK") {
            Some(AssetFormat::Epub)
        } else if header.starts_with(b"%PDF") {
            Some(AssetFormat::Pdf)
        } else {
            None
        }
    }

    pub fn detect(path: &Path) -> Result<Self> {
        let mut header = [0u8; 4];
        let mut file = File::open(path)?;
        let read = file.read(&mut header)?;
        Self::sniff(&header[..read]).ok_or_else(|| {
            LoaderError::UnsupportedFormat(format!("{} is neither EPUB nor PDF", path.display()))
        })
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AssetFormat::Epub => "epub",
            AssetFormat::Pdf => "pdf",
        }
    }

    pub fn key_use(&self) -> KeyUse {
        match self {
            AssetFormat::Epub => KeyUse::Epub,
            AssetFormat::Pdf => KeyUse::Pdf,
        }
    }
}

/// Outcome of decrypting one asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptReport {
    Epub(EpubReport),
    Pdf(PdfReport),
}

impl DecryptReport {
    pub fn copied_unencrypted(&self) -> bool {
        match self {
            DecryptReport::Epub(r) => r.copied_unencrypted,
            DecryptReport::Pdf(r) => r.copied_unencrypted,
        }
    }
}

/// Decrypt `input` into `output` with an already unwrapped key
pub fn decrypt_asset(format: AssetFormat, key: &ContentKey, input: &Path, output: &Path) -> Result<DecryptReport> {
    match format {
        AssetFormat::Epub => EpubDecryptor::new(key)?.decrypt_file(input, output).map(DecryptReport::Epub),
        AssetFormat::Pdf => PdfDecryptor::new(key.clone())
            .decrypt_file(input, output)
            .map(DecryptReport::Pdf),
    }
}

/// Remove ADEPT DRM using the license embedded in the file
///
/// Unprotected inputs are copied to `output`.
///
/// # Errors
/// - `UnsupportedFormat` for anything but EPUB or PDF
/// - `KeyUnwrap` when the embedded key belongs to another credential
/// - `DecryptionError` for damaged ciphertext
pub fn remove_drm(input: &Path, output: &Path, credential: &Credential) -> Result<DecryptReport> {
    let format = AssetFormat::detect(input)?;
    info!(input = %input.display(), ?format, "removing DRM");

    match format {
        AssetFormat::Epub => {
            let Some(rights) = epub::read_rights(input)? else {
                return epub::copy_unprotected(input, output).map(DecryptReport::Epub);
            };
            let wrapped = wrapped_key_from_rights(&rights)?;
            let key = KeyUnwrapper::unwrap(&wrapped, credential, KeyUse::Epub)?;
            decrypt_asset(format, &key, input, output)
        }
        AssetFormat::Pdf => {
            let data = std::fs::read(input)?;
            match pdf::security_handler(&data)? {
                None => pdf::copy_unprotected(input, output).map(DecryptReport::Pdf),
                Some(handler) if handler == pdf::EBX_HANDLER => {
                    PdfDecryptor::from_embedded_license(&data, credential)?
                        .decrypt_file(input, output)
                        .map(DecryptReport::Pdf)
                }
                Some(handler) => Err(LoaderError::UnsupportedFormat(format!(
                    "PDF security handler '{}'",
                    String::from_utf8_lossy(&handler)
                ))),
            }
        }
    }
}
