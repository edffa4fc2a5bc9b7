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


//! ADEPT EPUB decryption
//!
//! # Container layout
//! - `META-INF/rights.xml` - license token with the RSA-wrapped book key
//! - `META-INF/encryption.xml` - one `EncryptedData` per protected part:
//!   ```xml
//!   <enc:EncryptedData>
//!     <enc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes128-cbc"/>
//!     <enc:CipherData><enc:CipherReference URI="OEBPS/chapter1.xhtml"/></enc:CipherData>
//!   </enc:EncryptedData>
//!   ```
//!
//! # Part format
//! `IV (16 bytes) || AES-128-CBC(deflate(part))` with PKCS#7 padding. Every
//! part carries its own IV. Parts whose plaintext does not inflate are used
//! as-is.
//!
//! # Output
//! `mimetype` is written first and stored, everything else is deflated.
//! `rights.xml` is dropped; `encryption.xml` is dropped or rewritten without
//! the ADEPT entries (font obfuscation entries are kept). Output is written
//! to `<output>.part` and renamed only when every part decrypted.

use crate::adept::xml::{self, Element, Node};
use crate::crypto::unwrap::ContentKey;
use crate::error::{LoaderError, Result};
use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use flate2::read::DeflateDecoder;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MIMETYPE: &str = "mimetype";
pub const ENCRYPTION_XML: &str = "META-INF/encryption.xml";
pub const RIGHTS_XML: &str = "META-INF/rights.xml";

/// Algorithm URI of ADEPT-encrypted parts
pub const ADEPT_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";

const BLOCK: usize = 16;
/// Cap on preallocation from a zip's declared entry size
const MAX_SIZE_HINT: u64 = 64 << 20;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// One ADEPT entry of `encryption.xml`
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedPart {
    /// Archive path (URI percent-decoded)
    pub path: String,
    /// `false` when `Compression Method="0"` says the part was not deflated
    pub compressed: bool,
}

/// Parsed `encryption.xml`
#[derive(Debug, Clone)]
pub struct EncryptionManifest {
    pub parts: Vec<EncryptedPart>,
    /// Document without ADEPT entries; `None` when nothing else remains
    pub remainder: Option<String>,
}

impl EncryptionManifest {
    pub fn parse(text: &str) -> Result<Self> {
        let mut root = xml::parse(text)?;
        let mut parts = Vec::new();

        root.children.retain(|node| {
            let Node::Element(data) = node else {
                return true;
            };
            if data.local_name() != "EncryptedData" {
                return true;
            }
            let algorithm = data
                .find("EncryptionMethod")
                .and_then(|m| m.attr("Algorithm"));
            if algorithm != Some(ADEPT_ALGORITHM) {
                return true;
            }
            if let Some(uri) = data.find("CipherReference").and_then(|r| r.attr("URI")) {
                parts.push(EncryptedPart {
                    path: decode_uri(uri),
                    compressed: compression_method(data) != Some("0"),
                });
            }
            false
        });

        let remaining = root
            .elements()
            .filter(|e| e.local_name() == "EncryptedData")
            .count();
        let remainder = (remaining > 0).then(|| root.to_document());

        Ok(Self { parts, remainder })
    }

    fn lookup(&self) -> HashMap<&str, &EncryptedPart> {
        self.parts.iter().map(|p| (p.path.as_str(), p)).collect()
    }
}

fn compression_method(data: &Element) -> Option<&str> {
    data.find("Compression").and_then(|c| c.attr("Method"))
}

fn decode_uri(uri: &str) -> String {
    let uri = uri.trim_start_matches("./").trim_start_matches('/');
    urlencoding::decode(uri)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| uri.to_string())
}

/// Summary of a finished decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpubReport {
    pub parts_decrypted: usize,
    pub entries_written: usize,
    /// Input carried no ADEPT protection and was copied
    pub copied_unencrypted: bool,
}

/// Decrypts ADEPT-protected EPUB containers
pub struct EpubDecryptor {
    key: [u8; BLOCK],
}

impl EpubDecryptor {
    /// # Errors
    /// `InvalidInput` when the key is not 16 bytes
    pub fn new(key: &ContentKey) -> Result<Self> {
        let key: [u8; BLOCK] = key.as_bytes().try_into().map_err(|_| {
            LoaderError::invalid_input(format!("EPUB key must be 16 bytes, got {}", key.len()))
        })?;
        Ok(Self { key })
    }

    /// Decrypt `input` into `output`
    ///
    /// # Errors
    /// `DecryptionError` naming the first part that fails; no output file
    /// is left behind in that case.
    pub fn decrypt_file(&self, input: &Path, output: &Path) -> Result<EpubReport> {
        let part_path = crate::adept::client::part_path(output);
        let result = self.write_decrypted(input, &part_path);

        match result {
            Ok(report) => {
                fs::rename(&part_path, output)?;
                info!(
                    output = %output.display(),
                    parts = report.parts_decrypted,
                    "EPUB decrypted"
                );
                Ok(report)
            }
            Err(e) => {
                let _ = fs::remove_file(&part_path);
                Err(e)
            }
        }
    }

    fn write_decrypted(&self, input: &Path, dest: &Path) -> Result<EpubReport> {
        let mut archive = ZipArchive::new(File::open(input)?)?;

        let manifest = match read_entry(&mut archive, ENCRYPTION_XML)? {
            Some(bytes) => Some(EncryptionManifest::parse(&String::from_utf8(bytes)?)?),
            None => None,
        };
        let has_rights = archive.index_for_name(RIGHTS_XML).is_some();
        let adept_parts = manifest.as_ref().map(|m| m.parts.len()).unwrap_or(0);

        if adept_parts == 0 && !has_rights {
            debug!(input = %input.display(), "no ADEPT protection, copying");
            fs::copy(input, dest)?;
            return Ok(EpubReport {
                parts_decrypted: 0,
                entries_written: archive.len(),
                copied_unencrypted: true,
            });
        }

        let lookup = manifest.as_ref().map(|m| m.lookup()).unwrap_or_default();
        let mut writer = ZipWriter::new(File::create(dest)?);
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mimetype = read_entry(&mut archive, MIMETYPE)?
            .unwrap_or_else(|| b"application/epub+zip".to_vec());
        writer.start_file(MIMETYPE, stored)?;
        writer.write_all(&mimetype)?;

        let mut report = EpubReport {
            parts_decrypted: 0,
            entries_written: 1,
            copied_unencrypted: false,
        };
        let mut seen = HashSet::new();

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let name = entry.name().to_string();

            if name == MIMETYPE || name == RIGHTS_XML || !seen.insert(name.clone()) {
                continue;
            }
            if entry.is_dir() {
                writer.add_directory(name.as_str(), deflated)?;
                continue;
            }

            let mut data = Vec::with_capacity(entry.size().min(MAX_SIZE_HINT) as usize);
            entry.read_to_end(&mut data)?;
            drop(entry);

            if name == ENCRYPTION_XML {
                match manifest.as_ref().and_then(|m| m.remainder.as_ref()) {
                    Some(remainder) => data = remainder.clone().into_bytes(),
                    None => continue,
                }
            } else if let Some(part) = lookup.get(name.as_str()) {
                data = decrypt_part(&self.key, &name, &data, part.compressed)?;
                report.parts_decrypted += 1;
            }

            writer.start_file(name.as_str(), deflated)?;
            writer.write_all(&data)?;
            report.entries_written += 1;
        }

        if report.parts_decrypted != adept_parts {
            return Err(LoaderError::decryption(format!(
                "encryption.xml lists {} parts but {} were found in the archive",
                adept_parts, report.parts_decrypted
            )));
        }

        writer.finish()?;
        Ok(report)
    }
}

/// Copy an EPUB without ADEPT protection
pub fn copy_unprotected(input: &Path, output: &Path) -> Result<EpubReport> {
    let entries = ZipArchive::new(File::open(input)?)?.len();
    let part = crate::adept::client::part_path(output);
    fs::copy(input, &part)?;
    fs::rename(&part, output)?;
    debug!(input = %input.display(), "no rights.xml, copied");
    Ok(EpubReport {
        parts_decrypted: 0,
        entries_written: entries,
        copied_unencrypted: true,
    })
}

/// Text of `META-INF/rights.xml`, if present
pub fn read_rights(path: &Path) -> Result<Option<String>> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    match read_entry(&mut archive, RIGHTS_XML)? {
        Some(bytes) => Ok(Some(String::from_utf8(bytes)?)),
        None => Ok(None),
    }
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Option<Vec<u8>>> {
    let Some(index) = archive.index_for_name(name) else {
        return Ok(None);
    };
    let mut entry = archive.by_index(index)?;
    let mut data = Vec::with_capacity(entry.size().min(MAX_SIZE_HINT) as usize);
    entry.read_to_end(&mut data)?;
    Ok(Some(data))
}

/// Decrypt one part: split the IV, AES-128-CBC, unpad, inflate if possible
///
/// # Errors
/// `DecryptionError` naming `name` when the ciphertext is not block aligned,
/// shorter than IV plus one block, or the padding is invalid.
pub fn decrypt_part(key: &[u8; BLOCK], name: &str, data: &[u8], compressed: bool) -> Result<Vec<u8>> {
    if data.len() < 2 * BLOCK || data.len() % BLOCK != 0 {
        return Err(LoaderError::decryption(format!(
            "{}: ciphertext length {} is not a whole number of blocks after the IV",
            name,
            data.len()
        )));
    }

    let (iv, ciphertext) = data.split_at(BLOCK);
    let plain = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| LoaderError::decryption(format!("{}: {}", name, e)))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| LoaderError::decryption(format!("{}: invalid padding", name)))?;

    if !compressed {
        return Ok(plain);
    }

    let mut inflated = Vec::with_capacity(plain.len() * 2);
    match DeflateDecoder::new(plain.as_slice()).read_to_end(&mut inflated) {
        Ok(_) => Ok(inflated),
        Err(_) => Ok(plain),
    }
}
