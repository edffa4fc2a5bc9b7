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


//! ADEPT PDF decryption (`/Filter /EBX_HANDLER`)
//!
//! # Encryption dictionary
//! ```text
//! << /Filter /EBX_HANDLER /V 4 /Length 128
//!    /ADEPT_LICENSE (base64 of raw-deflated rights XML) >>
//! ```
//! The rights XML carries the RSA-wrapped book key (`encryptedKey`). The
//! unwrapped key is compared with `/Length / 8`:
//! - same length: revision comes from `/V` (3 selects the obfuscated key
//!   schedule, anything else the standard one)
//! - one byte longer: the leading byte is the revision
//!
//! # Per-object keys
//! | Revision | Key input | Cipher |
//! |---|---|---|
//! | 2 | `key ‖ num[0..3] ‖ gen[0..2]` | RC4 |
//! | 3 | `key ‖ n0 g0 n1 g1 n2 ‖ "sAlT"` with `n = num ^ 0x3569ac`, `g = gen ^ 0xca96` | RC4 |
//! | 4 with an AESV2 crypt filter | `key ‖ num[0..3] ‖ gen[0..2] ‖ "sAlT"` | AES-128-CBC, IV prefix |
//!
//! Each input is MD5-hashed and truncated to `min(len(key) + 5, 16)` bytes.
//! All objects share the single book key.
//!
//! # Rewrite
//! Every string and stream of every indirect object is decrypted, object
//! streams are expanded into top-level objects, cross-reference streams and
//! the encryption dictionary are dropped and a classic xref is written.

use crate::adept::credential::Credential;
use crate::crypto::unwrap::{wrapped_key_from_rights, ContentKey, KeyUnwrapper, KeyUse};
use crate::error::{LoaderError, Result};
use crate::pdf::{self, Dictionary, Document, IndirectObject, Object};
use aes::Aes128;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use md5::{Digest, Md5};
use rc4::consts::{U10, U11, U12, U13, U14, U15, U16, U5, U6, U7, U8, U9};
use rc4::{KeyInit, Rc4, StreamCipher};
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Security handler name of ADEPT PDFs
pub const EBX_HANDLER: &[u8] = b"EBX_HANDLER";

const SALT: &[u8] = b"sAlT";

/// Per-object key schedule and cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    Rc4Standard,
    Rc4Obfuscated,
    Aes,
}

/// Book key plus revision, ready to derive per-object keys
pub struct EbxHandler {
    key: Vec<u8>,
    revision: Revision,
}

impl EbxHandler {
    /// Resolve the revision from the encryption dictionary and the book key
    ///
    /// # Errors
    /// `UnsupportedFormat` for other security handlers, `InvalidDrmFormat`
    /// when the key length matches neither `/Length/8` nor `/Length/8 + 1`.
    pub fn new(encrypt: &Dictionary, book_key: &ContentKey) -> Result<Self> {
        let filter = encrypt.get_name("Filter").unwrap_or_default();
        if filter != EBX_HANDLER {
            return Err(LoaderError::UnsupportedFormat(format!(
                "PDF security handler '{}'",
                String::from_utf8_lossy(filter)
            )));
        }

        let length = encrypt
            .get_i64("Length")
            .and_then(|l| usize::try_from(l / 8).ok())
            .unwrap_or(0);
        let dict_v = encrypt.get_i64("V").unwrap_or(4);

        let bytes = book_key.as_bytes();
        let (version, key) = if length == 0 || bytes.len() == length {
            (dict_v, bytes.to_vec())
        } else if bytes.len() == length + 1 {
            (i64::from(bytes[0]), bytes[1..].to_vec())
        } else {
            return Err(LoaderError::InvalidDrmFormat(format!(
                "book key is {} bytes but /Length implies {}",
                bytes.len(),
                length
            )));
        };

        if key.is_empty() || key.len() > 16 {
            return Err(LoaderError::InvalidDrmFormat(format!(
                "unusable book key length {}",
                key.len()
            )));
        }

        let revision = match version {
            3 => Revision::Rc4Obfuscated,
            v if v >= 4 && uses_aes(encrypt) => Revision::Aes,
            _ => Revision::Rc4Standard,
        };
        debug!(?revision, key_len = key.len(), "EBX handler ready");

        Ok(Self { key, revision })
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Per-object key
    pub fn object_key(&self, number: u32, generation: u16) -> Vec<u8> {
        let num = number.to_le_bytes();
        let gen = generation.to_le_bytes();

        let mut hasher = Md5::new();
        hasher.update(&self.key);
        match self.revision {
            Revision::Rc4Standard => {
                hasher.update(&num[..3]);
                hasher.update(gen);
            }
            Revision::Rc4Obfuscated => {
                let n = (number ^ 0x3569ac).to_le_bytes();
                let g = (u32::from(generation) ^ 0xca96).to_le_bytes();
                hasher.update([n[0], g[0], n[1], g[1], n[2]]);
                hasher.update(SALT);
            }
            Revision::Aes => {
                hasher.update(&num[..3]);
                hasher.update(gen);
                hasher.update(SALT);
            }
        }
        let digest = hasher.finalize();
        digest[..(self.key.len() + 5).min(16)].to_vec()
    }

    /// Decrypt one string or stream body
    pub fn decrypt(&self, number: u32, generation: u16, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.object_key(number, generation);
        match self.revision {
            Revision::Aes => decrypt_aes(&key, data)
                .map_err(|e| LoaderError::decryption(format!("object {} {}: {}", number, generation, e))),
            _ => {
                let mut out = data.to_vec();
                rc4_apply(&key, &mut out)?;
                Ok(out)
            }
        }
    }
}

fn uses_aes(encrypt: &Dictionary) -> bool {
    let Some(Object::Dictionary(filters)) = encrypt.get("CF") else {
        return false;
    };
    filters.iter().any(|(_, filter)| {
        filter
            .as_dict()
            .and_then(|f| f.get_name("CFM"))
            .map(|cfm| cfm == b"AESV2")
            .unwrap_or(false)
    })
}

fn rc4_apply(key: &[u8], data: &mut [u8]) -> Result<()> {
    macro_rules! apply {
        ($($len:literal => $size:ty),*) => {
            match key.len() {
                $($len => {
                    let mut cipher = Rc4::<$size>::new_from_slice(key)
                        .map_err(|e| LoaderError::internal(format!("RC4 key: {}", e)))?;
                    cipher.apply_keystream(data);
                })*
                other => {
                    return Err(LoaderError::InvalidDrmFormat(format!(
                        "unsupported RC4 key length {}",
                        other
                    )))
                }
            }
        };
    }
    apply!(5 => U5, 6 => U6, 7 => U7, 8 => U8, 9 => U9, 10 => U10, 11 => U11, 12 => U12,
           13 => U13, 14 => U14, 15 => U15, 16 => U16);
    Ok(())
}

fn decrypt_aes(key: &[u8], data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if data.len() < 32 || data.len() % 16 != 0 {
        return Err(format!("AES ciphertext length {} is not IV plus whole blocks", data.len()));
    }
    let (iv, ciphertext) = data.split_at(16);
    cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
        .map_err(|e| e.to_string())?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| "invalid padding".to_string())
}

/// Summary of a finished decryption
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdfReport {
    pub objects_written: usize,
    pub streams_decrypted: usize,
    pub strings_decrypted: usize,
    pub object_streams_expanded: usize,
    pub copied_unencrypted: bool,
}

/// Decrypts ADEPT-protected PDFs
pub struct PdfDecryptor {
    book_key: ContentKey,
}

impl PdfDecryptor {
    pub fn new(book_key: ContentKey) -> Self {
        Self { book_key }
    }

    /// Unwrap the license embedded in the file with the credential's key
    pub fn from_embedded_license(data: &[u8], credential: &Credential) -> Result<Self> {
        let wrapped = embedded_wrapped_key(data)?.ok_or_else(|| {
            LoaderError::InvalidDrmFormat("PDF carries no ADEPT license".to_string())
        })?;
        let key = KeyUnwrapper::unwrap(&wrapped, credential, KeyUse::Pdf)?;
        Ok(Self::new(key))
    }

    /// Decrypt `input` into `output` via `<output>.part`
    pub fn decrypt_file(&self, input: &Path, output: &Path) -> Result<PdfReport> {
        let data = fs::read(input)?;
        let (bytes, report) = self.decrypt_bytes(&data)?;

        let part = crate::adept::client::part_path(output);
        fs::write(&part, bytes)?;
        fs::rename(&part, output)?;
        info!(
            output = %output.display(),
            objects = report.objects_written,
            streams = report.streams_decrypted,
            "PDF decrypted"
        );
        Ok(report)
    }

    /// Decrypt an in-memory PDF
    ///
    /// Files without `/Encrypt` are returned unchanged.
    pub fn decrypt_bytes(&self, data: &[u8]) -> Result<(Vec<u8>, PdfReport)> {
        let mut document = pdf::parse_document(data)?;

        let Some(encrypt) = document.encrypt_dict().cloned() else {
            return Ok((
                data.to_vec(),
                PdfReport {
                    copied_unencrypted: true,
                    ..Default::default()
                },
            ));
        };

        let handler = EbxHandler::new(&encrypt, &self.book_key)?;
        let encrypt_metadata = !matches!(encrypt.get("EncryptMetadata"), Some(Object::Bool(false)));
        let mut report = PdfReport::default();

        if let Some(number) = document.encrypt_ref() {
            document.objects.remove(&number);
        }

        for (number, indirect) in document.objects.iter_mut() {
            let generation = indirect.generation;
            match &mut indirect.object {
                Object::Stream(stream) => {
                    if stream.dict.is_type("XRef") {
                        continue;
                    }
                    decrypt_strings_in_dict(&handler, *number, generation, &mut stream.dict, &mut report)?;
                    if !encrypt_metadata && stream.dict.is_type("Metadata") {
                        continue;
                    }
                    stream.data = handler.decrypt(*number, generation, &stream.data)?;
                    report.streams_decrypted += 1;
                }
                other => decrypt_strings(&handler, *number, generation, other, &mut report)?,
            }
        }

        expand_object_streams(&mut document, &mut report)?;
        document
            .objects
            .retain(|_, o| !matches!(&o.object, Object::Stream(s) if s.dict.is_type("XRef")));
        document.trailer.remove("Encrypt");

        report.objects_written = document.objects.len();
        Ok((pdf::write_document(&document), report))
    }
}

fn decrypt_strings(
    handler: &EbxHandler,
    number: u32,
    generation: u16,
    object: &mut Object,
    report: &mut PdfReport,
) -> Result<()> {
    match object {
        Object::String(bytes, _) => {
            *bytes = handler.decrypt(number, generation, bytes)?;
            report.strings_decrypted += 1;
        }
        Object::Array(items) => {
            for item in items {
                decrypt_strings(handler, number, generation, item, report)?;
            }
        }
        Object::Dictionary(dict) => decrypt_strings_in_dict(handler, number, generation, dict, report)?,
        _ => {}
    }
    Ok(())
}

fn decrypt_strings_in_dict(
    handler: &EbxHandler,
    number: u32,
    generation: u16,
    dict: &mut Dictionary,
    report: &mut PdfReport,
) -> Result<()> {
    for value in dict.values_mut() {
        decrypt_strings(handler, number, generation, value, report)?;
    }
    Ok(())
}

/// Replace every `/Type /ObjStm` stream by the objects it contains
///
/// Packed objects never override a top-level definition of the same number.
fn expand_object_streams(document: &mut Document, report: &mut PdfReport) -> Result<()> {
    let containers: Vec<u32> = document
        .objects
        .iter()
        .filter(|(_, o)| matches!(&o.object, Object::Stream(s) if s.dict.is_type("ObjStm")))
        .map(|(n, _)| *n)
        .collect();

    let mut packed = Vec::new();
    for number in containers {
        let Some(IndirectObject { object: Object::Stream(stream), .. }) = document.objects.remove(&number) else {
            continue;
        };

        let decoded = decode_flate(&stream)?;
        let count = stream.dict.get_i64("N").unwrap_or(0).max(0) as usize;
        let first = stream.dict.get_i64("First").unwrap_or(0).max(0) as usize;
        packed.extend(pdf::parse_object_stream(&decoded, count, first)?);
        report.object_streams_expanded += 1;
    }

    for (number, object) in packed {
        document
            .objects
            .entry(number)
            .or_insert(IndirectObject { generation: 0, object });
    }
    Ok(())
}

fn decode_flate(stream: &pdf::Stream) -> Result<Vec<u8>> {
    let filters = stream.filters();
    match filters.as_slice() {
        [] => Ok(stream.data.clone()),
        [f] if *f == b"FlateDecode" => {
            if let Some(predictor) = stream
                .dict
                .get("DecodeParms")
                .and_then(Object::as_dict)
                .and_then(|p| p.get_i64("Predictor"))
            {
                if predictor > 1 {
                    return Err(LoaderError::UnsupportedFormat(format!(
                        "object stream predictor {}",
                        predictor
                    )));
                }
            }
            let mut out = Vec::new();
            ZlibDecoder::new(stream.data.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| LoaderError::decryption(format!("object stream does not inflate: {}", e)))?;
            Ok(out)
        }
        other => Err(LoaderError::UnsupportedFormat(format!(
            "object stream filters {:?}",
            other
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect::<Vec<_>>()
        ))),
    }
}

/// The wrapped book key from `/ADEPT_LICENSE`, if the PDF is ADEPT-protected
pub fn embedded_wrapped_key(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let document = pdf::parse_document(data)?;
    let Some(encrypt) = document.encrypt_dict() else {
        return Ok(None);
    };
    if encrypt.get_name("Filter") != Some(EBX_HANDLER) {
        return Ok(None);
    }

    let license = match encrypt.get("ADEPT_LICENSE").and_then(|o| document.resolve(o)) {
        Some(Object::String(bytes, _)) => bytes.clone(),
        _ => {
            return Err(LoaderError::InvalidDrmFormat(
                "EBX_HANDLER without /ADEPT_LICENSE".to_string(),
            ))
        }
    };

    let compressed = BASE64.decode(license.iter().filter(|b| !b.is_ascii_whitespace()).copied().collect::<Vec<_>>())?;
    let mut rights = String::new();
    DeflateDecoder::new(compressed.as_slice())
        .read_to_string(&mut rights)
        .map_err(|e| LoaderError::InvalidDrmFormat(format!("ADEPT_LICENSE does not inflate: {}", e)))?;

    wrapped_key_from_rights(&rights).map(Some)
}

/// Name of the security handler, `None` for unencrypted files
pub fn security_handler(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let document = pdf::parse_document(data)?;
    Ok(document
        .encrypt_dict()
        .map(|e| e.get_name("Filter").unwrap_or_default().to_vec()))
}

/// Copy a PDF that carries no encryption
pub fn copy_unprotected(input: &Path, output: &Path) -> Result<PdfReport> {
    let part = crate::adept::client::part_path(output);
    fs::copy(input, &part)?;
    fs::rename(&part, output)?;
    debug!(input = %input.display(), "no PDF encryption, copied");
    Ok(PdfReport {
        copied_unencrypted: true,
        ..Default::default()
    })
}
