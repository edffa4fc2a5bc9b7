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


//! KEPUB page decryption
//!
//! # Two layers
//! 1. `page_key = AES-128-ECB-decrypt(user_key, encrypted_page_key)`
//! 2. `page = unpad(AES-128-ECB-decrypt(page_key, ciphertext))`
//!
//! A wrong user key still "decrypts", so every page is checked: PKCS#7
//! padding must be valid and markup and JPEG parts must start with the
//! expected bytes. A candidate is accepted only when every encrypted part of
//! the volume passes.

use crate::adept::client::part_path;
use crate::error::{LoaderError, Result};
use crate::kobo::keys::{Candidate, Candidates, DerivedDeviceKey};
use crate::kobo::library::KoboVolume;
use crate::paths;
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use aes::Aes128;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const BLOCK: usize = 16;
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
/// Cap on preallocation from a zip's declared entry size
const MAX_SIZE_HINT: u64 = 64 << 20;

fn aes_ecb_decrypt(key: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK != 0 {
        return None;
    }
    let cipher = Aes128::new_from_slice(key).ok()?;
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(BLOCK) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Some(out)
}

fn pkcs7_unpad(mut data: Vec<u8>) -> Option<Vec<u8>> {
    let pad = *data.last()? as usize;
    if pad == 0 || pad > BLOCK || pad > data.len() {
        return None;
    }
    if !data[data.len() - pad..].iter().all(|&b| b as usize == pad) {
        return None;
    }
    data.truncate(data.len() - pad);
    Some(data)
}

/// Whether decrypted bytes look like what the part name promises
pub fn content_looks_valid(element_name: &str, contents: &[u8]) -> bool {
    let lower = element_name.to_ascii_lowercase();
    if lower.ends_with(".xhtml") || lower.ends_with(".html") || lower.ends_with(".htm") {
        let body = contents.strip_prefix(UTF8_BOM).unwrap_or(contents);
        let printable = body
            .iter()
            .take(5)
            .all(|&b| b.is_ascii_whitespace() || (0x20..0x7f).contains(&b));
        let starts_with_tag = body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'<');
        printable && starts_with_tag
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        contents.starts_with(b"\xFF\xD8\xFF")
    } else {
        true
    }
}

/// Decrypt one page with one candidate; `None` when the result is rejected
pub fn decrypt_page(
    element_name: &str,
    encrypted_page_key: &[u8],
    ciphertext: &[u8],
    candidate: &DerivedDeviceKey,
) -> Option<Vec<u8>> {
    if encrypted_page_key.len() != BLOCK {
        return None;
    }
    let page_key = aes_ecb_decrypt(candidate.as_bytes(), encrypted_page_key)?;
    let page = pkcs7_unpad(aes_ecb_decrypt(&page_key, ciphertext)?)?;
    content_looks_valid(element_name, &page).then_some(page)
}

/// Result of one finished volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeReport {
    pub volume_id: String,
    pub output: PathBuf,
    pub parts_decrypted: usize,
    pub drm_free: bool,
    /// Inputs of the accepted candidate
    pub mac: Option<String>,
    pub user_id: Option<String>,
    pub candidates_tried: usize,
}

/// One volume of a library run
#[derive(Debug)]
pub struct VolumeOutcome {
    pub volume_id: String,
    pub title: String,
    pub result: Result<VolumeReport>,
}

struct Entry {
    name: String,
    data: Vec<u8>,
    is_dir: bool,
}

fn read_entries(path: &Path) -> Result<Vec<Entry>> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let mut data = Vec::with_capacity(entry.size().min(MAX_SIZE_HINT) as usize);
        entry.read_to_end(&mut data)?;
        entries.push(Entry {
            name: entry.name().to_string(),
            is_dir: entry.is_dir(),
            data,
        });
    }
    Ok(entries)
}

/// Decrypt every encrypted entry with `key`, all or nothing
fn try_candidate(volume: &KoboVolume, entries: &[Entry], key: &DerivedDeviceKey) -> Option<Vec<(usize, Vec<u8>)>> {
    entries
        .iter()
        .enumerate()
        .filter_map(|(i, e)| volume.page_keys.get(&e.name).map(|k| (i, e, k)))
        .map(|(i, e, page_key)| decrypt_page(&e.name, page_key, &e.data, key).map(|plain| (i, plain)))
        .collect()
}

fn write_epub(entries: &[Entry], replacements: Vec<(usize, Vec<u8>)>, output: &Path) -> Result<()> {
    let mut plain: Vec<Option<Vec<u8>>> = vec![None; entries.len()];
    for (index, data) in replacements {
        plain[index] = Some(data);
    }

    let part = part_path(output);
    let result = (|| -> Result<()> {
        let mut writer = ZipWriter::new(File::create(&part)?);
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let order = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.name == "mimetype")
            .chain(entries.iter().enumerate().filter(|(_, e)| e.name != "mimetype"));
        for (index, entry) in order {
            if entry.is_dir {
                writer.add_directory(entry.name.as_str(), deflated)?;
                continue;
            }
            let options = if entry.name == "mimetype" { stored } else { deflated };
            writer.start_file(entry.name.as_str(), options)?;
            writer.write_all(plain[index].as_deref().unwrap_or(entry.data.as_slice()))?;
        }
        writer.finish()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            fs::rename(&part, output)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&part);
            Err(e)
        }
    }
}

/// Decrypt one volume into `output_dir`
///
/// The file is named after the title; an existing file is never replaced.
pub fn decrypt_volume(volume: &KoboVolume, candidates: Candidates, output_dir: &Path) -> Result<VolumeReport> {
    let output = paths::avoid_collision(&output_dir.join(volume.output_file_name()));
    decrypt_volume_to(volume, candidates, &output)
}

/// Decrypt one volume into exactly `output`
///
/// Candidates are tried in order and the first one that validates every
/// encrypted part wins. DRM-free volumes are copied.
///
/// # Errors
/// `NoValidKey` when every candidate is rejected; nothing is written then.
pub fn decrypt_volume_to(volume: &KoboVolume, candidates: Candidates, output: &Path) -> Result<VolumeReport> {
    let output = output.to_path_buf();
    let mut report = VolumeReport {
        volume_id: volume.volume_id.clone(),
        output: output.clone(),
        parts_decrypted: 0,
        drm_free: !volume.has_drm,
        mac: None,
        user_id: None,
        candidates_tried: 0,
    };

    if !volume.has_drm {
        let part = part_path(&output);
        fs::copy(&volume.path, &part)?;
        fs::rename(&part, &output)?;
        info!(volume_id = %volume.volume_id, "DRM-free volume copied");
        return Ok(report);
    }

    if !volume.path.is_file() {
        return Err(LoaderError::FileNotFound(volume.path.display().to_string()));
    }
    let entries = read_entries(&volume.path)?;
    let encrypted = entries.iter().filter(|e| volume.page_keys.contains_key(&e.name)).count();
    if encrypted == 0 {
        warn!(volume_id = %volume.volume_id, "no listed page present in archive, writing as is");
        write_epub(&entries, Vec::new(), &output)?;
        return Ok(report);
    }

    for Candidate { key, mac, user_id, .. } in candidates {
        report.candidates_tried += 1;
        if let Some(pages) = try_candidate(volume, &entries, &key) {
            report.parts_decrypted = pages.len();
            write_epub(&entries, pages, &output)?;
            info!(
                volume_id = %volume.volume_id,
                tried = report.candidates_tried,
                mac = %mac,
                "volume decrypted"
            );
            report.mac = Some(mac);
            report.user_id = Some(user_id);
            return Ok(report);
        }
    }

    debug!(volume_id = %volume.volume_id, tried = report.candidates_tried, "candidates exhausted");
    Err(LoaderError::NoValidKey {
        volume_id: volume.volume_id.clone(),
    })
}

/// Decrypt many volumes concurrently on the blocking pool
///
/// One outcome per input volume, in input order. A failing volume never
/// stops the others. Output names are reserved before any task starts, so
/// volumes sharing a title get ` (n)` suffixes instead of one file.
pub async fn decrypt_library(
    volumes: Vec<KoboVolume>,
    candidates: Candidates,
    output_dir: PathBuf,
    concurrency: usize,
) -> Vec<VolumeOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let outputs = paths::reserve_paths(&output_dir, volumes.iter().map(KoboVolume::output_file_name));
    let mut handles = Vec::with_capacity(volumes.len());

    for (volume, output) in volumes.into_iter().zip(outputs) {
        let semaphore = semaphore.clone();
        let candidates = candidates.clone();
        let volume_id = volume.volume_id.clone();
        let title = volume.title.clone();

        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| LoaderError::internal(format!("Semaphore acquire failed: {}", e)))?;
            tokio::task::spawn_blocking(move || decrypt_volume_to(&volume, candidates, &output))
                .await
                .map_err(|e| LoaderError::internal(format!("volume task failed: {}", e)))?
        });
        handles.push((volume_id, title, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (volume_id, title, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(LoaderError::internal(format!("volume task failed: {}", e))),
        };
        if let Err(e) = &result {
            warn!(volume_id = %volume_id, error = %e, "volume not decrypted");
        }
        outcomes.push(VolumeOutcome { volume_id, title, result });
    }
    outcomes
}
