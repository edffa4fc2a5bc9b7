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


//! Kobo Desktop library decryption
//!
//! Books bought through Kobo Desktop are stored as KEPUB zips whose pages
//! are encrypted with per-page keys. The page keys are encrypted with a
//! user key that is never stored; it is recovered by trying every
//! combination of hash constant, local MAC address and Kobo user id.

pub mod database;
pub mod decryptor;
pub mod keys;
pub mod library;
pub mod mac;

pub use decryptor::{decrypt_library, decrypt_page, decrypt_volume, decrypt_volume_to, VolumeOutcome, VolumeReport};
pub use keys::{Candidate, Candidates, DerivedDeviceKey, DeviceKeyDeriver, HashKeyTable};
pub use library::{default_kobo_dir, KoboLibrary, KoboVolume};

use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Open the library at `kobo_dir` and decrypt the selected volumes
///
/// `only` selects volumes by id or exact title; an empty slice selects
/// everything. MAC addresses come from this machine.
pub async fn decrypt_books(
    kobo_dir: &Path,
    output_dir: PathBuf,
    deriver: &DeviceKeyDeriver,
    concurrency: usize,
    only: &[String],
) -> Result<Vec<VolumeOutcome>> {
    let library = KoboLibrary::open(kobo_dir).await?;
    let volumes: Vec<KoboVolume> = library
        .volumes()
        .await?
        .into_iter()
        .filter(|v| only.is_empty() || only.iter().any(|o| *o == v.volume_id || *o == v.title))
        .collect();
    let user_ids = library.user_ids().await?;
    library.close().await;

    let macs = mac::mac_addresses();
    if macs.is_empty() {
        warn!("no MAC addresses found, protected volumes cannot be decrypted");
    }
    if user_ids.is_empty() {
        warn!("no Kobo user in the database, protected volumes cannot be decrypted");
    }

    std::fs::create_dir_all(&output_dir)?;
    info!(
        volumes = volumes.len(),
        macs = macs.len(),
        users = user_ids.len(),
        "decrypting Kobo library"
    );
    let candidates = deriver.candidates(&macs, &user_ids);
    Ok(decrypt_library(volumes, candidates, output_dir, concurrency).await)
}
