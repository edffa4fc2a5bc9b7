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


//! Run state and the persisted fulfillment marker
//!
//! # Work directory layout
//! ```text
//! <work dir>/
//!   <tx hash>.asset            encrypted download
//!   <tx hash>.fulfillment.json marker, written after the asset
//! ```
//! `<tx hash>` is the first 32 hex digits of SHA-256 over the transaction
//! id, so arbitrary ids map to safe file names.

use crate::adept::fulfill::FulfillmentResult;
use crate::error::{LoaderError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const MARKER_SUFFIX: &str = ".fulfillment.json";
const ASSET_SUFFIX: &str = ".asset";

/// Stage of a voucher run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Redeeming,
    KeyUnwrapping,
    Decrypting,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Redeeming => "redeeming",
            Stage::KeyUnwrapping => "key-unwrapping",
            Stage::Decrypting => "decrypting",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Observable state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Redeeming,
    KeyUnwrapping,
    Decrypting,
    Done,
    Failed { stage: Stage, retryable: bool },
}

impl RunState {
    pub fn stage(&self) -> Stage {
        match self {
            RunState::Idle => Stage::Idle,
            RunState::Redeeming => Stage::Redeeming,
            RunState::KeyUnwrapping => Stage::KeyUnwrapping,
            RunState::Decrypting => Stage::Decrypting,
            RunState::Done => Stage::Done,
            RunState::Failed { stage, .. } => *stage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed { .. })
    }
}

impl From<Stage> for RunState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Idle => RunState::Idle,
            Stage::Redeeming => RunState::Redeeming,
            Stage::KeyUnwrapping => RunState::KeyUnwrapping,
            Stage::Decrypting => RunState::Decrypting,
            Stage::Done => RunState::Done,
        }
    }
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Everything needed to resume a run without talking to the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentMarker {
    pub transaction_id: String,
    /// Local identity that redeemed the voucher
    pub user_uuid: String,
    /// Identity the license is bound to
    pub owner_uuid: String,
    pub fulfillment_id: Option<String>,
    pub download_url: String,
    /// File name of the encrypted asset, relative to the work directory
    pub asset_file: String,
    #[serde(with = "base64_bytes")]
    pub wrapped_key: Vec<u8>,
    pub license_token: String,
    pub title: Option<String>,
    pub stage: Stage,
    pub updated_at: DateTime<Utc>,
}

impl FulfillmentMarker {
    pub fn new(result: &FulfillmentResult, user_uuid: &str, asset_file: String) -> Self {
        Self {
            transaction_id: result.transaction_id.clone(),
            user_uuid: user_uuid.to_string(),
            owner_uuid: result.owner_uuid.clone(),
            fulfillment_id: result.fulfillment_id.clone(),
            download_url: result.download_url.clone(),
            asset_file,
            wrapped_key: result.wrapped_key.clone(),
            license_token: result.license_token.clone(),
            title: result.metadata.title.clone(),
            stage: Stage::KeyUnwrapping,
            updated_at: Utc::now(),
        }
    }
}

/// Stable file-name stem for a transaction id
pub fn transaction_stem(transaction_id: &str) -> String {
    let digest = Sha256::digest(transaction_id.as_bytes());
    hex::encode(&digest[..16])
}

/// Markers and encrypted assets in the work directory
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self, transaction_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", transaction_stem(transaction_id), MARKER_SUFFIX))
    }

    pub fn asset_file_name(&self, transaction_id: &str) -> String {
        format!("{}{}", transaction_stem(transaction_id), ASSET_SUFFIX)
    }

    pub fn asset_path(&self, marker: &FulfillmentMarker) -> PathBuf {
        self.dir.join(&marker.asset_file)
    }

    /// The marker for `transaction_id`, if one was persisted
    ///
    /// # Errors
    /// `CorruptState` when the file exists but is not a marker for this
    /// transaction.
    pub fn load(&self, transaction_id: &str) -> Result<Option<FulfillmentMarker>> {
        let path = self.marker_path(transaction_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let marker: FulfillmentMarker = serde_json::from_str(&text)
            .map_err(|e| LoaderError::CorruptState(format!("{}: {}", path.display(), e)))?;
        if marker.transaction_id != transaction_id {
            return Err(LoaderError::CorruptState(format!(
                "{} belongs to transaction {}",
                path.display(),
                marker.transaction_id
            )));
        }
        Ok(Some(marker))
    }

    /// Write atomically (temp file, then rename)
    pub fn save(&self, marker: &FulfillmentMarker) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.marker_path(&marker.transaction_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(marker)?)?;
        fs::rename(&tmp, &path)?;
        debug!(marker = %path.display(), stage = %marker.stage, "marker saved");
        Ok(())
    }

    pub fn remove(&self, transaction_id: &str) -> Result<()> {
        match fs::remove_file(self.marker_path(transaction_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adept::voucher::VoucherMetadata;
    use tempfile::TempDir;

    fn result() -> FulfillmentResult {
        FulfillmentResult {
            transaction_id: "tx-1".to_string(),
            fulfillment_id: Some("f-1".to_string()),
            download_url: "http://example.invalid/book".to_string(),
            wrapped_key: vec![1, 2, 3, 255],
            license_token: "<licenseToken/>".to_string(),
            owner_uuid: "urn:uuid:owner".to_string(),
            metadata: VoucherMetadata {
                title: Some("A Title".to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_marker_round_trip_through_store() {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path());
        assert!(store.load("tx-1").unwrap().is_none());

        let marker = FulfillmentMarker::new(&result(), "urn:uuid:me", store.asset_file_name("tx-1"));
        store.save(&marker).unwrap();
        assert_eq!(store.load("tx-1").unwrap(), Some(marker.clone()));

        let json = fs::read_to_string(store.marker_path("tx-1")).unwrap();
        assert!(json.contains("\"wrapped_key\": \"AQID/w==\""));
        assert!(json.contains("\"stage\": \"key_unwrapping\""));

        store.remove("tx-1").unwrap();
        store.remove("tx-1").unwrap();
        assert!(store.load("tx-1").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_marker() {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path());
        fs::write(store.marker_path("tx-1"), b"{not json").unwrap();
        assert!(matches!(store.load("tx-1"), Err(LoaderError::CorruptState(_))));
    }

    #[test]
    fn test_stems_are_stable_and_distinct() {
        assert_eq!(transaction_stem("a"), transaction_stem("a"));
        assert_ne!(transaction_stem("a"), transaction_stem("b"));
        assert_eq!(transaction_stem("urn:uuid:x/y").len(), 32);
    }

    #[test]
    fn test_run_state_stage() {
        let failed = RunState::Failed {
            stage: Stage::Decrypting,
            retryable: true,
        };
        assert_eq!(failed.stage(), Stage::Decrypting);
        assert!(failed.is_terminal());
        assert!(!RunState::from(Stage::Redeeming).is_terminal());
    }
}
