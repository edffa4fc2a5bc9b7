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


//! Voucher run: redeem, unwrap, decrypt
//!
//! # State machine
//! ```text
//! Idle → Redeeming → KeyUnwrapping → Decrypting → Done
//!          ↘              ↘               ↘
//!            Failed { stage, retryable }
//! ```
//!
//! # Resume
//! After a successful redemption the encrypted asset is downloaded into the
//! work directory and only then is the marker written. A later run for the
//! same transaction that finds both starts at KeyUnwrapping and never
//! contacts the operator again. A marker whose asset disappeared triggers a
//! fresh download from the recorded URL, not a second redemption.
//!
//! # Retry classification
//! | Stage | Error | Retryable |
//! |---|---|---|
//! | Redeeming | network / timeout / 5xx | yes |
//! | Redeeming | conflict, already fulfilled, rejected | no |
//! | KeyUnwrapping, Decrypting | any | if the asset is persisted or the license owner is the local user |
//!
//! Redemptions for one credential directory are serialized through a
//! process-wide lock registry.

use crate::adept::credential::{same_uuid, Credential, CredentialStore};
use crate::adept::fulfill::VoucherExchangeClient;
use crate::adept::voucher::Voucher;
use crate::config::LoaderConfig;
use crate::crypto::{self, AssetFormat, DecryptReport, KeyUnwrapper};
use crate::error::LoaderError;
use crate::paths;
use crate::workflow::state::{FulfillmentMarker, MarkerStore, RunState, Stage};
use chrono::Utc;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

lazy_static! {
    static ref REDEMPTION_LOCKS: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> =
        std::sync::Mutex::new(HashMap::new());
}

/// Lock shared by every run against the same credential directory
fn redemption_lock(dir: &Path) -> Arc<Mutex<()>> {
    let key = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let mut locks = REDEMPTION_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    locks.entry(key).or_default().clone()
}

/// A run that ended in `Failed`
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct RunFailure {
    pub stage: Stage,
    /// Re-running with the same voucher and credential may succeed
    pub retryable: bool,
    pub source: LoaderError,
}

impl RunFailure {
    fn new(stage: Stage, retryable: bool, source: LoaderError) -> Self {
        Self {
            stage,
            retryable,
            source,
        }
    }
}

/// A run that reached `Done`
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub transaction_id: String,
    pub title: Option<String>,
    pub format: AssetFormat,
    pub output: PathBuf,
    /// Started from a persisted asset instead of redeeming
    pub resumed: bool,
    pub report: DecryptReport,
}

/// Stops a run at the next stage boundary
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Drives one voucher through the stages
pub struct TransactionOrchestrator {
    client: VoucherExchangeClient,
    credentials: CredentialStore,
    markers: MarkerStore,
    keep_encrypted: bool,
    state: watch::Sender<RunState>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl TransactionOrchestrator {
    pub fn new(config: &LoaderConfig) -> crate::error::Result<Self> {
        let client = VoucherExchangeClient::with_config(config.client_config())?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: &LoaderConfig, client: VoucherExchangeClient) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            client,
            credentials: CredentialStore::new(config.auth_dir.clone()),
            markers: MarkerStore::new(config.work_dir.clone()),
            keep_encrypted: config.keep_encrypted,
            state,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    /// Handle for cancelling; a cancelled orchestrator stays cancelled
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    fn enter(&self, state: RunState) {
        debug!(?state, "run state");
        self.state.send_replace(state);
    }

    fn fail(&self, failure: RunFailure) -> RunFailure {
        warn!(
            stage = %failure.stage,
            retryable = failure.retryable,
            error = %failure.source,
            "run failed"
        );
        self.enter(RunState::Failed {
            stage: failure.stage,
            retryable: failure.retryable,
        });
        failure
    }

    fn check_cancelled(&self, next: Stage) -> Result<(), RunFailure> {
        if *self.cancel_rx.borrow() {
            info!(stage = %next, "run cancelled");
            return Err(RunFailure::new(next, true, LoaderError::Cancelled));
        }
        Ok(())
    }

    /// Parse an `.acsm` file and run it
    pub async fn process_file(&self, voucher_path: &Path, output_dir: &Path) -> Result<RunOutcome, RunFailure> {
        let voucher = Voucher::from_file(voucher_path)
            .map_err(|e| self.fail(RunFailure::new(Stage::Idle, false, e)))?;
        self.run(&voucher, output_dir).await
    }

    /// Run `voucher` to completion, writing the plaintext into `output_dir`
    pub async fn run(&self, voucher: &Voucher, output_dir: &Path) -> Result<RunOutcome, RunFailure> {
        self.enter(RunState::Idle);
        let result = self.run_stages(voucher, output_dir).await;
        match result {
            Ok(outcome) => {
                self.enter(RunState::Done);
                Ok(outcome)
            }
            Err(failure) => Err(self.fail(failure)),
        }
    }

    async fn run_stages(&self, voucher: &Voucher, output_dir: &Path) -> Result<RunOutcome, RunFailure> {
        let credential = self
            .credentials
            .load()
            .map_err(|e| RunFailure::new(Stage::Redeeming, false, e))?;

        let lock = redemption_lock(self.credentials.dir());
        let _guard = lock.lock().await;

        self.check_cancelled(Stage::Redeeming)?;
        let (marker, resumed) = self.acquire_asset(voucher, &credential).await?;
        let asset = self.markers.asset_path(&marker);

        self.check_cancelled(Stage::KeyUnwrapping)?;
        self.enter(RunState::KeyUnwrapping);
        let unwrap_failure = |e: LoaderError| {
            let retryable = asset.is_file() || same_uuid(&marker.owner_uuid, &credential.user_uuid);
            RunFailure::new(Stage::KeyUnwrapping, retryable, e)
        };
        let format = AssetFormat::detect(&asset).map_err(unwrap_failure)?;
        let key = KeyUnwrapper::unwrap(&marker.wrapped_key, &credential, format.key_use()).map_err(unwrap_failure)?;

        let mut marker = marker;
        marker.stage = Stage::Decrypting;
        marker.updated_at = Utc::now();
        self.markers
            .save(&marker)
            .map_err(|e| RunFailure::new(Stage::KeyUnwrapping, true, e))?;

        self.check_cancelled(Stage::Decrypting)?;
        self.enter(RunState::Decrypting);
        let decrypt_failure = |e: LoaderError| {
            let retryable = asset.is_file() || same_uuid(&marker.owner_uuid, &credential.user_uuid);
            RunFailure::new(Stage::Decrypting, retryable, e)
        };

        std::fs::create_dir_all(output_dir).map_err(|e| decrypt_failure(e.into()))?;
        let title = marker.title.clone().unwrap_or_else(|| marker.transaction_id.clone());
        let output = paths::avoid_collision(&output_dir.join(paths::output_file_name(&title, format.extension())));

        let report = {
            let (asset, output) = (asset.clone(), output.clone());
            tokio::task::spawn_blocking(move || crypto::decrypt_asset(format, &key, &asset, &output))
                .await
                .map_err(|e| decrypt_failure(LoaderError::internal(format!("decrypt task failed: {}", e))))?
                .map_err(decrypt_failure)?
        };

        if let Err(e) = self.markers.remove(&marker.transaction_id) {
            warn!(error = %e, "marker not removed");
        }
        if !self.keep_encrypted {
            if let Err(e) = std::fs::remove_file(&asset) {
                warn!(asset = %asset.display(), error = %e, "encrypted asset not removed");
            }
        }

        info!(
            transaction = %marker.transaction_id,
            output = %output.display(),
            resumed,
            "voucher processed"
        );
        Ok(RunOutcome {
            transaction_id: marker.transaction_id.clone(),
            title: marker.title.clone(),
            format,
            output,
            resumed,
            report,
        })
    }

    /// Persisted marker and asset for the voucher, redeeming only when needed
    async fn acquire_asset(&self, voucher: &Voucher, credential: &Credential) -> Result<(FulfillmentMarker, bool), RunFailure> {
        let existing = self
            .markers
            .load(&voucher.transaction_id)
            .map_err(|e| RunFailure::new(Stage::Redeeming, false, e))?;

        if let Some(marker) = existing {
            let asset = self.markers.asset_path(&marker);
            if asset.is_file() {
                info!(transaction = %voucher.transaction_id, "resuming from persisted asset");
                return Ok((marker, true));
            }

            // Marker without asset: fetch again from the recorded location
            self.enter(RunState::Redeeming);
            info!(transaction = %voucher.transaction_id, "asset missing, downloading again");
            self.client
                .download_url(&marker.download_url, &asset)
                .await
                .map_err(|e| RunFailure::new(Stage::Redeeming, e.is_retryable(), e))?;
            return Ok((marker, true));
        }

        self.enter(RunState::Redeeming);
        let result = self.client.redeem(voucher, credential).await.map_err(|e| {
            let retryable = match &e {
                LoaderError::TransactionConflict { .. }
                | LoaderError::AlreadyFulfilled { .. }
                | LoaderError::FulfillmentRejected { .. } => false,
                other => other.is_retryable(),
            };
            RunFailure::new(Stage::Redeeming, retryable, e)
        })?;

        let asset_file = self.markers.asset_file_name(&result.transaction_id);
        let asset = self.markers.dir().join(&asset_file);
        std::fs::create_dir_all(self.markers.dir()).map_err(|e| RunFailure::new(Stage::Redeeming, true, e.into()))?;

        if let Err(e) = self.client.download_asset(&result, &asset).await {
            // Nothing persisted; a second redemption is only safe for the owner
            let retryable = e.is_retryable() && same_uuid(&result.owner_uuid, &credential.user_uuid);
            return Err(RunFailure::new(Stage::Redeeming, retryable, e));
        }

        let marker = FulfillmentMarker::new(&result, &credential.user_uuid, asset_file);
        self.markers
            .save(&marker)
            .map_err(|e| RunFailure::new(Stage::Redeeming, true, e))?;
        Ok((marker, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_registry_shares_per_directory() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let first = redemption_lock(a.path());
        let again = redemption_lock(a.path());
        let other = redemption_lock(b.path());
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn test_missing_credential_fails_terminally() {
        let dir = TempDir::new().unwrap();
        let config = LoaderConfig::builder()
            .auth_dir(dir.path().join("auth"))
            .work_dir(dir.path().join("work"))
            .kobo_dir(dir.path().join("kobo"))
            .build();
        let orchestrator = TransactionOrchestrator::new(&config).unwrap();
        let voucher = Voucher::parse(
            r#"<fulfillmentToken xmlns="http://ns.adobe.com/adept"><transaction>tx-1</transaction><operatorURL>http://127.0.0.1:9/fulfillment</operatorURL></fulfillmentToken>"#,
        )
        .unwrap();

        let failure = orchestrator.run(&voucher, dir.path()).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Redeeming);
        assert!(!failure.retryable);
        assert!(matches!(failure.source, LoaderError::NotAuthorized { .. }));
        assert_eq!(
            orchestrator.state(),
            RunState::Failed {
                stage: Stage::Redeeming,
                retryable: false
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_redeeming() {
        let dir = TempDir::new().unwrap();
        let config = LoaderConfig::builder()
            .auth_dir(dir.path().join("auth"))
            .work_dir(dir.path().join("work"))
            .kobo_dir(dir.path().join("kobo"))
            .build();
        CredentialStore::new(&config.auth_dir)
            .persist(&crate::test_support::credential())
            .unwrap();

        let orchestrator = TransactionOrchestrator::new(&config).unwrap();
        orchestrator.cancel_handle().cancel();
        let voucher = Voucher::parse(
            r#"<fulfillmentToken xmlns="http://ns.adobe.com/adept"><transaction>tx-2</transaction><operatorURL>http://127.0.0.1:9/fulfillment</operatorURL></fulfillmentToken>"#,
        )
        .unwrap();

        let failure = orchestrator.run(&voucher, dir.path()).await.unwrap_err();
        assert!(matches!(failure.source, LoaderError::Cancelled));
        assert_eq!(failure.stage, Stage::Redeeming);
        assert!(failure.retryable);
    }
}
