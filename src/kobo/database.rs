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


//! Read-only snapshot of `Kobo.sqlite`
//!
//! Kobo Desktop keeps its database in WAL mode and may hold it open. The
//! database is therefore copied to a temporary file first, with the file
//! format read/write version bytes (offsets 18 and 19) set to 1 so the copy
//! opens in rollback-journal mode without the `-wal` sidecar.
//!
//! # Tables used
//! - `content_keys (volumeid, elementid, elementkey)` - base64 page keys
//! - `content (ContentID, Title, Attribution)` - book metadata
//! - `user (UserID)` - signed-in accounts

use crate::error::{LoaderError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    ConnectOptions, Row,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tempfile::{Builder, TempPath};
use tracing::{debug, warn};

/// Database file name inside the Kobo Desktop directory
pub const KOBO_DATABASE: &str = "Kobo.sqlite";

const WAL_HEADER_OFFSET: usize = 18;

/// One DRM-protected volume as listed in `content_keys`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRow {
    pub volume_id: String,
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Temporary copy of the Kobo database with an open pool
#[derive(Debug)]
pub struct KoboDatabase {
    pool: SqlitePool,
    // Deleted on drop
    _snapshot: TempPath,
}

impl KoboDatabase {
    /// Snapshot `db_path` and open the copy
    ///
    /// # Errors
    /// - `KoboLibraryNotFound` if the file is missing
    /// - `DatabaseError` if it is shorter than a SQLite header
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let source = db_path.as_ref();
        if !source.is_file() {
            return Err(LoaderError::KoboLibraryNotFound(source.display().to_string()));
        }

        let snapshot = snapshot(source)?;
        let connect_opts = SqliteConnectOptions::new()
            .filename(&snapshot)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::from_secs(30))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_opts)
            .await?;

        debug!(source = %source.display(), "Kobo database snapshot opened");
        Ok(Self {
            pool,
            _snapshot: snapshot,
        })
    }

    /// Every protected volume, fully materialised
    pub async fn volume_rows(&self) -> Result<Vec<VolumeRow>> {
        let rows = sqlx::query(
            "SELECT DISTINCT volumeid, Title, Attribution \
             FROM content_keys, content WHERE contentid = volumeid",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(VolumeRow {
                    volume_id: row.try_get("volumeid")?,
                    title: row.try_get("Title")?,
                    author: row.try_get("Attribution")?,
                })
            })
            .collect()
    }

    /// Encrypted page keys of one volume, by element path
    ///
    /// An entry whose key is not valid base64 is kept with an empty key and
    /// a warning; the affected part then fails validation for every candidate.
    pub async fn page_keys(&self, volume_id: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let rows = sqlx::query("SELECT elementid, elementkey FROM content_keys WHERE volumeid = ?")
            .bind(volume_id)
            .fetch_all(&self.pool)
            .await?;

        let mut keys = BTreeMap::new();
        for row in rows {
            let element: String = row.try_get("elementid")?;
            let encoded: Option<String> = row.try_get("elementkey")?;
            match encoded.as_deref().map(|e| BASE64.decode(e.trim())) {
                Some(Ok(key)) => {
                    keys.insert(element, key);
                }
                _ => {
                    warn!(volume_id, element = %element, "unreadable page key");
                    keys.insert(element, Vec::new());
                }
            }
        }
        Ok(keys)
    }

    /// Kobo account ids
    pub async fn user_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<Option<String>> = sqlx::query_scalar("SELECT UserID FROM user")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().flatten().filter(|id| !id.is_empty()).collect())
    }

    /// Title and author of any content row
    pub async fn content_metadata(&self, content_id: &str) -> Result<Option<(Option<String>, Option<String>)>> {
        let row = sqlx::query("SELECT Title, Attribution FROM content WHERE ContentID = ?")
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some((row.try_get("Title")?, row.try_get("Attribution")?))),
            None => Ok(None),
        }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Copy `source` to a temp file with the WAL header bytes cleared
fn snapshot(source: &Path) -> Result<TempPath> {
    let mut data = Vec::new();
    File::open(source)?.read_to_end(&mut data)?;
    if data.len() < WAL_HEADER_OFFSET + 2 {
        return Err(LoaderError::DatabaseError(format!(
            "{} is too short to be a SQLite database",
            source.display()
        )));
    }
    data[WAL_HEADER_OFFSET] = 0x01;
    data[WAL_HEADER_OFFSET + 1] = 0x01;

    let mut file = Builder::new().prefix("kobo-").suffix(".sqlite").tempfile()?;
    file.write_all(&data)?;
    file.flush()?;
    Ok(file.into_temp_path())
}
