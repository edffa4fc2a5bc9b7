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


//! Kobo Desktop library
//!
//! # Layout
//! ```text
//! <kobo dir>/
//!   Kobo.sqlite
//!   kepub/<volume id>     one zip per book, no extension
//! ```

use crate::error::{LoaderError, Result};
use crate::kobo::database::{KoboDatabase, KOBO_DATABASE};
use crate::paths;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Book directory inside the Kobo Desktop directory
pub const KEPUB_DIR: &str = "kepub";

/// One book of the library
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KoboVolume {
    pub volume_id: String,
    pub title: String,
    pub author: Option<String>,
    pub path: PathBuf,
    /// Encrypted page keys by element path; empty for DRM-free books
    #[serde(skip)]
    pub page_keys: BTreeMap<String, Vec<u8>>,
    pub has_drm: bool,
}

impl KoboVolume {
    /// Output file name derived from the title
    pub fn output_file_name(&self) -> String {
        paths::output_file_name(&self.title, "epub")
    }
}

/// Default Kobo Desktop directory for this platform
pub fn default_kobo_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join("Kobo")
            .join("Kobo Desktop Edition")
    }

    #[cfg(target_os = "windows")]
    {
        let local = std::env::var("LOCALAPPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(local).join("Kobo").join("Kobo Desktop Edition")
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("Kobo")
            .join("Kobo Desktop Edition")
    }
}

/// An opened Kobo Desktop directory
#[derive(Debug)]
pub struct KoboLibrary {
    dir: PathBuf,
    db: KoboDatabase,
}

impl KoboLibrary {
    /// Open `dir`, snapshotting its database
    ///
    /// # Errors
    /// `KoboLibraryNotFound` when the directory or `Kobo.sqlite` is missing
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(LoaderError::KoboLibraryNotFound(dir.display().to_string()));
        }
        let db = KoboDatabase::open(dir.join(KOBO_DATABASE)).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            db,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Protected volumes from `content_keys`, then DRM-free files in `kepub/`
    ///
    /// Sorted by title, case-insensitively.
    pub async fn volumes(&self) -> Result<Vec<KoboVolume>> {
        let kepub = self.dir.join(KEPUB_DIR);

        // All outer rows are read before any per-volume query runs
        let rows = self.db.volume_rows().await?;
        let mut seen = HashSet::new();
        let mut volumes = Vec::with_capacity(rows.len());

        for row in rows {
            let page_keys = self.db.page_keys(&row.volume_id).await?;
            seen.insert(row.volume_id.clone());
            volumes.push(KoboVolume {
                title: row.title.filter(|t| !t.is_empty()).unwrap_or_else(|| row.volume_id.clone()),
                author: row.author,
                path: kepub.join(&row.volume_id),
                volume_id: row.volume_id,
                page_keys,
                has_drm: true,
            });
        }

        for file in list_kepub(&kepub)? {
            let Some(name) = file.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if seen.contains(&name) {
                continue;
            }
            if let Some((title, author)) = self.db.content_metadata(&name).await? {
                seen.insert(name.clone());
                volumes.push(KoboVolume {
                    title: title.filter(|t| !t.is_empty()).unwrap_or_else(|| name.clone()),
                    author,
                    path: file,
                    volume_id: name,
                    page_keys: BTreeMap::new(),
                    has_drm: false,
                });
            } else {
                debug!(file = %file.display(), "kepub file without content row, skipped");
            }
        }

        volumes.sort_by_key(|v| v.title.to_lowercase());
        info!(
            total = volumes.len(),
            protected = volumes.iter().filter(|v| v.has_drm).count(),
            "Kobo library scanned"
        );
        Ok(volumes)
    }

    pub async fn user_ids(&self) -> Result<Vec<String>> {
        self.db.user_ids().await
    }

    pub async fn close(self) {
        self.db.close().await;
    }
}

fn list_kepub(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kobo::database::tests::create_fixture;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_volumes_include_drm_free_files() {
        let dir = TempDir::new().unwrap();
        let keys: &[(&str, Vec<u8>)] = &[("OEBPS/a.xhtml", vec![1u8; 16])];
        create_fixture(
            &dir.path().join(KOBO_DATABASE),
            &[("vol-b", "beta", keys), ("vol-a", "Alpha", keys), ("free-1", "Gamma", &[])],
            &["user"],
        )
        .await;

        let kepub = dir.path().join(KEPUB_DIR);
        fs::create_dir(&kepub).unwrap();
        fs::write(kepub.join("vol-a"), b"zip").unwrap();
        fs::write(kepub.join("free-1"), b"zip").unwrap();
        fs::write(kepub.join("stray"), b"zip").unwrap();

        let library = KoboLibrary::open(dir.path()).await.unwrap();
        let volumes = library.volumes().await.unwrap();
        let titles: Vec<_> = volumes.iter().map(|v| v.title.as_str()).collect();
        assert_eq!(titles, vec!["Alpha", "beta", "Gamma"]);
        assert!(volumes[0].has_drm && volumes[1].has_drm);
        assert!(!volumes[2].has_drm);
        assert!(volumes[2].page_keys.is_empty());
        assert_eq!(volumes[0].path, kepub.join("vol-a"));
        assert_eq!(volumes[0].page_keys.len(), 1);
    }

    #[tokio::test]
    async fn test_every_volume_page_pair_listed_once() {
        let dir = TempDir::new().unwrap();
        let pages = |n: u8| -> Vec<(&'static str, Vec<u8>)> {
            vec![("OEBPS/1.xhtml", vec![n; 16]), ("OEBPS/2.xhtml", vec![n + 1; 16])]
        };
        let (one, two, three) = (pages(1), pages(3), pages(5));
        create_fixture(
            &dir.path().join(KOBO_DATABASE),
            &[("vol-1", "One", one.as_slice()), ("vol-2", "Two", two.as_slice()), ("vol-3", "Three", three.as_slice())],
            &["user"],
        )
        .await;

        let library = KoboLibrary::open(dir.path()).await.unwrap();
        assert_eq!(library.dir(), dir.path());
        let volumes = library.volumes().await.unwrap();
        library.close().await;

        assert_eq!(volumes.len(), 3);
        assert!(volumes.iter().all(|v| v.page_keys.len() == 2));
        let pairs: Vec<(String, String)> = volumes
            .iter()
            .flat_map(|v| v.page_keys.keys().map(move |page| (v.volume_id.clone(), page.clone())))
            .collect();
        let distinct: std::collections::BTreeSet<_> = pairs.iter().cloned().collect();
        assert_eq!(pairs.len(), 6);
        assert_eq!(distinct.len(), 6);
        assert_eq!(volumes[2].volume_id, "vol-2");
        assert_eq!(volumes[2].page_keys["OEBPS/2.xhtml"], vec![4u8; 16]);
    }

    #[tokio::test]
    async fn test_missing_directory() {
        assert!(matches!(
            KoboLibrary::open("/nonexistent/kobo").await,
            Err(LoaderError::KoboLibraryNotFound(_))
        ));
    }
}
