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


//! Runtime configuration
//!
//! # Directory resolution
//! | Setting | Order |
//! |---|---|
//! | `auth_dir` | explicit, `BOOK_LOADER_AUTH_DIR`, `$HOME/.config/book-loader/.adobe` |
//! | `work_dir` | explicit, `BOOK_LOADER_WORK_DIR`, `$HOME/.cache/book-loader` |
//! | `kobo_dir` | explicit, `BOOK_LOADER_KOBO_DIR`, platform default |

use crate::adept::client::{ClientConfig, DEFAULT_TIMEOUT_SECS};
use crate::kobo::keys::HashKeyTable;
use crate::kobo::library::default_kobo_dir;
use std::path::PathBuf;
use std::time::Duration;

pub const AUTH_DIR_ENV: &str = "BOOK_LOADER_AUTH_DIR";
pub const WORK_DIR_ENV: &str = "BOOK_LOADER_WORK_DIR";
pub const KOBO_DIR_ENV: &str = "BOOK_LOADER_KOBO_DIR";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_KOBO_CONCURRENCY: usize = 4;

fn home() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn from_env(name: &str) -> Option<PathBuf> {
    std::env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Credential directory: explicit, then environment, then home
pub fn resolve_auth_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| from_env(AUTH_DIR_ENV))
        .unwrap_or_else(|| home().join(".config").join("book-loader").join(".adobe"))
}

pub fn resolve_work_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| from_env(WORK_DIR_ENV))
        .unwrap_or_else(|| home().join(".cache").join("book-loader"))
}

pub fn resolve_kobo_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit.or_else(|| from_env(KOBO_DIR_ENV)).unwrap_or_else(default_kobo_dir)
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub auth_dir: PathBuf,
    /// Encrypted downloads and fulfillment markers
    pub work_dir: PathBuf,
    pub kobo_dir: PathBuf,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub user_agent: String,
    /// Keep the encrypted asset after a successful run
    pub keep_encrypted: bool,
    pub kobo_concurrency: usize,
    pub hash_keys: HashKeyTable,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfigBuilder::new().build()
    }
}

impl LoaderConfig {
    pub fn builder() -> LoaderConfigBuilder {
        LoaderConfigBuilder::new()
    }

    /// HTTP settings for the operator client
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::builder()
            .timeout(self.request_timeout)
            .max_retries(self.max_retries)
            .user_agent(self.user_agent.clone())
            .build()
    }
}

/// Builder for LoaderConfig; unset directories are resolved in `build`
#[derive(Debug, Default)]
pub struct LoaderConfigBuilder {
    auth_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    kobo_dir: Option<PathBuf>,
    request_timeout: Option<Duration>,
    max_retries: Option<u32>,
    user_agent: Option<String>,
    keep_encrypted: bool,
    kobo_concurrency: Option<usize>,
    hash_keys: Option<HashKeyTable>,
}

impl LoaderConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.auth_dir = Some(dir.into());
        self
    }

    pub fn work_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn kobo_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.kobo_dir = Some(dir.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn keep_encrypted(mut self, keep: bool) -> Self {
        self.keep_encrypted = keep;
        self
    }

    pub fn kobo_concurrency(mut self, concurrency: usize) -> Self {
        self.kobo_concurrency = Some(concurrency.max(1));
        self
    }

    pub fn hash_keys(mut self, table: HashKeyTable) -> Self {
        self.hash_keys = Some(table);
        self
    }

    pub fn build(self) -> LoaderConfig {
        let client_defaults = ClientConfig::default();
        LoaderConfig {
            auth_dir: resolve_auth_dir(self.auth_dir),
            work_dir: resolve_work_dir(self.work_dir),
            kobo_dir: resolve_kobo_dir(self.kobo_dir),
            request_timeout: self
                .request_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            user_agent: self.user_agent.unwrap_or(client_defaults.user_agent),
            keep_encrypted: self.keep_encrypted,
            kobo_concurrency: self.kobo_concurrency.unwrap_or(DEFAULT_KOBO_CONCURRENCY),
            hash_keys: self.hash_keys.unwrap_or_default(),
        }
    }
}
