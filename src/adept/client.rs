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


//! HTTP transport for ADEPT operators
//!
//! Wraps `reqwest::Client` with:
//! - a per-request timeout (every request, including downloads)
//! - retry with exponential backoff on network errors and 5xx responses
//! - a semaphore bounding concurrent requests
//! - streamed downloads to a `.part` file renamed on completion
//!
//! # Retry Strategy
//! - Attempt 1: immediate
//! - Attempt 2: after 1 second
//! - Attempt 3: after 2 seconds
//!
//! Retries replay the exact same body bytes. 4xx responses are returned to
//! the caller unchanged since operators report protocol errors as XML
//! documents that need to be classified, not retried.

use crate::error::{LoaderError, Result};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Content type of ADEPT protocol documents
pub const ADEPT_CONTENT_TYPE: &str = "application/vnd.adobe.adept+xml";

/// Maximum number of concurrent requests
pub const MAX_CONCURRENCY: usize = 4;

/// Maximum attempts per request (1 initial + 2 retries)
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Initial retry delay in seconds (exponential backoff: 1s, 2s, 4s)
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration for OperatorClient
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub user_agent: String,
    /// Base backoff delay; tests shorten it
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: MAX_RETRY_ATTEMPTS,
            user_agent: "book-loader/0.1 (ADEPT)".to_string(),
            retry_delay: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries.max(1);
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Response from an operator endpoint (any non-5xx status)
#[derive(Debug, Clone)]
pub struct OperatorResponse {
    pub status: u16,
    pub body: String,
}

impl OperatorResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client for operator endpoints and asset downloads
#[derive(Debug, Clone)]
pub struct OperatorClient {
    client: Client,
    config: ClientConfig,
    semaphore: Arc<Semaphore>,
}

impl OperatorClient {
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// # Errors
    /// Returns error if the user agent is not a valid header value or the
    /// HTTP client cannot be built
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| LoaderError::InvalidInput(format!("Invalid user agent: {}", e)))?,
        );

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            config,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENCY)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POST an ADEPT document
    ///
    /// # Arguments
    /// * `url` - Operator endpoint, e.g. `{operatorURL}/Fulfill`
    /// * `body` - Serialized request; every attempt sends these exact bytes
    ///
    /// # Errors
    /// - `Timeout` if the last attempt timed out
    /// - `NetworkError { is_transient: true }` on connection failures
    /// - `ApiRequestFailed` with a 5xx status once retries are exhausted
    pub async fn post_adept(&self, url: &str, body: &[u8]) -> Result<OperatorResponse> {
        let _permit = self.semaphore.acquire().await.map_err(|e| {
            LoaderError::InternalError(format!("Semaphore acquire failed: {}", e))
        })?;

        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.config.max_retries {
            attempts += 1;

            let result = self
                .client
                .post(url)
                .header(CONTENT_TYPE, ADEPT_CONTENT_TYPE)
                .header(ACCEPT, ADEPT_CONTENT_TYPE)
                .body(body.to_vec())
                .send()
                .await;

            let error = match result {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_server_error() {
                        let body = response.text().await.map_err(|e| self.classify(e))?;
                        debug!(url, status = status.as_u16(), "operator responded");
                        return Ok(OperatorResponse {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    let error_body = response.text().await.unwrap_or_default();
                    LoaderError::api_failed(
                        format!("Server error: {}", error_body),
                        Some(status.as_u16()),
                        Some(url.to_string()),
                    )
                }
                Err(e) if is_retryable_network_error(&e) => self.classify(e),
                Err(e) => return Err(self.classify(e)),
            };

            if attempts < self.config.max_retries {
                let delay = self.config.retry_delay * 2_u32.pow(attempts - 1);
                warn!(url, attempt = attempts, error = %error, "request failed, retrying in {:?}", delay);
                sleep(delay).await;
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| LoaderError::ApiRequestFailed {
            message: format!("Request failed after {} attempts", attempts),
            status_code: None,
            endpoint: Some(url.to_string()),
        }))
    }

    /// Stream a download to `dest`
    ///
    /// Bytes go to `dest.part` first; the file is renamed only after the
    /// whole body arrived. Returns the number of bytes written.
    ///
    /// # Errors
    /// `DownloadFailed` for a non-success status, `Timeout` / `NetworkError`
    /// for transport failures. All of them are retryable.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let _permit = self.semaphore.acquire().await.map_err(|e| {
            LoaderError::InternalError(format!("Semaphore acquire failed: {}", e))
        })?;

        let response = self.client.get(url).send().await.map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            return Err(LoaderError::DownloadFailed(format!(
                "Download of {} failed with status: {}",
                url,
                response.status()
            )));
        }

        let part = part_path(dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&part).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(self.classify(e));
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;

        debug!(url, bytes = written, dest = %dest.display(), "download complete");
        Ok(written)
    }

    fn classify(&self, error: reqwest::Error) -> LoaderError {
        if error.is_timeout() {
            LoaderError::Timeout(self.config.timeout.as_secs())
        } else if is_retryable_network_error(&error) || error.is_body() {
            LoaderError::network_error(format!("Network request failed: {}", error), true)
        } else {
            LoaderError::network_error(format!("Network request failed: {}", error), false)
        }
    }
}

/// `<dest>.part`
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn is_retryable_network_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}
