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


//! Error types for book-loader
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are categorized by domain (authorization, fulfillment, crypto, Kobo
//! library, storage) so callers can decide whether an operation is worth
//! repeating.
//!
//! ## Failure taxonomy
//!
//! - `NotAuthorized` - no valid credential in the credential directory
//! - `TransactionConflict` - voucher already bound to another identity (terminal)
//! - `NetworkError { is_transient: true }`, `Timeout` - retryable
//! - `KeyUnwrap` - malformed or foreign wrapped key (terminal for that asset)
//! - `DecryptionError` - malformed ciphertext (terminal for that asset only)
//! - `NoValidKey` - Kobo candidate exhaustion (terminal for that volume only)

use std::fmt;
use thiserror::Error;

/// Result type alias using our LoaderError type
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Why a wrapped content key could not be recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwrapCause {
    /// Envelope has the wrong size or the recovered key has an unexpected length
    Malformed,
    /// Padding check failed, the key was wrapped for a different private key
    WrongKey,
}

impl fmt::Display for UnwrapCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnwrapCause::Malformed => f.write_str("malformed"),
            UnwrapCause::WrongKey => f.write_str("wrong-key"),
        }
    }
}

/// Main error type for book-loader
///
/// Each variant includes descriptive error messages and relevant context.
#[derive(Error, Debug)]
pub enum LoaderError {
    // ===== Authorization Errors =====

    /// No usable credential was found in the credential directory
    #[error("Not authorized: {reason}")]
    NotAuthorized {
        reason: String,
    },

    /// Credential files exist but cannot be interpreted
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    // ===== Fulfillment Errors =====

    /// The voucher's transaction is owned by a different identity
    #[error("Transaction {transaction_id} already fulfilled by another user ({owner_uuid}, local user is {local_uuid})")]
    TransactionConflict {
        transaction_id: String,
        /// Identity the server reports as owner
        owner_uuid: String,
        /// Identity of the local credential
        local_uuid: String,
    },

    /// The server refused to fulfill again for the identity that already owns it
    #[error("Transaction {transaction_id} was already fulfilled for this user")]
    AlreadyFulfilled {
        transaction_id: String,
    },

    /// Structured error returned by the fulfillment server
    #[error("Fulfillment rejected by server: {code}")]
    FulfillmentRejected {
        code: String,
        /// Full error payload for diagnostics
        detail: String,
    },

    /// Voucher file is missing a required element or is not well-formed
    #[error("Invalid voucher: {0}")]
    InvalidVoucher(String),

    /// HTTP request failed with an unexpected status
    #[error("Request failed: {message}")]
    ApiRequestFailed {
        message: String,
        /// HTTP status code if available
        status_code: Option<u16>,
        /// URL that failed
        endpoint: Option<String>,
    },

    /// Server response could not be interpreted
    #[error("Invalid server response: {message}")]
    InvalidApiResponse {
        message: String,
        /// Response body snippet for debugging
        response_body: Option<String>,
    },

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// Download of the encrypted asset failed
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    // ===== Crypto/DRM Errors =====

    /// Wrapped content key could not be recovered
    #[error("Key unwrap failed ({cause}): {message}")]
    KeyUnwrap {
        cause: UnwrapCause,
        message: String,
    },

    /// Ciphertext is malformed (length, padding, structure)
    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    /// Every Kobo candidate key was rejected for a volume
    #[error("No valid key found for volume '{volume_id}'")]
    NoValidKey {
        volume_id: String,
    },

    /// Invalid DRM format or unsupported DRM scheme
    #[error("Invalid DRM format: {0}")]
    InvalidDrmFormat(String),

    /// Asset format is not handled
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    // ===== Kobo Library Errors =====

    /// Kobo Desktop directory or database is missing
    #[error("Kobo library not found: {0}")]
    KoboLibraryNotFound(String),

    // ===== File/Storage Errors =====

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Persisted transaction state could not be read
    #[error("Corrupt transaction state: {0}")]
    CorruptState(String),

    // ===== Input/Configuration Errors =====

    /// Invalid data format or content
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ===== General Errors =====

    /// Operation was cancelled by user or system
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// XML parsing error
    #[error("XML error: {0}")]
    XmlError(#[from] quick_xml::Error),

    /// Zip archive error
    #[error("Archive error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<std::string::FromUtf8Error> for LoaderError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        LoaderError::InvalidData(format!("UTF-8 conversion error: {}", err))
    }
}

impl From<base64::DecodeError> for LoaderError {
    fn from(err: base64::DecodeError) -> Self {
        LoaderError::InvalidData(format!("Invalid base64: {}", err))
    }
}

impl From<quick_xml::events::attributes::AttrError> for LoaderError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        LoaderError::XmlError(quick_xml::Error::from(err))
    }
}

// Helper methods for creating common errors
impl LoaderError {
    /// Create a NotAuthorized error with a reason
    pub fn not_authorized<S: Into<String>>(reason: S) -> Self {
        LoaderError::NotAuthorized {
            reason: reason.into(),
        }
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        LoaderError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        LoaderError::InternalError(message.into())
    }

    /// Create a DecryptionError with a message
    pub fn decryption<S: Into<String>>(message: S) -> Self {
        LoaderError::DecryptionError(message.into())
    }

    /// Create a KeyUnwrap error
    pub fn unwrap_failed<S: Into<String>>(cause: UnwrapCause, message: S) -> Self {
        LoaderError::KeyUnwrap {
            cause,
            message: message.into(),
        }
    }

    /// Create an ApiRequestFailed error
    pub fn api_failed<S: Into<String>>(
        message: S,
        status_code: Option<u16>,
        endpoint: Option<String>,
    ) -> Self {
        LoaderError::ApiRequestFailed {
            message: message.into(),
            status_code,
            endpoint,
        }
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        LoaderError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Check if error is retryable (network errors, timeouts, etc.)
    ///
    /// Returns `true` for transient errors that might succeed on retry with
    /// the same voucher and credential:
    /// - Network errors marked as transient
    /// - Timeouts
    /// - 5xx server errors
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoaderError::NetworkError { is_transient: true, .. }
                | LoaderError::Timeout(_)
                | LoaderError::ApiRequestFailed { status_code: Some(500..=599), .. }
                | LoaderError::DownloadFailed(_)
        )
    }

    /// Check if error is due to authorization or identity ownership
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            LoaderError::NotAuthorized { .. }
                | LoaderError::InvalidCredential(_)
                | LoaderError::TransactionConflict { .. }
        )
    }

    /// Check if error is related to DRM/crypto operations
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            LoaderError::KeyUnwrap { .. }
                | LoaderError::DecryptionError(_)
                | LoaderError::NoValidKey { .. }
                | LoaderError::InvalidDrmFormat(_)
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            LoaderError::NotAuthorized { .. } => {
                "No device authorization found. Create or import an authorization first.".to_string()
            }
            LoaderError::TransactionConflict { owner_uuid, local_uuid, .. } => {
                format!(
                    "This voucher was already downloaded by another authorization ({}). The local authorization is {}. Use the authorization that downloaded it first.",
                    owner_uuid, local_uuid
                )
            }
            LoaderError::AlreadyFulfilled { .. } => {
                "This voucher was already used by this authorization and the server will not deliver it again.".to_string()
            }
            LoaderError::NoValidKey { volume_id } => {
                format!(
                    "Could not decrypt '{}'. Make sure Kobo Desktop is signed in with the account that purchased the book.",
                    volume_id
                )
            }
            LoaderError::Timeout(secs) => {
                format!("The server did not answer within {} seconds. Please try again.", secs)
            }
            LoaderError::KoboLibraryNotFound(path) => {
                format!(
                    "Kobo Desktop library not found at {}. Make sure Kobo Desktop is installed and has synced.",
                    path
                )
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(LoaderError::network_error("reset", true).is_retryable());
        assert!(!LoaderError::network_error("dns", false).is_retryable());
        assert!(LoaderError::Timeout(30).is_retryable());
        assert!(LoaderError::api_failed("busy", Some(503), None).is_retryable());
        assert!(!LoaderError::api_failed("gone", Some(404), None).is_retryable());
        assert!(!LoaderError::AlreadyFulfilled {
            transaction_id: "T1".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_categories() {
        let conflict = LoaderError::TransactionConflict {
            transaction_id: "T1".to_string(),
            owner_uuid: "urn:uuid:a".to_string(),
            local_uuid: "urn:uuid:b".to_string(),
        };
        assert!(conflict.is_auth_error());
        assert!(!conflict.is_crypto_error());
        assert!(conflict.user_message().contains("urn:uuid:a"));

        let unwrap = LoaderError::unwrap_failed(UnwrapCause::WrongKey, "padding");
        assert!(unwrap.is_crypto_error());
        assert!(unwrap.to_string().contains("wrong-key"));
    }
}
