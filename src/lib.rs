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


//! book-loader core
//!
//! Removes ADEPT DRM from EPUB and PDF books and Kobo DRM from books synced
//! by Kobo Desktop.
//!
//! # Modules
//! - `adept` - credentials, vouchers, redemption against the operator
//! - `crypto` - key unwrap, EPUB and PDF decryption
//! - `pdf` - PDF object parser and writer
//! - `kobo` - Kobo Desktop library, device keys, KEPUB decryption
//! - `workflow` - resumable voucher runs
//! - `config` - directories and client settings
//! - `paths` - output file naming
//! - `error` - error taxonomy

pub mod adept;
pub mod config;
pub mod crypto;
pub mod error;
pub mod kobo;
pub mod paths;
pub mod pdf;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use config::LoaderConfig;
pub use error::{LoaderError, Result};
pub use workflow::{RunFailure, RunOutcome, RunState, Stage, TransactionOrchestrator};
