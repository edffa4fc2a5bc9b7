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


//! ADEPT voucher protocol
//!
//! # Modules
//! - `credential` - device identity and private key, two on-disk encodings
//! - `voucher` - `.acsm` parsing
//! - `fulfill` - voucher redemption and response classification
//! - `client` - HTTP transport (timeouts, retry, streamed downloads)
//! - `signing` - ADEPT tree hash and request signatures
//! - `xml` - namespace-aware element tree shared by the above

pub mod client;
pub mod credential;
pub mod fulfill;
pub mod signing;
pub mod voucher;
pub mod xml;

pub use client::{ClientConfig, OperatorClient};
pub use credential::{AuthKind, Credential, CredentialEncoding, CredentialStore};
pub use fulfill::{FulfillmentResult, VoucherExchangeClient};
pub use voucher::{Voucher, VoucherMetadata};
