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


//! Kobo user key derivation
//!
//! # Algorithm
//! ```text
//! device_id = hex(SHA256(constant ‖ MAC))
//! user_key  = SHA256(device_id ‖ user_id)[16..32]
//! ```
//! The constant comes from a fixed table, the MAC from a local network
//! interface (uppercase, colon separated) and the user id from the Kobo
//! database. None of the three is known up front, so every combination is
//! a candidate.

use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Hash constants shipped with Kobo Desktop
pub const DEFAULT_HASH_KEYS: [&str; 4] = ["88b3a2e13", "XzUhGYdFp", "NoCanLook", "QJhwzAtXL"];

/// Immutable table of hash constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashKeyTable {
    keys: Arc<[String]>,
}

impl HashKeyTable {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for HashKeyTable {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_KEYS)
    }
}

/// 16-byte AES key that decrypts a volume's page keys
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DerivedDeviceKey([u8; 16]);

impl DerivedDeviceKey {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for DerivedDeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedDeviceKey(..)")
    }
}

/// `hex(SHA256(constant ‖ mac))`
pub fn device_id(constant: &str, mac: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(constant.as_bytes());
    hasher.update(mac.as_bytes());
    hex::encode(hasher.finalize())
}

/// Last 16 bytes of `SHA256(device_id ‖ user_id)`
pub fn derive_key(constant: &str, mac: &str, user_id: &str) -> DerivedDeviceKey {
    let mut hasher = Sha256::new();
    hasher.update(device_id(constant, mac).as_bytes());
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[16..32]);
    DerivedDeviceKey(key)
}

/// One candidate with the inputs that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: DerivedDeviceKey,
    pub constant: String,
    pub mac: String,
    pub user_id: String,
}

/// Produces candidate keys from the hash table
#[derive(Debug, Clone, Default)]
pub struct DeviceKeyDeriver {
    table: HashKeyTable,
}

impl DeviceKeyDeriver {
    pub fn new(table: HashKeyTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &HashKeyTable {
        &self.table
    }

    /// Lazy candidate sequence: constant outer, MAC middle, user id inner
    ///
    /// Yields `constants × macs × user_ids` items, none when any input is
    /// empty. A clone continues from the same position; a fresh call starts
    /// over.
    pub fn candidates(&self, macs: &[String], user_ids: &[String]) -> Candidates {
        Candidates {
            constants: self.table.keys.clone(),
            macs: macs.into(),
            user_ids: user_ids.into(),
            position: 0,
        }
    }
}

/// Iterator over candidate keys, cheap to clone
#[derive(Debug, Clone)]
pub struct Candidates {
    constants: Arc<[String]>,
    macs: Arc<[String]>,
    user_ids: Arc<[String]>,
    position: usize,
}

impl Candidates {
    fn total(&self) -> usize {
        self.constants.len() * self.macs.len() * self.user_ids.len()
    }
}

impl Iterator for Candidates {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        if self.position >= self.total() {
            return None;
        }

        let per_constant = self.macs.len() * self.user_ids.len();
        let constant = &self.constants[self.position / per_constant];
        let mac = &self.macs[(self.position % per_constant) / self.user_ids.len()];
        let user_id = &self.user_ids[self.position % self.user_ids.len()];
        self.position += 1;

        Some(Candidate {
            key: derive_key(constant, mac, user_id),
            constant: constant.clone(),
            mac: mac.clone(),
            user_id: user_id.clone(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Candidates {}
