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


//! Content key unwrapping
//!
//! The book key travels RSA-encrypted (PKCS#1 v1.5) under the device's
//! license certificate. Unwrapping is pure and local, so it can always be
//! repeated.
//!
//! # Failure causes
//! - `Malformed`: envelope length differs from the modulus size, or the
//!   recovered key has a size the target format cannot use
//! - `WrongKey`: padding check failed (wrapped for another device)

use crate::adept::credential::Credential;
use crate::adept::xml;
use crate::error::{LoaderError, Result, UnwrapCause};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::fmt;

/// What the key will decrypt; decides which sizes are acceptable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUse {
    /// AES-128, exactly 16 bytes
    Epub,
    /// RC4 or AES, 5 to 16 bytes plus an optional leading revision byte
    Pdf,
}

impl KeyUse {
    fn accepts(&self, len: usize) -> bool {
        match self {
            KeyUse::Epub => len == 16,
            KeyUse::Pdf => (5..=17).contains(&len),
        }
    }
}

/// Symmetric content key, memory only
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey(Vec<u8>);

impl ContentKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({} bytes)", self.0.len())
    }
}

/// Recovers content keys with a device private key
pub struct KeyUnwrapper;

impl KeyUnwrapper {
    /// Unwrap with the credential's private key
    pub fn unwrap(wrapped: &[u8], credential: &Credential, usage: KeyUse) -> Result<ContentKey> {
        Self::unwrap_with_key(wrapped, credential.private_key(), usage)
    }

    /// # Errors
    /// `KeyUnwrap { cause }` as described in the module docs
    pub fn unwrap_with_key(wrapped: &[u8], key: &RsaPrivateKey, usage: KeyUse) -> Result<ContentKey> {
        let modulus_len = key.size();
        if wrapped.len() != modulus_len {
            return Err(LoaderError::unwrap_failed(
                UnwrapCause::Malformed,
                format!(
                    "wrapped key is {} bytes, modulus is {} bytes",
                    wrapped.len(),
                    modulus_len
                ),
            ));
        }

        let plain = key
            .decrypt(Pkcs1v15Encrypt, wrapped)
            .map_err(|e| LoaderError::unwrap_failed(UnwrapCause::WrongKey, e.to_string()))?;

        if !usage.accepts(plain.len()) {
            return Err(LoaderError::unwrap_failed(
                UnwrapCause::Malformed,
                format!("recovered key has unexpected length {} for {:?}", plain.len(), usage),
            ));
        }

        Ok(ContentKey(plain))
    }
}

/// Wrap a content key for a public key (PKCS#1 v1.5)
pub fn wrap_key(key: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    public_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, key)
        .map_err(|e| LoaderError::internal(format!("Key wrap failed: {}", e)))
}

/// Extract the base64 `encryptedKey` from a license token or `rights.xml`
pub fn wrapped_key_from_rights(rights_xml: &str) -> Result<Vec<u8>> {
    let root = xml::parse(rights_xml)?;
    let encoded = if root.local_name() == "encryptedKey" {
        Some(root.text())
    } else {
        root.find_text("encryptedKey")
    };
    let encoded = encoded
        .ok_or_else(|| LoaderError::InvalidDrmFormat("rights document has no encryptedKey".to_string()))?;
    Ok(BASE64.decode(encoded.split_whitespace().collect::<String>())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{credential, other_rsa_key};

    #[test]
    fn test_round_trip() {
        let credential = credential();
        let key = [0x42u8; 16];
        let wrapped = wrap_key(&key, &credential.public_key()).unwrap();

        let unwrapped = KeyUnwrapper::unwrap(&wrapped, &credential, KeyUse::Epub).unwrap();
        assert_eq!(unwrapped.as_bytes(), &key);
    }

    #[test]
    fn test_wrong_key() {
        let credential = credential();
        let wrapped = wrap_key(&[1u8; 16], &other_rsa_key().to_public_key()).unwrap();

        match KeyUnwrapper::unwrap(&wrapped, &credential, KeyUse::Epub) {
            Err(LoaderError::KeyUnwrap { cause, .. }) => assert_eq!(cause, UnwrapCause::WrongKey),
            other => panic!("expected wrong-key, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_envelope_is_malformed() {
        let credential = credential();
        let wrapped = wrap_key(&[1u8; 16], &credential.public_key()).unwrap();

        match KeyUnwrapper::unwrap(&wrapped[1..], &credential, KeyUse::Epub) {
            Err(LoaderError::KeyUnwrap { cause, .. }) => assert_eq!(cause, UnwrapCause::Malformed),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_key_size_checked_per_use() {
        let credential = credential();
        let wrapped = wrap_key(&[9u8; 6], &credential.public_key()).unwrap();

        assert!(KeyUnwrapper::unwrap(&wrapped, &credential, KeyUse::Pdf).is_ok());
        assert!(matches!(
            KeyUnwrapper::unwrap(&wrapped, &credential, KeyUse::Epub),
            Err(LoaderError::KeyUnwrap { cause: UnwrapCause::Malformed, .. })
        ));
    }

    #[test]
    fn test_rights_extraction() {
        let rights = r#"<adept:rights xmlns:adept="http://ns.adobe.com/adept">
  <adept:licenseToken>
    <adept:encryptedKey>AQID
    BA==</adept:encryptedKey>
  </adept:licenseToken>
</adept:rights>"#;
        assert_eq!(wrapped_key_from_rights(rights).unwrap(), vec![1, 2, 3, 4]);
        assert!(wrapped_key_from_rights("<rights/>").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let key = ContentKey::new(vec![0xAA; 16]);
        assert_eq!(format!("{:?}", key), "ContentKey(16 bytes)");
    }
}
