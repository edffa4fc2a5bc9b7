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


//! Device credential storage
//!
//! A credential directory holds one device authorization in one of two
//! encodings:
//!
//! | Encoding | Files |
//! |---|---|
//! | Three-file | `activation.xml`, `device.xml`, `devicesalt` |
//! | Blob | `activation.dat` |
//!
//! # Precedence
//! The three-file encoding is probed first, then the blob. The first encoding
//! that parses completely wins. A three-file set with any member missing or
//! broken is never used, so an interrupted `persist` cannot produce a
//! half-written credential.
//!
//! # activation.xml
//! ```xml
//! <activationInfo xmlns="http://ns.adobe.com/adept">
//!   <adept:credentials xmlns:adept="http://ns.adobe.com/adept">
//!     <adept:user>urn:uuid:...</adept:user>
//!     <adept:username method="AdobeID">reader@example.com</adept:username>
//!     <adept:licenseCertificate>base64 DER</adept:licenseCertificate>
//!     <adept:privateLicenseKey>base64 DER</adept:privateLicenseKey>
//!   </adept:credentials>
//!   <adept:activationToken xmlns:adept="http://ns.adobe.com/adept">
//!     <adept:device>urn:uuid:...</adept:device>
//!     <adept:fingerprint>...</adept:fingerprint>
//!     <adept:deviceType>standalone</adept:deviceType>
//!   </adept:activationToken>
//! </activationInfo>
//! ```
//! `activation.dat` carries the same `activationInfo` document, possibly
//! UTF-16 encoded, optionally with an embedded `deviceInfo`.

use crate::adept::xml::{self, Element, ADEPT_NS};
use crate::error::{LoaderError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ACTIVATION_XML: &str = "activation.xml";
pub const DEVICE_XML: &str = "device.xml";
pub const DEVICE_SALT: &str = "devicesalt";
pub const ACTIVATION_DAT: &str = "activation.dat";

/// Device salt length in bytes
pub const DEVICE_SALT_LEN: usize = 16;

/// How the device was authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// Device-only authorization, no account attached
    Anonymous,
    /// Authorization bound to a vendor account
    AccountBound,
}

impl AuthKind {
    fn from_method(method: Option<&str>) -> Self {
        match method {
            Some(m) if m.eq_ignore_ascii_case("anonymous") => AuthKind::Anonymous,
            Some(m) if !m.trim().is_empty() => AuthKind::AccountBound,
            _ => AuthKind::Anonymous,
        }
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthKind::Anonymous => f.write_str("anonymous"),
            AuthKind::AccountBound => f.write_str("account"),
        }
    }
}

/// Which on-disk encoding a credential was loaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialEncoding {
    ThreeFile,
    Blob,
    /// Built in memory, not yet persisted
    Memory,
}

/// Contents of `device.xml`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceInfo {
    pub device_class: Option<String>,
    pub device_serial: Option<String>,
    pub device_name: Option<String>,
    /// `version` entries as (name, value), e.g. ("hobbes", "9.3.58046")
    pub versions: Vec<(String, String)>,
}

impl DeviceInfo {
    pub fn version(&self, name: &str) -> Option<&str> {
        self.versions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn from_element(element: &Element) -> Self {
        let versions = element
            .elements()
            .filter(|e| e.local_name() == "version")
            .filter_map(|e| Some((e.attr("name")?.to_string(), e.attr("value")?.to_string())))
            .collect();

        Self {
            device_class: element.find_text("deviceClass"),
            device_serial: element.find_text("deviceSerial"),
            device_name: element.find_text("deviceName"),
            versions,
        }
    }
}

/// Device identity and private key
///
/// Read-only once loaded. The private key never leaves this struct except
/// through [`Credential::private_key`].
#[derive(Clone)]
pub struct Credential {
    /// `urn:uuid:` user identity
    pub user_uuid: String,
    /// `urn:uuid:` device identity
    pub device_uuid: String,
    pub device_type: String,
    pub auth_kind: AuthKind,
    pub username: Option<String>,
    /// DER license certificate
    pub license_certificate: Vec<u8>,
    pub fingerprint: Option<String>,
    pub device_salt: Option<[u8; DEVICE_SALT_LEN]>,
    pub device_info: DeviceInfo,
    /// Activation token, embedded verbatim in fulfillment requests
    pub activation_token: Option<Element>,
    pub encoding: CredentialEncoding,
    private_key: RsaPrivateKey,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_uuid", &self.user_uuid)
            .field("device_uuid", &self.device_uuid)
            .field("device_type", &self.device_type)
            .field("auth_kind", &self.auth_kind)
            .field("username", &self.username)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Build an anonymous in-memory credential
    ///
    /// The license certificate defaults to the SubjectPublicKeyInfo DER of
    /// the key's public half.
    pub fn new<U: Into<String>, D: Into<String>>(
        user_uuid: U,
        device_uuid: D,
        private_key: RsaPrivateKey,
    ) -> Self {
        let license_certificate = private_key
            .to_public_key()
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .unwrap_or_default();

        Self {
            user_uuid: user_uuid.into(),
            device_uuid: device_uuid.into(),
            device_type: "standalone".to_string(),
            auth_kind: AuthKind::Anonymous,
            username: None,
            license_certificate,
            fingerprint: None,
            device_salt: None,
            device_info: DeviceInfo::default(),
            activation_token: None,
            encoding: CredentialEncoding::Memory,
            private_key,
        }
    }

    pub fn with_username<S: Into<String>>(mut self, username: S, kind: AuthKind) -> Self {
        self.username = Some(username.into());
        self.auth_kind = kind;
        self
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// Whether `other` names the same user identity (prefix and case insensitive)
    pub fn is_user(&self, other: &str) -> bool {
        same_uuid(&self.user_uuid, other)
    }

    /// Activation token for requests, built from identity fields if none was stored
    pub fn activation_token_element(&self) -> Element {
        if let Some(token) = &self.activation_token {
            return token.clone();
        }
        let mut token = Element::adept("activationToken")
            .with_child(Element::adept("device").with_text(self.device_uuid.clone()));
        if let Some(fingerprint) = &self.fingerprint {
            token.push(Element::adept("fingerprint").with_text(fingerprint.clone()));
        }
        token
            .with_child(Element::adept("deviceType").with_text(self.device_type.clone()))
            .with_child(Element::adept("user").with_text(self.user_uuid.clone()))
    }
}

/// Strip `urn:uuid:` and lowercase
pub fn bare_uuid(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix("urn:uuid:")
        .unwrap_or(value)
        .to_ascii_lowercase()
}

/// Compare two identities, ignoring the `urn:uuid:` prefix and case
pub fn same_uuid(a: &str, b: &str) -> bool {
    bare_uuid(a) == bare_uuid(b)
}

/// Parse an RSA private key from PKCS#1 or PKCS#8 DER
pub fn parse_private_key(der: &[u8]) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_der(der)
        .or_else(|_| RsaPrivateKey::from_pkcs8_der(der))
        .map_err(|e| LoaderError::InvalidCredential(format!("Unreadable private key: {}", e)))
}

/// Credential directory accessor
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the authoritative credential
    ///
    /// # Errors
    /// `NotAuthorized` when neither encoding is present and valid. The reason
    /// names the problem found with each encoding.
    pub fn load(&self) -> Result<Credential> {
        let three_file = match self.load_three_file() {
            Ok(credential) => return Ok(credential),
            Err(e) => e,
        };
        debug!(dir = %self.dir.display(), error = %three_file, "three-file credential rejected");

        let blob = match self.load_blob() {
            Ok(credential) => return Ok(credential),
            Err(e) => e,
        };
        debug!(dir = %self.dir.display(), error = %blob, "activation.dat rejected");

        Err(LoaderError::not_authorized(format!(
            "no valid credential in {} (three-file: {}; activation.dat: {})",
            self.dir.display(),
            three_file,
            blob
        )))
    }

    /// Whether either encoding yields a valid credential
    pub fn is_authorized(&self) -> bool {
        self.load().is_ok()
    }

    /// Write the three-file encoding
    ///
    /// Any existing `activation.xml` is removed first and written last, so a
    /// crash in between leaves an incomplete (rejected) set.
    pub fn persist(&self, credential: &Credential) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let activation_path = self.dir.join(ACTIVATION_XML);
        if activation_path.exists() {
            fs::remove_file(&activation_path)?;
        }

        let salt = credential
            .device_salt
            .unwrap_or_else(rand::random::<[u8; DEVICE_SALT_LEN]>);

        write_atomic(&self.dir.join(DEVICE_XML), device_document(credential).as_bytes())?;
        write_atomic(&self.dir.join(DEVICE_SALT), &salt)?;
        write_atomic(&activation_path, activation_document(credential)?.as_bytes())?;

        debug!(dir = %self.dir.display(), "credential persisted");
        Ok(())
    }

    /// Delete every credential file; returns how many were removed
    pub fn reset(&self) -> Result<usize> {
        let mut removed = 0;
        for name in [ACTIVATION_XML, ACTIVATION_DAT, DEVICE_XML, DEVICE_SALT] {
            let path = self.dir.join(name);
            if path.exists() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn load_three_file(&self) -> Result<Credential> {
        let activation = read_required(&self.dir.join(ACTIVATION_XML))?;
        let device = read_required(&self.dir.join(DEVICE_XML))?;
        let salt = read_required(&self.dir.join(DEVICE_SALT))?;

        let salt: [u8; DEVICE_SALT_LEN] = salt.as_slice().try_into().map_err(|_| {
            LoaderError::InvalidCredential(format!(
                "{} must be {} bytes, found {}",
                DEVICE_SALT,
                DEVICE_SALT_LEN,
                salt.len()
            ))
        })?;

        let device_root = xml::parse_bytes(&device)?;
        if device_root.local_name() != "deviceInfo" {
            return Err(LoaderError::InvalidCredential(format!(
                "{} root is <{}>, expected <deviceInfo>",
                DEVICE_XML,
                device_root.local_name()
            )));
        }

        let mut credential =
            credential_from_activation(&xml::parse_bytes(&activation)?, CredentialEncoding::ThreeFile)?;
        credential.device_info = DeviceInfo::from_element(&device_root);
        if credential.fingerprint.is_none() {
            credential.fingerprint = device_root.find_text("fingerprint");
        }
        credential.device_salt = Some(salt);
        Ok(credential)
    }

    fn load_blob(&self) -> Result<Credential> {
        let blob = read_required(&self.dir.join(ACTIVATION_DAT))?;
        let root = xml::parse_bytes(&blob)?;
        let mut credential = credential_from_activation(&root, CredentialEncoding::Blob)?;
        if let Some(device) = root.find("deviceInfo") {
            credential.device_info = DeviceInfo::from_element(device);
        }
        Ok(credential)
    }
}

fn read_required(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(LoaderError::FileNotFound(path.display().to_string()));
    }
    Ok(fs::read(path)?)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| LoaderError::invalid_input(format!("Bad path {}", path.display())))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn credential_from_activation(root: &Element, encoding: CredentialEncoding) -> Result<Credential> {
    if root.local_name() != "activationInfo" {
        return Err(LoaderError::InvalidCredential(format!(
            "activation root is <{}>, expected <activationInfo>",
            root.local_name()
        )));
    }

    let credentials = root
        .find("credentials")
        .ok_or_else(|| LoaderError::InvalidCredential("missing <credentials>".to_string()))?;
    let token = root
        .find("activationToken")
        .ok_or_else(|| LoaderError::InvalidCredential("missing <activationToken>".to_string()))?;

    let user_uuid = credentials
        .child("user")
        .map(Element::text)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| LoaderError::InvalidCredential("missing credentials/user".to_string()))?;
    let device_uuid = token
        .find_text("device")
        .ok_or_else(|| LoaderError::InvalidCredential("missing activationToken/device".to_string()))?;

    for (what, value) in [("user", &user_uuid), ("device", &device_uuid)] {
        uuid::Uuid::parse_str(&bare_uuid(value)).map_err(|e| {
            LoaderError::InvalidCredential(format!("{} identity '{}' is not a UUID: {}", what, value, e))
        })?;
    }

    let key_b64 = credentials
        .find_text("privateLicenseKey")
        .ok_or_else(|| LoaderError::InvalidCredential("missing privateLicenseKey".to_string()))?;
    let private_key = parse_private_key(&BASE64.decode(strip_whitespace(&key_b64))?)?;

    let certificate_b64 = credentials
        .find_text("licenseCertificate")
        .ok_or_else(|| LoaderError::InvalidCredential("missing licenseCertificate".to_string()))?;
    let license_certificate = BASE64.decode(strip_whitespace(&certificate_b64))?;

    let username_element = credentials.child("username");

    Ok(Credential {
        user_uuid,
        device_uuid,
        device_type: token
            .find_text("deviceType")
            .unwrap_or_else(|| "standalone".to_string()),
        auth_kind: AuthKind::from_method(username_element.and_then(|e| e.attr("method"))),
        username: username_element.map(Element::text).filter(|t| !t.is_empty()),
        license_certificate,
        fingerprint: token.find_text("fingerprint"),
        device_salt: None,
        device_info: DeviceInfo::default(),
        activation_token: Some(token.clone()),
        encoding,
        private_key,
    })
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

fn activation_document(credential: &Credential) -> Result<String> {
    let key_der = credential
        .private_key
        .to_pkcs8_der()
        .map_err(|e| LoaderError::InvalidCredential(format!("Cannot encode private key: {}", e)))?;

    let mut credentials = Element::adept("credentials")
        .with_child(Element::adept("user").with_text(credential.user_uuid.clone()));
    if let Some(username) = &credential.username {
        let method = match credential.auth_kind {
            AuthKind::AccountBound => "AdobeID",
            AuthKind::Anonymous => "anonymous",
        };
        credentials.push(
            Element::adept("username")
                .with_attr("method", method)
                .with_text(username.clone()),
        );
    }
    credentials.push(
        Element::adept("licenseCertificate").with_text(BASE64.encode(&credential.license_certificate)),
    );
    credentials.push(Element::adept("privateLicenseKey").with_text(BASE64.encode(key_der.as_bytes())));

    let root = Element::new("activationInfo", Some(ADEPT_NS))
        .with_attr("xmlns", ADEPT_NS)
        .with_attr("xmlns:adept", ADEPT_NS)
        .with_child(credentials)
        .with_child(credential.activation_token_element());

    Ok(root.to_document())
}

fn device_document(credential: &Credential) -> String {
    let info = &credential.device_info;
    let mut root = Element::adept("deviceInfo")
        .with_attr("xmlns:adept", ADEPT_NS)
        .with_child(Element::adept("deviceType").with_text(credential.device_type.clone()));

    let optional = [
        ("deviceClass", &info.device_class),
        ("deviceSerial", &info.device_serial),
        ("deviceName", &info.device_name),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            root.push(Element::adept(name).with_text(value.clone()));
        }
    }
    for (name, value) in &info.versions {
        root.push(
            Element::adept("version")
                .with_attr("name", name.clone())
                .with_attr("value", value.clone()),
        );
    }
    if let Some(fingerprint) = &credential.fingerprint {
        root.push(Element::adept("fingerprint").with_text(fingerprint.clone()));
    }

    root.to_document()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use tempfile::TempDir;

    #[test]
    fn test_persist_then_load_three_file() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        let credential = test_support::credential().with_username("reader@example.com", AuthKind::AccountBound);

        store.persist(&credential).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.encoding, CredentialEncoding::ThreeFile);
        assert!(loaded.is_user(&credential.user_uuid));
        assert_eq!(loaded.device_uuid, credential.device_uuid);
        assert_eq!(loaded.auth_kind, AuthKind::AccountBound);
        assert_eq!(loaded.username.as_deref(), Some("reader@example.com"));
        assert_eq!(loaded.private_key(), credential.private_key());
        assert!(loaded.device_salt.is_some());
    }

    #[test]
    fn test_missing_username_is_anonymous() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        store.persist(&test_support::credential()).unwrap();
        assert_eq!(store.load().unwrap().auth_kind, AuthKind::Anonymous);
    }

    #[test]
    fn test_empty_directory_not_authorized() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        assert!(!store.is_authorized());
        assert!(matches!(store.load(), Err(LoaderError::NotAuthorized { .. })));
    }

    #[test]
    fn test_short_salt_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        store.persist(&test_support::credential()).unwrap();
        fs::write(dir.path().join(DEVICE_SALT), [0u8; 8]).unwrap();
        assert!(!store.is_authorized());
    }

    #[test]
    fn test_reset_removes_everything() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        store.persist(&test_support::credential()).unwrap();
        fs::write(dir.path().join(ACTIVATION_DAT), b"x").unwrap();

        assert_eq!(store.reset().unwrap(), 4);
        assert!(!store.is_authorized());
    }

    #[test]
    fn test_same_uuid_ignores_prefix_and_case() {
        assert!(same_uuid("urn:uuid:ABCDEF00-0000-0000-0000-000000000000", "abcdef00-0000-0000-0000-000000000000"));
        assert!(!same_uuid("urn:uuid:1", "urn:uuid:2"));
    }

    #[test]
    fn test_auth_kind_from_method() {
        assert_eq!(AuthKind::from_method(Some("AdobeID")), AuthKind::AccountBound);
        assert_eq!(AuthKind::from_method(Some("anonymous")), AuthKind::Anonymous);
        assert_eq!(AuthKind::from_method(None), AuthKind::Anonymous);
    }
}
