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


//! ADEPT request signatures
//!
//! Requests sent to an ADEPT operator carry an `adept:signature` element. The
//! signature is computed over a SHA-1 digest of a canonical serialization of
//! the element tree (not of the XML text), then signed with the device's
//! license private key using PKCS#1 v1.5 without a DigestInfo prefix.
//!
//! # Tree hash encoding
//! Each element contributes, in order:
//! - `NS_TAG`, namespace string, local name string
//! - for each attribute (sorted by name, `xmlns` declarations excluded):
//!   `ATTRIBUTE`, empty namespace string, name string, value string
//! - `CHILD`
//! - for each child: trimmed text as `TEXT` + string (split into chunks of at
//!   most 0x7fff bytes), or the child element recursively
//! - `END_TAG`
//!
//! Strings are written as a 2-byte big-endian length followed by the bytes.
//! `hmac` and `signature` elements in the ADEPT namespace are skipped entirely.

use crate::adept::xml::{Element, Node, ADEPT_NS};
use crate::error::{LoaderError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

const ASN_NS_TAG: u8 = 1;
const ASN_CHILD: u8 = 2;
const ASN_END_TAG: u8 = 3;
const ASN_TEXT: u8 = 4;
const ASN_ATTRIBUTE: u8 = 5;

const MAX_TEXT_CHUNK: usize = 0x7fff;

/// SHA-1 digest of the canonical element tree
pub fn tree_hash(element: &Element) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hash_element(element, &mut hasher);
    hasher.finalize().into()
}

/// Sign an element tree, returning the base64 signature value
///
/// # Errors
/// Returns `InvalidCredential` when the key is too small for the digest.
pub fn sign(element: &Element, key: &RsaPrivateKey) -> Result<String> {
    let digest = tree_hash(element);
    let signature = key
        .sign(Pkcs1v15Sign::new_unprefixed(), &digest)
        .map_err(|e| LoaderError::InvalidCredential(format!("Cannot sign request: {}", e)))?;
    Ok(BASE64.encode(signature))
}

/// Verify a base64 signature against an element tree
pub fn verify(element: &Element, signature_b64: &str, key: &RsaPublicKey) -> bool {
    let Ok(signature) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let digest = tree_hash(element);
    key.verify(Pkcs1v15Sign::new_unprefixed(), &digest, &signature)
        .is_ok()
}

/// Sign `element` and append the `adept:signature` child
pub fn append_signature(element: &mut Element, key: &RsaPrivateKey) -> Result<()> {
    let signature = sign(element, key)?;
    element.push(Element::adept("signature").with_text(signature));
    Ok(())
}

fn is_skipped(element: &Element) -> bool {
    element.namespace.as_deref() == Some(ADEPT_NS)
        && matches!(element.local_name(), "hmac" | "signature")
}

fn hash_element(element: &Element, hasher: &mut Sha1) {
    if is_skipped(element) {
        return;
    }

    hasher.update([ASN_NS_TAG]);
    append_string(hasher, element.namespace.as_deref().unwrap_or("").as_bytes());
    append_string(hasher, element.local_name().as_bytes());

    let mut attributes: Vec<_> = element
        .attributes
        .iter()
        .filter(|a| !a.is_namespace_decl())
        .collect();
    attributes.sort_by(|a, b| a.local_name().cmp(b.local_name()));

    for attr in attributes {
        hasher.update([ASN_ATTRIBUTE]);
        append_string(hasher, b"");
        append_string(hasher, attr.local_name().as_bytes());
        append_string(hasher, attr.value.as_bytes());
    }

    hasher.update([ASN_CHILD]);

    for child in &element.children {
        match child {
            Node::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                for chunk in text.as_bytes().chunks(MAX_TEXT_CHUNK) {
                    hasher.update([ASN_TEXT]);
                    append_string(hasher, chunk);
                }
            }
            Node::Element(e) => hash_element(e, hasher),
        }
    }

    hasher.update([ASN_END_TAG]);
}

fn append_string(hasher: &mut Sha1, bytes: &[u8]) {
    let len = bytes.len() as u16;
    hasher.update(len.to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adept::xml;
    use crate::test_support::rsa_key;

    #[test]
    fn test_hash_ignores_prefix_and_whitespace() {
        let a = xml::parse(
            r#"<adept:fulfill xmlns:adept="http://ns.adobe.com/adept"><adept:user> u1 </adept:user></adept:fulfill>"#,
        )
        .unwrap();
        let b = xml::parse(
            "<fulfill xmlns=\"http://ns.adobe.com/adept\">\n  <user>u1</user>\n</fulfill>",
        )
        .unwrap();
        assert_eq!(tree_hash(&a), tree_hash(&b));
    }

    #[test]
    fn test_hash_sorts_attributes() {
        let a = Element::adept("x").with_attr("b", "2").with_attr("a", "1");
        let b = Element::adept("x").with_attr("a", "1").with_attr("b", "2");
        assert_eq!(tree_hash(&a), tree_hash(&b));
    }

    #[test]
    fn test_hash_skips_signature_and_hmac() {
        let plain = Element::adept("req").with_child(Element::adept("user").with_text("u"));
        let signed = plain
            .clone()
            .with_child(Element::adept("signature").with_text("abc"))
            .with_child(Element::adept("hmac").with_text("def"));
        assert_eq!(tree_hash(&plain), tree_hash(&signed));
    }

    #[test]
    fn test_hash_detects_text_change() {
        let a = Element::adept("user").with_text("u1");
        let b = Element::adept("user").with_text("u2");
        assert_ne!(tree_hash(&a), tree_hash(&b));
    }

    #[test]
    fn test_sign_then_verify() {
        let key = rsa_key();
        let mut request = Element::adept("fulfill")
            .with_child(Element::adept("user").with_text("urn:uuid:1"));
        append_signature(&mut request, key).unwrap();

        let signature = request.child("signature").unwrap().text();
        assert!(verify(&request, &signature, &key.to_public_key()));

        let mut tampered = request.clone();
        tampered.push(Element::adept("device").with_text("x"));
        assert!(!verify(&tampered, &signature, &key.to_public_key()));
    }
}
