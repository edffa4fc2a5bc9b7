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


//! `.acsm` voucher parsing
//!
//! A voucher is an ADEPT `fulfillmentToken` document. Only `transaction` and
//! `operatorURL` are required; everything else is carried for display or
//! copied verbatim into the fulfillment request.

use crate::adept::xml::{self, Element};
use crate::error::{LoaderError, Result};
use serde::Serialize;
use std::path::Path;

/// Descriptive metadata from `resourceItemInfo/metadata`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VoucherMetadata {
    pub title: Option<String>,
    pub creator: Option<String>,
    pub publisher: Option<String>,
    /// MIME type, e.g. `application/epub+zip` or `application/pdf`
    pub format: Option<String>,
}

impl VoucherMetadata {
    pub(crate) fn from_element(metadata: Option<&Element>) -> Self {
        let Some(metadata) = metadata else {
            return Self::default();
        };
        Self {
            title: metadata.find_text("title"),
            creator: metadata.find_text("creator"),
            publisher: metadata.find_text("publisher"),
            format: metadata.find_text("format"),
        }
    }
}

/// Parsed download voucher
#[derive(Debug, Clone, PartialEq)]
pub struct Voucher {
    /// Purchase reference, consumed at most once server-side
    pub transaction_id: String,
    /// Fulfillment server base URL
    pub operator_url: String,
    pub distributor: Option<String>,
    pub resource_id: Option<String>,
    pub expiration: Option<String>,
    pub metadata: VoucherMetadata,
    token: Element,
}

impl Voucher {
    /// Parse voucher XML
    ///
    /// # Errors
    /// `InvalidVoucher` for malformed XML, a root other than
    /// `fulfillmentToken`, or a missing `transaction` / `operatorURL`.
    pub fn parse(text: &str) -> Result<Self> {
        let token = xml::parse(text).map_err(|e| LoaderError::InvalidVoucher(e.to_string()))?;
        Self::from_element(token)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let token = xml::parse_bytes(bytes).map_err(|e| LoaderError::InvalidVoucher(e.to_string()))?;
        Self::from_element(token)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoaderError::FileNotFound(path.display().to_string()));
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    fn from_element(token: Element) -> Result<Self> {
        if token.local_name() != "fulfillmentToken" {
            return Err(LoaderError::InvalidVoucher(format!(
                "root element is <{}>, expected <fulfillmentToken>",
                token.local_name()
            )));
        }

        let transaction_id = token
            .child("transaction")
            .map(Element::text)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LoaderError::InvalidVoucher("missing <transaction>".to_string()))?;

        let operator_url = token
            .child("operatorURL")
            .map(Element::text)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LoaderError::InvalidVoucher("missing <operatorURL>".to_string()))?;

        url::Url::parse(&operator_url).map_err(|e| {
            LoaderError::InvalidVoucher(format!("operatorURL '{}' is not a URL: {}", operator_url, e))
        })?;

        let resource_info = token.child("resourceItemInfo");

        Ok(Self {
            transaction_id,
            operator_url,
            distributor: token.child("distributor").map(Element::text),
            resource_id: resource_info.and_then(|r| r.find_text("resource")),
            expiration: token.child("expiration").map(Element::text),
            metadata: VoucherMetadata::from_element(resource_info.and_then(|r| r.child("metadata"))),
            token,
        })
    }

    /// The `fulfillmentToken` element, embedded verbatim in requests
    pub fn token(&self) -> &Element {
        &self.token
    }

    /// `{operatorURL}/Fulfill`
    pub fn fulfill_url(&self) -> String {
        format!("{}/Fulfill", self.operator_url.trim_end_matches('/'))
    }

    /// Title for display, falling back to the transaction id
    pub fn display_title(&self) -> &str {
        self.metadata
            .title
            .as_deref()
            .unwrap_or(&self.transaction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACSM: &str = r#"<?xml version="1.0"?>
<fulfillmentToken fulfillmentType="buy" auth="user" xmlns="http://ns.adobe.com/adept">
  <distributor>urn:uuid:00000000-0000-0000-0000-000000000001</distributor>
  <operatorURL>https://acs.example.com/fulfillment/</operatorURL>
  <transaction>T1</transaction>
  <expiration>2030-01-01T00:00:00+00:00</expiration>
  <resourceItemInfo>
    <resource>urn:uuid:00000000-0000-0000-0000-000000000002</resource>
    <resourceItem>0</resourceItem>
    <metadata>
      <dc:title xmlns:dc="http://purl.org/dc/elements/1.1/">The Book</dc:title>
      <dc:creator xmlns:dc="http://purl.org/dc/elements/1.1/">An Author</dc:creator>
      <dc:format xmlns:dc="http://purl.org/dc/elements/1.1/">application/epub+zip</dc:format>
    </metadata>
  </resourceItemInfo>
  <hmac>AAAA</hmac>
</fulfillmentToken>"#;

    #[test]
    fn test_parse_voucher() {
        let voucher = Voucher::parse(ACSM).unwrap();
        assert_eq!(voucher.transaction_id, "T1");
        assert_eq!(voucher.fulfill_url(), "https://acs.example.com/fulfillment/Fulfill");
        assert_eq!(voucher.metadata.title.as_deref(), Some("The Book"));
        assert_eq!(voucher.metadata.creator.as_deref(), Some("An Author"));
        assert_eq!(voucher.metadata.format.as_deref(), Some("application/epub+zip"));
        assert_eq!(
            voucher.resource_id.as_deref(),
            Some("urn:uuid:00000000-0000-0000-0000-000000000002")
        );
    }

    #[test]
    fn test_missing_transaction() {
        let xml = ACSM.replace("<transaction>T1</transaction>", "");
        assert!(matches!(Voucher::parse(&xml), Err(LoaderError::InvalidVoucher(_))));
    }

    #[test]
    fn test_missing_operator() {
        let xml = ACSM.replace("<operatorURL>https://acs.example.com/fulfillment/</operatorURL>", "");
        assert!(matches!(Voucher::parse(&xml), Err(LoaderError::InvalidVoucher(_))));
    }

    #[test]
    fn test_wrong_root() {
        assert!(matches!(
            Voucher::parse("<html><body/></html>"),
            Err(LoaderError::InvalidVoucher(_))
        ));
    }

    #[test]
    fn test_not_xml() {
        assert!(matches!(Voucher::parse("<<<"), Err(LoaderError::InvalidVoucher(_))));
    }
}
