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


//! Voucher redemption
//!
//! Exchanges a voucher for a download location and a wrapped content key.
//!
//! # Request
//! ```xml
//! <adept:fulfill xmlns:adept="http://ns.adobe.com/adept">
//!   <adept:user>urn:uuid:...</adept:user>
//!   <adept:device>urn:uuid:...</adept:device>
//!   <adept:deviceType>standalone</adept:deviceType>
//!   <fulfillmentToken ...>(voucher, verbatim)</fulfillmentToken>
//!   <adept:targetDevice>...</adept:targetDevice>
//!   <adept:nonce>...</adept:nonce>
//!   <adept:expiration>...</adept:expiration>
//!   <adept:signature>...</adept:signature>
//! </adept:fulfill>
//! ```
//!
//! # Response classification
//! | Response | Result |
//! |---|---|
//! | `envelope/fulfillmentResult` | `FulfillmentResult` |
//! | `error` with `..._ALREADY_FULFILLED_BY_ANOTHER_USER` and a foreign owner | `TransactionConflict` (terminal) |
//! | same, owner is the local user | `AlreadyFulfilled` (terminal) |
//! | any other `error` | `FulfillmentRejected` (terminal) |
//! | timeout, connection failure, 5xx | `Timeout` / `NetworkError` / `ApiRequestFailed` (retryable) |
//!
//! The request is built and signed once per `redeem` call; transport
//! retries resend the same bytes.

use crate::adept::client::{ClientConfig, OperatorClient, OperatorResponse};
use crate::adept::credential::Credential;
use crate::adept::signing;
use crate::adept::voucher::{Voucher, VoucherMetadata};
use crate::adept::xml::{self, Element, ADEPT_NS};
use crate::error::{LoaderError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;
use tracing::{info, warn};

/// Error code reported when another identity owns the transaction
pub const ALREADY_FULFILLED_BY_ANOTHER_USER: &str = "ALREADY_FULFILLED_BY_ANOTHER_USER";

/// Request validity window
const REQUEST_EXPIRATION_MINUTES: i64 = 10;

const DEFAULT_SOFTWARE_VERSION: &str = "9.3.58046";
const DEFAULT_CLIENT_OS: &str = "Windows Vista";
const DEFAULT_CLIENT_LOCALE: &str = "en";
const CLIENT_VERSION: &str = "2.0.1.78765";
const PRODUCT_NAME: &str = "ADOBE Digital Editions";

lazy_static! {
    static ref URN_UUID: Regex =
        Regex::new(r"urn:uuid:[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}")
            .unwrap();
}

/// Outcome of a successful redemption
#[derive(Debug, Clone, PartialEq)]
pub struct FulfillmentResult {
    pub transaction_id: String,
    /// Server-side fulfillment id, when reported
    pub fulfillment_id: Option<String>,
    /// Encrypted asset location
    pub download_url: String,
    /// RSA-wrapped content key
    pub wrapped_key: Vec<u8>,
    /// `licenseToken` XML (rights metadata)
    pub license_token: String,
    /// Identity the license is bound to
    pub owner_uuid: String,
    pub metadata: VoucherMetadata,
}

/// Redeems vouchers against their operator
#[derive(Debug, Clone)]
pub struct VoucherExchangeClient {
    http: OperatorClient,
}

impl VoucherExchangeClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: OperatorClient::new()?,
        })
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            http: OperatorClient::with_config(config)?,
        })
    }

    pub fn from_client(http: OperatorClient) -> Self {
        Self { http }
    }

    /// Redeem `voucher` for `credential`
    ///
    /// # Errors
    /// See the classification table in the module docs.
    pub async fn redeem(&self, voucher: &Voucher, credential: &Credential) -> Result<FulfillmentResult> {
        let body = build_fulfill_request(voucher, credential)?;
        let url = voucher.fulfill_url();

        info!(transaction = %voucher.transaction_id, operator = %voucher.operator_url, "redeeming voucher");
        let response = self.http.post_adept(&url, &body).await?;

        let result = classify_response(&response, voucher, credential);
        match &result {
            Ok(r) => info!(transaction = %r.transaction_id, owner = %r.owner_uuid, "voucher redeemed"),
            Err(e) => warn!(transaction = %voucher.transaction_id, error = %e, "redemption refused"),
        }
        result
    }

    /// Download the encrypted asset of a fulfillment to `dest`
    pub async fn download_asset(&self, result: &FulfillmentResult, dest: &Path) -> Result<u64> {
        self.http.download(&result.download_url, dest).await
    }

    /// Download from a previously recorded location
    pub async fn download_url(&self, url: &str, dest: &Path) -> Result<u64> {
        self.http.download(url, dest).await
    }
}

/// Build and sign the `adept:fulfill` request document
pub fn build_fulfill_request(voucher: &Voucher, credential: &Credential) -> Result<Vec<u8>> {
    let request = fulfill_request_element(voucher, credential)?;
    Ok(request.to_document().into_bytes())
}

fn fulfill_request_element(voucher: &Voucher, credential: &Credential) -> Result<Element> {
    let info = &credential.device_info;

    let mut target = Element::adept("targetDevice")
        .with_child(Element::adept("softwareVersion").with_text(
            info.version("hobbes").unwrap_or(DEFAULT_SOFTWARE_VERSION),
        ))
        .with_child(Element::adept("clientOS").with_text(
            info.version("clientOS").unwrap_or(DEFAULT_CLIENT_OS),
        ))
        .with_child(Element::adept("clientLocale").with_text(
            info.version("clientLocale").unwrap_or(DEFAULT_CLIENT_LOCALE),
        ))
        .with_child(Element::adept("clientVersion").with_text(CLIENT_VERSION))
        .with_child(Element::adept("deviceType").with_text(credential.device_type.clone()))
        .with_child(Element::adept("productName").with_text(PRODUCT_NAME));
    if let Some(fingerprint) = &credential.fingerprint {
        target.push(Element::adept("fingerprint").with_text(fingerprint.clone()));
    }
    target.push(credential.activation_token_element());

    let nonce: [u8; 12] = rand::random();
    let expiration = (Utc::now() + ChronoDuration::minutes(REQUEST_EXPIRATION_MINUTES))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();

    let mut request = Element::adept("fulfill")
        .with_attr("xmlns:adept", ADEPT_NS)
        .with_child(Element::adept("user").with_text(credential.user_uuid.clone()))
        .with_child(Element::adept("device").with_text(credential.device_uuid.clone()))
        .with_child(Element::adept("deviceType").with_text(credential.device_type.clone()))
        .with_child(voucher.token().clone())
        .with_child(target)
        .with_child(Element::adept("nonce").with_text(BASE64.encode(nonce)))
        .with_child(Element::adept("expiration").with_text(expiration));

    signing::append_signature(&mut request, credential.private_key())?;
    Ok(request)
}

/// Interpret an operator response
pub fn classify_response(
    response: &OperatorResponse,
    voucher: &Voucher,
    credential: &Credential,
) -> Result<FulfillmentResult> {
    let root = match xml::parse(&response.body) {
        Ok(root) => root,
        Err(e) if response.is_success() => {
            return Err(LoaderError::InvalidApiResponse {
                message: format!("Fulfillment response is not XML: {}", e),
                response_body: Some(snippet(&response.body)),
            });
        }
        Err(_) => {
            return Err(LoaderError::api_failed(
                format!("Fulfillment request failed: {}", snippet(&response.body)),
                Some(response.status),
                Some(voucher.fulfill_url()),
            ));
        }
    };

    if root.local_name() == "error" {
        return Err(classify_error(&root, voucher, credential));
    }

    let fulfillment = if root.local_name() == "fulfillmentResult" {
        Some(&root)
    } else {
        root.find("fulfillmentResult")
    };
    let fulfillment = fulfillment.ok_or_else(|| LoaderError::InvalidApiResponse {
        message: format!("Unexpected response root <{}>", root.local_name()),
        response_body: Some(snippet(&response.body)),
    })?;

    parse_fulfillment(fulfillment, voucher, credential)
}

fn classify_error(error: &Element, voucher: &Voucher, credential: &Credential) -> LoaderError {
    let data = error.attr("data").unwrap_or_default().trim().to_string();
    let code = data
        .split_whitespace()
        .next()
        .unwrap_or("E_UNKNOWN")
        .to_string();

    if !code.contains(ALREADY_FULFILLED_BY_ANOTHER_USER) {
        return LoaderError::FulfillmentRejected { code, detail: data };
    }

    match URN_UUID.find(&data).map(|m| m.as_str().to_string()) {
        Some(owner) if credential.is_user(&owner) => LoaderError::AlreadyFulfilled {
            transaction_id: voucher.transaction_id.clone(),
        },
        owner => LoaderError::TransactionConflict {
            transaction_id: voucher.transaction_id.clone(),
            owner_uuid: owner.unwrap_or_else(|| "unknown".to_string()),
            local_uuid: credential.user_uuid.clone(),
        },
    }
}

fn parse_fulfillment(
    fulfillment: &Element,
    voucher: &Voucher,
    credential: &Credential,
) -> Result<FulfillmentResult> {
    let invalid = |message: &str| LoaderError::InvalidApiResponse {
        message: message.to_string(),
        response_body: Some(snippet(&fulfillment.to_xml())),
    };

    let item = fulfillment
        .find("resourceItemInfo")
        .ok_or_else(|| invalid("fulfillmentResult without resourceItemInfo"))?;
    let download_url = item
        .child("src")
        .map(Element::text)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| invalid("resourceItemInfo without src"))?;
    let license_token = item
        .child("licenseToken")
        .ok_or_else(|| invalid("resourceItemInfo without licenseToken"))?;
    let encrypted_key = license_token
        .find_text("encryptedKey")
        .ok_or_else(|| invalid("licenseToken without encryptedKey"))?;
    let wrapped_key = BASE64.decode(encrypted_key.split_whitespace().collect::<String>())?;
    if wrapped_key.is_empty() {
        return Err(invalid("empty encryptedKey"));
    }

    let metadata = match item.child("metadata") {
        Some(m) => VoucherMetadata::from_element(Some(m)),
        None => voucher.metadata.clone(),
    };

    Ok(FulfillmentResult {
        transaction_id: voucher.transaction_id.clone(),
        fulfillment_id: fulfillment.find_text("fulfillment"),
        download_url,
        wrapped_key,
        license_token: license_token.to_xml(),
        owner_uuid: license_token
            .child("user")
            .map(Element::text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| credential.user_uuid.clone()),
        metadata,
    })
}

fn snippet(body: &str) -> String {
    body.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    const ACSM: &str = r#"<fulfillmentToken xmlns="http://ns.adobe.com/adept">
  <operatorURL>https://acs.example.com/fulfillment</operatorURL>
  <transaction>T1</transaction>
</fulfillmentToken>"#;

    fn voucher() -> Voucher {
        Voucher::parse(ACSM).unwrap()
    }

    fn response(status: u16, body: &str) -> OperatorResponse {
        OperatorResponse {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_request_is_signed_and_embeds_voucher() {
        let credential = test_support::credential();
        let request = fulfill_request_element(&voucher(), &credential).unwrap();

        let signature = request.child("signature").unwrap().text();
        assert!(signing::verify(&request, &signature, &credential.public_key()));
        assert_eq!(request.find_text("transaction").as_deref(), Some("T1"));
        assert_eq!(request.child("user").unwrap().text(), credential.user_uuid);
        assert!(request.find("activationToken").is_some());
    }

    #[test]
    fn test_success_response() {
        let credential = test_support::credential();
        let body = format!(
            r#"<envelope xmlns="http://ns.adobe.com/adept">
  <fulfillmentResult>
    <fulfillment>F-1</fulfillment>
    <resourceItemInfo>
      <src>https://cdn.example.com/book.epub</src>
      <licenseToken>
        <user>{}</user>
        <encryptedKey keyInfo="x">AQIDBA==</encryptedKey>
      </licenseToken>
    </resourceItemInfo>
  </fulfillmentResult>
</envelope>"#,
            credential.user_uuid
        );

        let result = classify_response(&response(200, &body), &voucher(), &credential).unwrap();
        assert_eq!(result.download_url, "https://cdn.example.com/book.epub");
        assert_eq!(result.wrapped_key, vec![1, 2, 3, 4]);
        assert_eq!(result.fulfillment_id.as_deref(), Some("F-1"));
        assert!(credential.is_user(&result.owner_uuid));
        assert!(result.license_token.contains("encryptedKey"));
    }

    #[test]
    fn test_foreign_owner_is_conflict() {
        let credential = test_support::credential();
        let body = r#"<error xmlns="http://ns.adobe.com/adept" data="E_LIC_ALREADY_FULFILLED_BY_ANOTHER_USER https://acs.example.com/fulfillment/Fulfill urn:uuid:99999999-9999-9999-9999-999999999999"/>"#;

        match classify_response(&response(200, body), &voucher(), &credential) {
            Err(LoaderError::TransactionConflict { owner_uuid, local_uuid, transaction_id }) => {
                assert_eq!(owner_uuid, "urn:uuid:99999999-9999-9999-9999-999999999999");
                assert_eq!(local_uuid, credential.user_uuid);
                assert_eq!(transaction_id, "T1");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_own_owner_is_already_fulfilled() {
        let credential = test_support::credential();
        let body = format!(
            r#"<error xmlns="http://ns.adobe.com/adept" data="E_LIC_ALREADY_FULFILLED_BY_ANOTHER_USER x {}"/>"#,
            credential.user_uuid.to_uppercase().replace("URN:UUID:", "urn:uuid:")
        );
        assert!(matches!(
            classify_response(&response(200, &body), &voucher(), &credential),
            Err(LoaderError::AlreadyFulfilled { .. })
        ));
    }

    #[test]
    fn test_other_error_code_rejected() {
        let credential = test_support::credential();
        let body = r#"<error xmlns="http://ns.adobe.com/adept" data="E_ADEPT_REQUEST_EXPIRED https://acs.example.com"/>"#;
        match classify_response(&response(200, body), &voucher(), &credential) {
            Err(LoaderError::FulfillmentRejected { code, .. }) => assert_eq!(code, "E_ADEPT_REQUEST_EXPIRED"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_non_xml_client_error() {
        let credential = test_support::credential();
        let err = classify_response(&response(404, "not found"), &voucher(), &credential).unwrap_err();
        assert!(matches!(err, LoaderError::ApiRequestFailed { status_code: Some(404), .. }));
        assert!(!err.is_retryable());
    }
}
