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


//! Voucher runs against a stateful mock operator

use aes::Aes128;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use book_loader::adept::credential::{Credential, CredentialStore};
use book_loader::adept::fulfill::FulfillmentResult;
use book_loader::adept::voucher::{Voucher, VoucherMetadata};
use book_loader::crypto::unwrap::wrap_key;
use book_loader::workflow::{FulfillmentMarker, MarkerStore, RunState, Stage, TransactionOrchestrator};
use book_loader::{LoaderConfig, LoaderError};
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use regex::Regex;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const BOOK_KEY: [u8; 16] = *b"fedcba9876543210";
const CHAPTER: &[u8] = b"<html><body>It was a dark and stormy night.</body></html>";
const USER_1: &str = "urn:uuid:11111111-1111-1111-1111-111111111111";
const USER_2: &str = "urn:uuid:22222222-2222-2222-2222-222222222222";

fn key(slot: usize) -> RsaPrivateKey {
    static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        (0..2).map(|_| RsaPrivateKey::new(&mut rng, 1024).unwrap()).collect()
    })[slot]
        .clone()
}

/// Binds each transaction to the first user that redeems it
struct Operator {
    base: String,
    bindings: Arc<Mutex<HashMap<String, String>>>,
    public_keys: HashMap<String, RsaPublicKey>,
    user: Regex,
    transaction: Regex,
}

impl Operator {
    fn new(base: String, bindings: Arc<Mutex<HashMap<String, String>>>) -> Self {
        let public_keys = [(USER_1, 0), (USER_2, 1)]
            .into_iter()
            .map(|(user, slot)| (user.to_string(), key(slot).to_public_key()))
            .collect();
        Self {
            base,
            bindings,
            public_keys,
            user: Regex::new(r"<(?:adept:)?user>([^<]+)</").unwrap(),
            transaction: Regex::new(r"<(?:\w+:)?transaction>([^<]+)</").unwrap(),
        }
    }
}

impl Respond for Operator {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body = String::from_utf8_lossy(&request.body);
        let user = self.user.captures(&body).unwrap()[1].to_string();
        let transaction = self.transaction.captures(&body).unwrap()[1].to_string();

        let owner = self
            .bindings
            .lock()
            .unwrap()
            .entry(transaction.clone())
            .or_insert_with(|| user.clone())
            .clone();

        if owner != user {
            return ResponseTemplate::new(200).set_body_string(format!(
                r#"<error xmlns="http://ns.adobe.com/adept" data="E_LIC_ALREADY_FULFILLED_BY_ANOTHER_USER {}/fulfillment/Fulfill {}"/>"#,
                self.base, owner
            ));
        }

        let wrapped = wrap_key(&BOOK_KEY, &self.public_keys[&user]).unwrap();
        ResponseTemplate::new(200).set_body_string(format!(
            r#"<envelope xmlns="http://ns.adobe.com/adept">
  <fulfillmentResult>
    <fulfillment>F-{tx}</fulfillment>
    <resourceItemInfo>
      <src>{base}/books/{tx}</src>
      <licenseToken>
        <user>{user}</user>
        <encryptedKey>{key}</encryptedKey>
      </licenseToken>
    </resourceItemInfo>
  </fulfillmentResult>
</envelope>"#,
            tx = transaction,
            base = self.base,
            user = user,
            key = BASE64.encode(wrapped)
        ))
    }
}

fn encrypted_epub() -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(CHAPTER).unwrap();
    let deflated = encoder.finish().unwrap();
    let iv = [7u8; 16];
    let mut part = iv.to_vec();
    part.extend(cbc::Encryptor::<Aes128>::new(&BOOK_KEY.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&deflated));

    let encryption = r#"<?xml version="1.0"?>
<encryption xmlns="urn:oasis:names:tc:opendocument:xmlns:container" xmlns:enc="http://www.w3.org/2001/04/xmlenc#">
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes128-cbc"/>
    <enc:CipherData><enc:CipherReference URI="OEBPS/chapter.xhtml"/></enc:CipherData>
  </enc:EncryptedData>
</encryption>"#;

    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    writer.start_file("mimetype", stored).unwrap();
    writer.write_all(b"application/epub+zip").unwrap();
    writer.start_file("META-INF/encryption.xml", stored).unwrap();
    writer.write_all(encryption.as_bytes()).unwrap();
    writer.start_file("OEBPS/chapter.xhtml", stored).unwrap();
    writer.write_all(&part).unwrap();
    writer.finish().unwrap().into_inner()
}

fn chapter_of(path: &Path) -> Vec<u8> {
    let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name("OEBPS/chapter.xhtml").unwrap();
    let mut data = Vec::new();
    entry.read_to_end(&mut data).unwrap();
    data
}

fn voucher(server: &MockServer, transaction: &str) -> Voucher {
    Voucher::parse(&format!(
        r#"<fulfillmentToken xmlns="http://ns.adobe.com/adept" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <distributor>urn:uuid:00000000-0000-0000-0000-000000000001</distributor>
  <operatorURL>{}/fulfillment</operatorURL>
  <transaction>{}</transaction>
  <resourceItemInfo>
    <resource>urn:uuid:resource</resource>
    <metadata><dc:title>Stormy Night</dc:title></metadata>
  </resourceItemInfo>
</fulfillmentToken>"#,
        server.uri(),
        transaction
    ))
    .unwrap()
}

/// Separate auth and work directories per identity
struct Identity {
    dir: TempDir,
    config: LoaderConfig,
}

impl Identity {
    fn new(user: &str, slot: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let config = LoaderConfig::builder()
            .auth_dir(dir.path().join("auth"))
            .work_dir(dir.path().join("work"))
            .kobo_dir(dir.path().join("kobo"))
            .request_timeout(Duration::from_secs(5))
            .max_retries(1)
            .build();
        let credential = Credential::new(user, "urn:uuid:dddddddd-0000-0000-0000-000000000000", key(slot));
        CredentialStore::new(&config.auth_dir).persist(&credential).unwrap();
        Self { dir, config }
    }

    fn output(&self) -> std::path::PathBuf {
        self.dir.path().join("out")
    }
}

async fn operator(server: &MockServer) -> Arc<Mutex<HashMap<String, String>>> {
    let bindings = Arc::new(Mutex::new(HashMap::new()));
    Mock::given(method("POST"))
        .and(path("/fulfillment/Fulfill"))
        .respond_with(Operator::new(server.uri(), bindings.clone()))
        .mount(server)
        .await;
    bindings
}

async fn serve_book(server: &MockServer, transaction: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/books/{}", transaction)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(encrypted_epub()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_fresh_run_decrypts_and_cleans_up() {
    let server = MockServer::start().await;
    operator(&server).await;
    serve_book(&server, "T1").await;

    let me = Identity::new(USER_1, 0);
    let orchestrator = TransactionOrchestrator::new(&me.config).unwrap();
    let outcome = orchestrator.run(&voucher(&server, "T1"), &me.output()).await.unwrap();

    assert!(!outcome.resumed);
    assert_eq!(outcome.output, me.output().join("Stormy Night.epub"));
    assert_eq!(chapter_of(&outcome.output), CHAPTER);
    assert_eq!(orchestrator.state(), RunState::Done);

    let markers = MarkerStore::new(&me.config.work_dir);
    assert!(markers.load("T1").unwrap().is_none());
    assert!(!me.config.work_dir.join(markers.asset_file_name("T1")).exists());
}

#[tokio::test]
async fn test_second_identity_gets_conflict() {
    let server = MockServer::start().await;
    let bindings = operator(&server).await;
    serve_book(&server, "T1").await;

    let first = Identity::new(USER_1, 0);
    TransactionOrchestrator::new(&first.config)
        .unwrap()
        .run(&voucher(&server, "T1"), &first.output())
        .await
        .unwrap();

    let second = Identity::new(USER_2, 1);
    let orchestrator = TransactionOrchestrator::new(&second.config).unwrap();
    let failure = orchestrator
        .run(&voucher(&server, "T1"), &second.output())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Redeeming);
    assert!(!failure.retryable);
    match failure.source {
        LoaderError::TransactionConflict { owner_uuid, local_uuid, .. } => {
            assert_eq!(owner_uuid, USER_1);
            assert_eq!(local_uuid, USER_2);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert!(!second.output().exists());
    assert_eq!(bindings.lock().unwrap()["T1"], USER_1);
}

#[tokio::test]
async fn test_owner_can_redeem_again() {
    let server = MockServer::start().await;
    operator(&server).await;
    serve_book(&server, "T2").await;

    let me = Identity::new(USER_1, 0);
    let orchestrator = TransactionOrchestrator::new(&me.config).unwrap();
    let first = orchestrator.run(&voucher(&server, "T2"), &me.output()).await.unwrap();
    let second = orchestrator.run(&voucher(&server, "T2"), &me.output()).await.unwrap();

    assert_ne!(first.output, second.output);
    assert_eq!(second.output, me.output().join("Stormy Night (1).epub"));
    assert_eq!(chapter_of(&second.output), CHAPTER);
}

#[tokio::test]
async fn test_persisted_asset_resumes_without_operator() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let me = Identity::new(USER_1, 0);
    let markers = MarkerStore::new(&me.config.work_dir);
    let result = FulfillmentResult {
        transaction_id: "T3".to_string(),
        fulfillment_id: Some("F-T3".to_string()),
        download_url: format!("{}/books/T3", server.uri()),
        wrapped_key: wrap_key(&BOOK_KEY, &key(0).to_public_key()).unwrap(),
        license_token: "<licenseToken/>".to_string(),
        owner_uuid: USER_1.to_string(),
        metadata: VoucherMetadata {
            title: Some("Resumed".to_string()),
            ..Default::default()
        },
    };
    let marker = FulfillmentMarker::new(&result, USER_1, markers.asset_file_name("T3"));
    std::fs::create_dir_all(&me.config.work_dir).unwrap();
    std::fs::write(markers.asset_path(&marker), encrypted_epub()).unwrap();
    markers.save(&marker).unwrap();

    let orchestrator = TransactionOrchestrator::new(&me.config).unwrap();
    let outcome = orchestrator.run(&voucher(&server, "T3"), &me.output()).await.unwrap();

    assert!(outcome.resumed);
    assert_eq!(outcome.output, me.output().join("Resumed.epub"));
    assert_eq!(chapter_of(&outcome.output), CHAPTER);
    assert!(markers.load("T3").unwrap().is_none());
}

#[tokio::test]
async fn test_marker_without_asset_downloads_again() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    serve_book(&server, "T4").await;

    let me = Identity::new(USER_1, 0);
    let markers = MarkerStore::new(&me.config.work_dir);
    let result = FulfillmentResult {
        transaction_id: "T4".to_string(),
        fulfillment_id: None,
        download_url: format!("{}/books/T4", server.uri()),
        wrapped_key: wrap_key(&BOOK_KEY, &key(0).to_public_key()).unwrap(),
        license_token: "<licenseToken/>".to_string(),
        owner_uuid: USER_1.to_string(),
        metadata: VoucherMetadata::default(),
    };
    markers
        .save(&FulfillmentMarker::new(&result, USER_1, markers.asset_file_name("T4")))
        .unwrap();

    let orchestrator = TransactionOrchestrator::new(&me.config).unwrap();
    let outcome = orchestrator.run(&voucher(&server, "T4"), &me.output()).await.unwrap();
    assert!(outcome.resumed);
    assert_eq!(outcome.output, me.output().join("T4.epub"));
}

#[tokio::test]
async fn test_operator_outage_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let me = Identity::new(USER_1, 0);
    let orchestrator = TransactionOrchestrator::new(&me.config).unwrap();
    let mut states = orchestrator.subscribe();
    let failure = orchestrator.run(&voucher(&server, "T5"), &me.output()).await.unwrap_err();

    assert_eq!(failure.stage, Stage::Redeeming);
    assert!(failure.retryable);
    assert_eq!(
        *states.borrow_and_update(),
        RunState::Failed {
            stage: Stage::Redeeming,
            retryable: true
        }
    );
    assert!(MarkerStore::new(&me.config.work_dir).load("T5").unwrap().is_none());
}

#[tokio::test]
async fn test_failed_download_then_retry_succeeds() {
    let server = MockServer::start().await;
    operator(&server).await;
    Mock::given(method("GET"))
        .and(path("/books/T6"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve_book(&server, "T6").await;

    let me = Identity::new(USER_1, 0);
    let orchestrator = TransactionOrchestrator::new(&me.config).unwrap();
    let failure = orchestrator.run(&voucher(&server, "T6"), &me.output()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Redeeming);
    assert!(failure.retryable);

    let outcome = orchestrator.run(&voucher(&server, "T6"), &me.output()).await.unwrap();
    assert!(!outcome.resumed);
    assert_eq!(chapter_of(&outcome.output), CHAPTER);
}
