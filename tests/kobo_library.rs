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


//! Kobo library enumeration and volume decryption end to end

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use book_loader::kobo::keys::{derive_key, DEFAULT_HASH_KEYS};
use book_loader::kobo::library::KEPUB_DIR;
use book_loader::kobo::{self, decrypt_library, DerivedDeviceKey, DeviceKeyDeriver, HashKeyTable, KoboLibrary};
use book_loader::LoaderError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::io::{Read, Write};
use std::path::Path;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

const PAGE: &[u8] = b"<?xml version=\"1.0\"?><html><body>page</body></html>";
const MACS: [&str; 3] = ["00:11:22:33:44:55", "66:77:88:99:AA:BB", "CC:DD:EE:FF:00:11"];
const USERS: [&str; 2] = ["user-one", "user-two"];

fn ecb_encrypt(key: &[u8], data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new_from_slice(key).unwrap();
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    out
}

fn padded(data: &[u8]) -> Vec<u8> {
    let n = 16 - data.len() % 16;
    let mut out = data.to_vec();
    out.extend(std::iter::repeat(n as u8).take(n));
    out
}

/// Writes `kepub/<volume>` and returns its page keys, wrapped for `user_key`
fn write_volume(kobo_dir: &Path, volume: &str, user_key: Option<&DerivedDeviceKey>) -> Vec<(String, Vec<u8>)> {
    let kepub = kobo_dir.join(KEPUB_DIR);
    std::fs::create_dir_all(&kepub).unwrap();
    let mut zip = ZipWriter::new(std::fs::File::create(kepub.join(volume)).unwrap());
    let options = SimpleFileOptions::default();
    zip.start_file("mimetype", options).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();

    let mut keys = Vec::new();
    zip.start_file("OEBPS/page.xhtml", options).unwrap();
    match user_key {
        Some(user_key) => {
            let page_key = [9u8; 16];
            zip.write_all(&ecb_encrypt(&page_key, &padded(PAGE))).unwrap();
            keys.push(("OEBPS/page.xhtml".to_string(), ecb_encrypt(user_key.as_bytes(), &page_key)));
        }
        None => zip.write_all(PAGE).unwrap(),
    }
    zip.finish().unwrap();
    keys
}

async fn write_database(kobo_dir: &Path, volumes: &[(&str, &str, Vec<(String, Vec<u8>)>)]) {
    let opts = SqliteConnectOptions::new()
        .filename(kobo_dir.join("Kobo.sqlite"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(opts).await.unwrap();
    for ddl in [
        "CREATE TABLE content (ContentID TEXT PRIMARY KEY, Title TEXT, Attribution TEXT)",
        "CREATE TABLE content_keys (volumeid TEXT, elementid TEXT, elementkey TEXT)",
        "CREATE TABLE user (UserID TEXT)",
    ] {
        sqlx::query(ddl).execute(&pool).await.unwrap();
    }
    for (volume, title, keys) in volumes {
        sqlx::query("INSERT INTO content VALUES (?, ?, 'Somebody')")
            .bind(*volume)
            .bind(*title)
            .execute(&pool)
            .await
            .unwrap();
        for (element, key) in keys {
            sqlx::query("INSERT INTO content_keys VALUES (?, ?, ?)")
                .bind(*volume)
                .bind(element.as_str())
                .bind(BASE64.encode(key))
                .execute(&pool)
                .await
                .unwrap();
        }
    }
    for user in USERS {
        sqlx::query("INSERT INTO user VALUES (?)").bind(user).execute(&pool).await.unwrap();
    }
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&pool).await.unwrap();
    pool.close().await;
}

fn page_of(path: &Path) -> Vec<u8> {
    let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut data = Vec::new();
    archive.by_name("OEBPS/page.xhtml").unwrap().read_to_end(&mut data).unwrap();
    data
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[test]
fn test_candidates_cover_every_combination_in_order() {
    let deriver = DeviceKeyDeriver::default();
    let candidates: Vec<_> = deriver.candidates(&strings(&MACS), &strings(&USERS)).collect();

    assert_eq!(candidates.len(), DEFAULT_HASH_KEYS.len() * MACS.len() * USERS.len());
    assert_eq!(candidates[0].constant, DEFAULT_HASH_KEYS[0]);
    assert_eq!(candidates[0].mac, MACS[0]);
    assert_eq!(candidates[1].user_id, USERS[1]);
    assert_eq!(candidates[2].mac, MACS[1]);
    assert_eq!(candidates[6].constant, DEFAULT_HASH_KEYS[1]);
    assert_eq!(candidates[5].key, derive_key(DEFAULT_HASH_KEYS[0], MACS[2], USERS[1]));

    let single = DeviceKeyDeriver::new(HashKeyTable::new(["only"]));
    let pairs: Vec<_> = single
        .candidates(&strings(&MACS), &strings(&USERS))
        .map(|c| (c.mac, c.user_id))
        .collect();
    assert_eq!(pairs.len(), 6);
    assert_eq!(pairs[0], (MACS[0].to_string(), USERS[0].to_string()));
    assert_eq!(pairs[5], (MACS[2].to_string(), USERS[1].to_string()));
}

#[tokio::test]
async fn test_library_decrypts_planted_volume() {
    let dir = TempDir::new().unwrap();
    let user_key = derive_key(DEFAULT_HASH_KEYS[1], MACS[2], USERS[1]);
    let protected = write_volume(dir.path(), "vol-drm", Some(&user_key));
    let wrong = write_volume(dir.path(), "vol-other", Some(&derive_key("elsewhere", MACS[0], "nobody")));
    write_volume(dir.path(), "vol-free", None);
    write_database(
        dir.path(),
        &[
            ("vol-drm", "Planted", protected),
            ("vol-other", "Unreachable", wrong),
            ("vol-free", "Free Book", Vec::new()),
        ],
    )
    .await;

    let library = KoboLibrary::open(dir.path()).await.unwrap();
    let volumes = library.volumes().await.unwrap();
    let user_ids = library.user_ids().await.unwrap();
    library.close().await;

    let titles: Vec<_> = volumes.iter().map(|v| v.title.as_str()).collect();
    assert_eq!(titles, vec!["Free Book", "Planted", "Unreachable"]);
    assert!(!volumes[0].has_drm);
    assert_eq!(user_ids, strings(&USERS));

    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    let candidates = DeviceKeyDeriver::default().candidates(&strings(&MACS), &user_ids);
    let outcomes = decrypt_library(volumes, candidates, out.clone(), 2).await;
    assert_eq!(outcomes.len(), 3);

    let free = outcomes[0].result.as_ref().unwrap();
    assert!(free.drm_free);
    assert_eq!(page_of(&free.output), PAGE);

    let planted = outcomes[1].result.as_ref().unwrap();
    assert_eq!(planted.output, out.join("Planted.epub"));
    assert_eq!(planted.candidates_tried, 12);
    assert_eq!(planted.mac.as_deref(), Some(MACS[2]));
    assert_eq!(planted.user_id.as_deref(), Some(USERS[1]));
    assert_eq!(page_of(&planted.output), PAGE);

    assert!(matches!(outcomes[2].result, Err(LoaderError::NoValidKey { .. })));
    assert!(!out.join("Unreachable.epub").exists());
}

#[tokio::test]
async fn test_injected_hash_table_finds_custom_constant() {
    let dir = TempDir::new().unwrap();
    let user_key = derive_key("custom-constant", MACS[0], USERS[0]);
    let keys = write_volume(dir.path(), "vol-1", Some(&user_key));
    write_database(dir.path(), &[("vol-1", "Custom", keys)]).await;

    let library = KoboLibrary::open(dir.path()).await.unwrap();
    let volumes = library.volumes().await.unwrap();
    library.close().await;

    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();

    let default_run = decrypt_library(
        volumes.clone(),
        DeviceKeyDeriver::default().candidates(&strings(&MACS), &strings(&USERS)),
        out.clone(),
        1,
    )
    .await;
    assert!(default_run[0].result.is_err());

    let deriver = DeviceKeyDeriver::new(HashKeyTable::new(["custom-constant"]));
    let custom_run = decrypt_library(volumes, deriver.candidates(&strings(&MACS), &strings(&USERS)), out, 1).await;
    assert_eq!(custom_run[0].result.as_ref().unwrap().candidates_tried, 1);
}

#[tokio::test]
async fn test_decrypt_books_filters_and_copies_drm_free() {
    let dir = TempDir::new().unwrap();
    write_volume(dir.path(), "vol-free", None);
    write_volume(dir.path(), "vol-skip", None);
    write_database(
        dir.path(),
        &[("vol-free", "Free Book", Vec::new()), ("vol-skip", "Skipped", Vec::new())],
    )
    .await;

    let out = dir.path().join("out");
    let outcomes = kobo::decrypt_books(dir.path(), out.clone(), &DeviceKeyDeriver::default(), 2, &strings(&["Free Book"]))
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].volume_id, "vol-free");
    assert!(out.join("Free Book.epub").exists());
    assert!(!out.join("Skipped.epub").exists());
}

#[tokio::test]
async fn test_missing_library() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        KoboLibrary::open(dir.path()).await,
        Err(LoaderError::KoboLibraryNotFound(_))
    ));
}
