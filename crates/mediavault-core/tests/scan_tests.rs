mod common;

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use mediavault_core::backend::MemoryObjectClient;
use mediavault_core::error::RemoteErrorKind;
use mediavault_core::hasher::{hash_bytes, hash_file};
use mediavault_core::storage::models::Location;
use mediavault_core::{Analysis, ContentHash, NoAnalyzer, Scanner, SilentReporter};
use tempfile::tempdir;

#[test]
fn test_scan_records_files_and_skips_temp_and_ignored() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("fast");
    write_file(&root, "2024/beach.jpg", b"waves", days_ago(3));
    write_file(&root, "2024/trip/notes.md", b"packing list", days_ago(3));
    write_file(&root, "2024/.beach.jpg.mvpart-9-1", b"half a fi", days_ago(0));
    write_file(&root, "cache/thumb.tmp", b"thumbnail", days_ago(0));
    write_file(&root, "empty.jpg", b"", days_ago(0));

    let mut config = test_config(vec![local("fast", &root, 10, vec![])]);
    config.scan.ignore_patterns = vec!["**/*.tmp".to_string()];
    let vault = vault_with(config);

    let summary = vault.scan("fast").unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.counter("inserted"), 2);

    let registry = vault.registry();
    let beach = hash_file(&root.join("2024/beach.jpg")).unwrap();
    let copies = registry.observations(&beach).unwrap();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].path, "2024/beach.jpg");
    assert_eq!(copies[0].size, 5);
    assert_eq!(registry.stats().unwrap().live_observations, 2);
}

#[test]
fn test_rescan_reuses_cached_identity() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("fast");
    write_file(&root, "a.jpg", b"alpha", days_ago(1));
    write_file(&root, "b.jpg", b"bravo", days_ago(1));
    let vault = vault(vec![local("fast", &root, 10, vec![])]);

    let first = vault.scan("fast").unwrap();
    assert_eq!(first.counter("quick_identity"), 0);

    let second = vault.scan("fast").unwrap();
    assert_eq!(second.succeeded, 2);
    assert_eq!(second.counter("quick_identity"), 2);
    assert_eq!(second.counter("unchanged"), 2);
}

#[test]
fn test_force_rehash_bypasses_cache() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("fast");
    write_file(&root, "a.jpg", b"alpha", days_ago(1));
    let mut config = test_config(vec![local("fast", &root, 10, vec![])]);
    config.scan.force_rehash = true;
    let vault = vault_with(config);

    vault.scan("fast").unwrap();
    let second = vault.scan("fast").unwrap();
    assert_eq!(second.counter("quick_identity"), 0);
    assert_eq!(second.succeeded, 1);
}

#[test]
fn test_deleted_and_rewritten_files() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("fast");
    let doomed = write_file(&root, "doomed.jpg", b"short lived", days_ago(2));
    let edited = write_file(&root, "edited.txt", b"version one", days_ago(2));
    let vault = vault(vec![local("fast", &root, 10, vec![])]);
    vault.scan("fast").unwrap();
    let v1 = hash_bytes(b"version one");

    fs::remove_file(&doomed).unwrap();
    fs::write(&edited, b"version two!").unwrap();
    let summary = vault.scan("fast").unwrap();
    assert_eq!(summary.counter("missing"), 1);
    assert_eq!(summary.counter("replaced"), 1);

    let registry = vault.registry();
    let missing = registry.find_missing("fast").unwrap();
    assert_eq!(missing.len(), 2);
    assert!(missing.iter().any(|o| o.path == "doomed.jpg"));
    assert!(missing.iter().any(|o| o.path == "edited.txt" && o.content_hash == v1));
    assert_eq!(
        registry
            .observation_at_path("fast", "edited.txt")
            .unwrap()
            .unwrap()
            .content_hash,
        hash_bytes(b"version two!")
    );
}

#[test]
fn test_analyzer_runs_once_per_asset() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("fast");
    write_file(&root, "a.jpg", b"alpha", days_ago(1));
    write_file(&root, "b.jpg", b"bravo", days_ago(1));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let analyzer = move |_: &Location, path: &str, _: &ContentHash| {
        counter.fetch_add(1, Ordering::SeqCst);
        Some(Analysis {
            tags: [format!("file:{}", path)].into_iter().collect(),
            perceptual_hash: Some(0xABCD),
            quality_score: Some(0.75),
        })
    };
    let vault = vault(vec![local("fast", &root, 10, vec![])]).with_analyzer(Arc::new(analyzer));

    vault.scan("fast").unwrap();
    vault.scan("fast").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let asset = vault
        .registry()
        .asset(&hash_bytes(b"alpha"))
        .unwrap();
    assert!(asset.tags.contains("file:a.jpg"));
    assert_eq!(asset.quality_score, Some(0.75));
    assert_eq!(vault.registry().perceptual_hashes().unwrap().len(), 2);
}

#[test]
fn test_cancelled_scan_marks_nothing_missing() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("fast");
    write_file(&root, "a.jpg", b"alpha", days_ago(1));
    let vault = vault(vec![local("fast", &root, 10, vec![])]);
    vault.scan("fast").unwrap();

    vault.cancel();
    let summary = vault.scan("fast").unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.succeeded, 0);
    assert!(vault.registry().find_missing("fast").unwrap().is_empty());
}

#[test]
fn test_object_store_scan_and_truncated_listing() {
    let client = Arc::new(MemoryObjectClient::new().with_page_size(2));
    let mtime = days_ago(5);
    client.insert("media", "photos/a.jpg", b"alpha", mtime);
    client.insert("media", "photos/b.jpg", b"bravo", mtime);
    client.insert("media", "photos/c.jpg", b"charlie", mtime);
    client.insert("media", "other/skip.jpg", b"outside prefix", mtime);

    let vault = vault(vec![object_store("cloud", "media/photos", 10, vec![])])
        .with_client("cloud", client.clone());

    let summary = vault.scan("cloud").unwrap();
    assert_eq!(summary.succeeded, 3);
    let copy = vault
        .registry()
        .observation_at_path("cloud", "c.jpg")
        .unwrap()
        .unwrap();
    assert_eq!(copy.content_hash, hash_bytes(b"charlie"));

    // The listing breaks before finishing; nothing may be marked missing.
    client.fail_next(RemoteErrorKind::Transient);
    let summary = vault.scan("cloud").unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    assert!(vault.registry().find_missing("cloud").unwrap().is_empty());
}

#[test]
fn test_object_store_without_client_is_a_configuration_error() {
    let vault = vault(vec![object_store("cloud", "media", 10, vec![])]);
    let err = vault.scan("cloud").unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_records_are_lazy_and_restartable() {
    let client = Arc::new(MemoryObjectClient::new());
    let mtime = days_ago(2);
    client.insert("media", "a.jpg", b"alpha", mtime);
    client.insert("media", "b.jpg", b"bravo", mtime);
    client.insert("media", "c.jpg", b"charlie", mtime);
    let vault = vault(vec![object_store("cloud", "media", 10, vec![])])
        .with_client("cloud", client.clone());

    let cancel = AtomicBool::new(false);
    let scanner = Scanner::new(
        vault.registry(),
        vault.backends(),
        &NoAnalyzer,
        &SilentReporter,
        &cancel,
    );
    let location = vault.registry().location("cloud").unwrap();
    let backend = vault.backends().for_location(&location).unwrap();

    let before = client.call_count();
    let mut records = scanner.records(&location, &backend).unwrap();
    assert_eq!(client.call_count(), before);

    let first = records.next().unwrap().unwrap();
    assert_eq!(first.path, "a.jpg");
    assert_eq!(first.content_hash, hash_bytes(b"alpha"));
    assert_eq!(first.size, 5);
    // one listing page and one read
    assert_eq!(client.call_count(), before + 2);

    client.fail_next(RemoteErrorKind::PermissionDenied);
    assert!(records.next().unwrap().is_err());
    let third = records.next().unwrap().unwrap();
    assert_eq!(third.path, "c.jpg");
    assert!(records.next().is_none());
    drop(records);

    let again: Vec<String> = scanner
        .records(&location, &backend)
        .unwrap()
        .map(|record| record.unwrap().path)
        .collect();
    assert_eq!(again, vec!["a.jpg", "b.jpg", "c.jpg"]);
    assert_eq!(vault.registry().stats().unwrap().live_observations, 0);
}

#[test]
fn test_file_changing_during_scan_is_flagged_for_verification() {
    let client = Arc::new(MemoryObjectClient::new());
    client.insert("media", "clip.mp4", b"first cut", days_ago(2));
    client.rewrite_on_next_get("media", "clip.mp4", b"final cut, longer");
    let vault = vault(vec![object_store("cloud", "media", 10, vec![])])
        .with_client("cloud", client.clone());

    let summary = vault.scan("cloud").unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.counter("needs_verify"), 1);

    let registry = vault.registry();
    let copy = registry.observation_at_path("cloud", "clip.mp4").unwrap().unwrap();
    assert_eq!(copy.content_hash, hash_bytes(b"final cut, longer"));
    assert_eq!(copy.size, 17);
    assert!(copy.needs_verify);
    assert_eq!(
        registry.verification_candidates().unwrap(),
        vec![copy.content_hash.clone()]
    );

    let verified = vault.verify(None).unwrap();
    assert_eq!(verified.failed, 0);
    assert!(registry.verification_candidates().unwrap().is_empty());

    let rescan = vault.scan("cloud").unwrap();
    assert_eq!(rescan.counter("quick_identity"), 1);
    assert_eq!(rescan.counter("needs_verify"), 0);
}

/// ID3v2.4 tag of `tag_len` bytes followed by three MPEG-1 Layer III frames.
fn mp3(tag_len: usize) -> Vec<u8> {
    let mut data = b"ID3\x04\x00\x00\x00\x00".to_vec();
    data.extend_from_slice(&[((tag_len >> 7) & 0x7F) as u8, (tag_len & 0x7F) as u8]);
    data.resize(10 + tag_len, 0);
    for frame in 0..3u8 {
        data.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        data.extend((0..413u32).map(|i| (i as u8) ^ frame));
    }
    data
}

#[test]
fn test_retagged_audio_keeps_identity_at_new_size() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("music");
    let song = write_file(&root, "song.mp3", &mp3(32), days_ago(3));
    let vault = vault(vec![local("music", &root, 10, vec![])]);
    vault.scan("music").unwrap();
    let hash = hash_file(&song).unwrap();

    fs::write(&song, mp3(512)).unwrap();
    set_mtime(&song, days_ago(1));
    assert_eq!(hash_file(&song).unwrap(), hash);

    let summary = vault.scan("music").unwrap();
    assert_eq!(summary.counter("size_mismatch"), 1);
    assert_eq!(summary.counter("quick_identity"), 0);

    let registry = vault.registry();
    let copies = registry.observations(&hash).unwrap();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].size, (10 + 512 + 3 * 417) as u64);
    assert!(!copies[0].needs_verify);
    assert_eq!(registry.stats().unwrap().assets, 1);
}
