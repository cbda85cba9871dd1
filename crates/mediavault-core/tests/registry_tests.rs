use chrono::{Duration, Utc};
use std::collections::BTreeSet;

use mediavault_core::hasher::hash_bytes;
use mediavault_core::storage::models::{
    AssetQuery, LocationKind, LocationSpec, MediaType, ObservationInput, UpsertOutcome,
};
use mediavault_core::{Analysis, ContentHash, Error, LocationRegistry};

fn registry_with(names: &[&str]) -> LocationRegistry {
    let registry = LocationRegistry::open_in_memory().unwrap();
    for (i, name) in names.iter().enumerate() {
        registry
            .register_location(&LocationSpec {
                name: name.to_string(),
                kind: LocationKind::Local,
                root: format!("/srv/{}", name),
                priority: 10 * (i as i64 + 1),
                rules: vec![],
                default: false,
            })
            .unwrap();
    }
    registry
}

fn input(hash: &ContentHash, location: &str, path: &str, size: u64, mtime: i64) -> ObservationInput {
    ObservationInput {
        content_hash: hash.clone(),
        location: location.to_string(),
        path: path.to_string(),
        size,
        mtime,
        partial_hash: Some(7),
        quick_identity: false,
        needs_verify: false,
    }
}

#[test]
fn test_register_duplicate_location() {
    let registry = registry_with(&["fast"]);
    let again = LocationSpec {
        name: "fast".to_string(),
        kind: LocationKind::Local,
        root: "/elsewhere".to_string(),
        priority: 1,
        rules: vec![],
        default: false,
    };
    assert!(matches!(
        registry.register_location(&again),
        Err(Error::DuplicateLocation(name)) if name == "fast"
    ));
    assert_eq!(registry.locations().unwrap().len(), 1);
}

#[test]
fn test_upsert_is_idempotent() {
    let registry = registry_with(&["fast"]);
    let hash = hash_bytes(b"sunset");
    let obs = input(&hash, "fast", "2024/sunset.jpg", 6, 1_700_000_000);

    assert_eq!(registry.upsert_observation(&obs).unwrap(), UpsertOutcome::Inserted);
    assert_eq!(registry.upsert_observation(&obs).unwrap(), UpsertOutcome::Refreshed);

    let copies = registry.observations(&hash).unwrap();
    assert_eq!(copies.len(), 1);
    let asset = registry.find_asset(&hash).unwrap().unwrap();
    assert_eq!(asset.media_type, MediaType::Image);
    assert_eq!(asset.created_at.unwrap().timestamp(), 1_700_000_000);
}

#[test]
fn test_touch_is_not_a_conflict() {
    let registry = registry_with(&["fast"]);
    let hash = hash_bytes(b"touched");
    registry
        .upsert_observation(&input(&hash, "fast", "a.jpg", 7, 100))
        .unwrap();
    let outcome = registry
        .upsert_observation(&input(&hash, "fast", "a.jpg", 7, 200))
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Touched);
    assert!(registry.conflicts(false).unwrap().is_empty());
    assert_eq!(registry.observations(&hash).unwrap()[0].mtime, 200);
}

#[test]
fn test_size_change_under_same_identity() {
    let registry = registry_with(&["fast"]);
    let hash = hash_bytes(b"cached");
    registry
        .upsert_observation(&input(&hash, "fast", "a.mp3", 6, 100))
        .unwrap();

    assert_eq!(
        registry
            .upsert_observation(&input(&hash, "fast", "a.mp3", 60, 200))
            .unwrap(),
        UpsertOutcome::SizeMismatch
    );
    let copies = registry.observations(&hash).unwrap();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].size, 60);
    assert!(!copies[0].needs_verify);
    assert!(registry.verification_candidates().unwrap().is_empty());
}

#[test]
fn test_flagged_copy_never_serves_cached_identity() {
    let registry = registry_with(&["fast"]);
    let hash = hash_bytes(b"cached");
    let mut flagged = input(&hash, "fast", "a.mp4", 6, 100);
    flagged.needs_verify = true;
    assert_eq!(
        registry.upsert_observation(&flagged).unwrap(),
        UpsertOutcome::Inserted
    );
    assert_eq!(registry.verification_candidates().unwrap(), vec![hash.clone()]);
    assert!(registry.cached_identity("fast", "a.mp4", 6, 100).unwrap().is_none());

    // A clean full hash clears the flag.
    registry
        .upsert_observation(&input(&hash, "fast", "a.mp4", 6, 100))
        .unwrap();
    assert!(registry.verification_candidates().unwrap().is_empty());
    assert!(registry.cached_identity("fast", "a.mp4", 6, 100).unwrap().is_some());
}

#[test]
fn test_replaced_content_keeps_history() {
    let registry = registry_with(&["fast"]);
    let old = hash_bytes(b"first draft");
    let new = hash_bytes(b"second draft");
    registry
        .upsert_observation(&input(&old, "fast", "notes.md", 11, 100))
        .unwrap();
    let outcome = registry
        .upsert_observation(&input(&new, "fast", "notes.md", 12, 200))
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Replaced { previous: old.clone() });

    assert!(registry.observations(&old).unwrap().is_empty());
    let history = registry.all_observations(&old).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].missing_since.is_some());
    assert!(registry.find_asset(&old).unwrap().is_some());
    assert_eq!(
        registry.observation_at_path("fast", "notes.md").unwrap().unwrap().content_hash,
        new
    );
}

#[test]
fn test_find_missing_after_rescan() {
    let registry = registry_with(&["fast"]);
    let a = hash_bytes(b"a");
    let b = hash_bytes(b"b");

    let generation = registry.begin_scan("fast").unwrap();
    registry.upsert_observation(&input(&a, "fast", "a.jpg", 1, 1)).unwrap();
    registry.upsert_observation(&input(&b, "fast", "b.jpg", 1, 1)).unwrap();
    assert_eq!(registry.complete_scan("fast", generation).unwrap(), 0);

    let generation = registry.begin_scan("fast").unwrap();
    registry.upsert_observation(&input(&a, "fast", "a.jpg", 1, 1)).unwrap();
    assert_eq!(registry.complete_scan("fast", generation).unwrap(), 1);

    let missing = registry.find_missing("fast").unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].path, "b.jpg");
    assert!(registry.location("fast").unwrap().last_scanned_at.is_some());

    // Seeing the path again revives it.
    registry.upsert_observation(&input(&b, "fast", "b.jpg", 1, 1)).unwrap();
    assert!(registry.find_missing("fast").unwrap().is_empty());
}

#[test]
fn test_purge_missing_respects_grace() {
    let registry = registry_with(&["fast"]);
    let hash = hash_bytes(b"gone");
    let generation = registry.begin_scan("fast").unwrap();
    registry.upsert_observation(&input(&hash, "fast", "gone.jpg", 4, 1)).unwrap();
    registry.complete_scan("fast", generation).unwrap();
    let generation = registry.begin_scan("fast").unwrap();
    registry.complete_scan("fast", generation).unwrap();

    let grace = Duration::days(30);
    assert_eq!(registry.purge_missing_at(grace, Utc::now()).unwrap(), 0);
    assert_eq!(
        registry
            .purge_missing_at(grace, Utc::now() + Duration::days(31))
            .unwrap(),
        1
    );
    assert!(registry.all_observations(&hash).unwrap().is_empty());
}

#[test]
fn test_query_filters_combine_with_and() {
    let registry = registry_with(&["fast", "archive"]);
    let cat = hash_bytes(b"cat photo");
    let dog = hash_bytes(b"dog photo");
    let song = hash_bytes(b"song");
    registry.upsert_observation(&input(&cat, "fast", "cat.jpg", 9, 1_000)).unwrap();
    registry.upsert_observation(&input(&dog, "archive", "dog.jpg", 9, 2_000)).unwrap();
    registry.upsert_observation(&input(&song, "fast", "song.flac", 4, 3_000)).unwrap();

    let tagged = |tags: &[&str], quality: f64| Analysis {
        tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
        perceptual_hash: None,
        quality_score: Some(quality),
    };
    registry.record_analysis(&cat, &tagged(&["pet", "cat"], 0.9)).unwrap();
    registry.record_analysis(&dog, &tagged(&["pet", "dog"], 0.4)).unwrap();
    registry.record_analysis(&song, &tagged(&["pet"], 0.8)).unwrap();

    let hashes = |query: AssetQuery| -> Vec<ContentHash> {
        registry
            .query(&query)
            .unwrap()
            .into_iter()
            .map(|a| a.content_hash)
            .collect()
    };

    let pets = hashes(AssetQuery {
        tags: vec!["pet".to_string()],
        ..AssetQuery::default()
    });
    assert_eq!(pets.len(), 3);

    let good_pet_images = hashes(AssetQuery {
        tags: vec!["pet".to_string()],
        min_quality: Some(0.5),
        media_types: vec![MediaType::Image],
        ..AssetQuery::default()
    });
    assert_eq!(good_pet_images, vec![cat.clone()]);

    let in_archive = hashes(AssetQuery {
        location: Some("archive".to_string()),
        ..AssetQuery::default()
    });
    assert_eq!(in_archive, vec![dog.clone()]);

    let early = hashes(AssetQuery {
        created_before: Some(chrono::DateTime::<Utc>::from_timestamp(2_500, 0).unwrap()),
        ..AssetQuery::default()
    });
    assert_eq!(early.len(), 2);
    assert!(!early.contains(&song));

    assert!(registry
        .query(&AssetQuery {
            tags: vec!["pet".to_string(), "bird".to_string()],
            ..AssetQuery::default()
        })
        .unwrap()
        .is_empty());
}

#[test]
fn test_stats_and_run_log() {
    let registry = registry_with(&["fast", "archive"]);
    let hash = hash_bytes(b"x");
    registry.upsert_observation(&input(&hash, "fast", "x.jpg", 1, 1)).unwrap();
    registry.upsert_observation(&input(&hash, "archive", "x.jpg", 1, 1)).unwrap();

    let stats = registry.stats().unwrap();
    assert_eq!(stats.locations, 2);
    assert_eq!(stats.assets, 1);
    assert_eq!(stats.live_observations, 2);

    let mut summary = mediavault_core::RunSummary::new("scan");
    summary.succeed();
    registry.log_run(&summary).unwrap();
    let (_, json) = registry.last_run("scan").unwrap().unwrap();
    assert!(json.contains("\"succeeded\":1"));
    assert!(registry.last_run("migrate").unwrap().is_none());
}
