#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use mediavault_core::storage::models::{LocationKind, LocationSpec};
use mediavault_core::{AppConfig, LocationRegistry, Rule, Vault};

pub const DAY: i64 = 86_400;

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn days_ago(days: i64) -> i64 {
    now_secs() - days * DAY
}

pub fn local(name: &str, root: &Path, priority: i64, rules: Vec<Rule>) -> LocationSpec {
    LocationSpec {
        name: name.to_string(),
        kind: LocationKind::Local,
        root: root.to_string_lossy().into_owned(),
        priority,
        rules,
        default: false,
    }
}

pub fn object_store(name: &str, root: &str, priority: i64, rules: Vec<Rule>) -> LocationSpec {
    LocationSpec {
        name: name.to_string(),
        kind: LocationKind::ObjectStore,
        root: root.to_string(),
        priority,
        rules,
        default: false,
    }
}

pub fn max_age(days: i64) -> Rule {
    Rule {
        max_age_days: Some(days),
        ..Rule::default()
    }
}

pub fn min_age(days: i64) -> Rule {
    Rule {
        min_age_days: Some(days),
        ..Rule::default()
    }
}

pub fn set_mtime(path: &Path, secs: i64) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_secs(secs as u64))
        .unwrap();
}

/// Write `data` at `root/rel`, creating parents, and stamp its mtime.
pub fn write_file(root: &Path, rel: &str, data: &[u8], mtime: i64) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, data).unwrap();
    set_mtime(&path, mtime);
    path
}

/// Every file under `root`, relative and `/`-separated, sorted.
pub fn files_under(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

pub fn test_config(locations: Vec<LocationSpec>) -> AppConfig {
    let mut config = AppConfig {
        workers: 2,
        locations,
        ..AppConfig::default()
    };
    config.migration.backoff_base_ms = 0;
    config
}

pub fn vault_with(config: AppConfig) -> Vault {
    let registry = Arc::new(LocationRegistry::open_in_memory().unwrap());
    let vault = Vault::with_registry(config, registry).unwrap();
    vault.apply_locations().unwrap();
    vault
}

pub fn vault(locations: Vec<LocationSpec>) -> Vault {
    vault_with(test_config(locations))
}
