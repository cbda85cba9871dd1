use crate::error::{Error, Result};
use crate::migration::{RetryPolicy, TransferMode};
use crate::storage::models::{LocationKind, LocationSpec};
use crate::sync::ResolutionStrategy;
use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub db_path: String,
    /// Size of the worker pool for scans and migrations.
    pub workers: usize,
    pub locations: Vec<LocationSpec>,
    pub scan: ScanConfig,
    pub migration: MigrationConfig,
    pub sync: SyncConfig,
    pub dedup: DedupConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "mediavault.db".to_string(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            locations: Vec::new(),
            scan: ScanConfig::default(),
            migration: MigrationConfig::default(),
            sync: SyncConfig::default(),
            dedup: DedupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Glob patterns, matched against location-relative paths.
    pub ignore_patterns: Vec<String>,
    pub remote_timeout_secs: u64,
    pub force_rehash: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            remote_timeout_secs: 30,
            force_rehash: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub default_mode: TransferMode,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 60 * 60,
            max_attempts: 3,
            backoff_base_ms: 200,
            default_mode: TransferMode::Move,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub default_strategy: ResolutionStrategy,
    pub delete_losers: bool,
    pub flag_mtime_divergence: bool,
    pub missing_grace_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_strategy: ResolutionStrategy::Manual,
            delete_losers: false,
            flag_mtime_divergence: false,
            missing_grace_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Largest Hamming distance between perceptual hashes still grouped as similar.
    pub similarity_threshold: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 10,
        }
    }
}

/// Load `MediaVault.toml` from the working directory (optional), overridden by
/// `MEDIAVAULT__SECTION__KEY` environment variables.
pub fn load_configuration() -> Result<AppConfig> {
    finish(Config::builder().add_source(ConfigFile::with_name("MediaVault").required(false)))
}

/// Load from an explicit file, which must exist.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    finish(Config::builder().add_source(ConfigFile::from(path)))
}

fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<AppConfig> {
    let config = builder
        .add_source(
            Environment::with_prefix("MEDIAVAULT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let app: AppConfig = config.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

impl AppConfig {
    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".to_string()));
        }
        if self.migration.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "migration.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sync.missing_grace_days < 0 {
            return Err(Error::InvalidConfig(
                "sync.missing_grace_days cannot be negative".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for spec in &self.locations {
            if spec.name.trim().is_empty() {
                return Err(Error::InvalidConfig("location name is empty".to_string()));
            }
            if spec.root.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "location '{}' has an empty root",
                    spec.name
                )));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(Error::DuplicateLocation(spec.name.clone()));
            }
            for rule in &spec.rules {
                rule.validate().map_err(|e| {
                    Error::InvalidConfig(format!("location '{}': {}", spec.name, e))
                })?;
            }
        }
        let defaults = self.locations.iter().filter(|l| l.default).count();
        if defaults > 1 {
            return Err(Error::InvalidConfig(format!(
                "{} locations are flagged default; at most one may be",
                defaults
            )));
        }

        for (outer, inner) in self.overlapping_roots() {
            warn!(
                "Location '{}' lies inside location '{}'; its files will be seen twice",
                inner, outer
            );
        }
        Ok(())
    }

    /// Pairs `(outer, inner)` of filesystem locations where the inner root is
    /// nested in the outer one.
    pub fn overlapping_roots(&self) -> Vec<(String, String)> {
        let on_disk: Vec<&LocationSpec> = self
            .locations
            .iter()
            .filter(|l| l.kind != LocationKind::ObjectStore)
            .collect();
        let mut pairs = Vec::new();
        for outer in &on_disk {
            for inner in &on_disk {
                if outer.name != inner.name
                    && Path::new(&inner.root).starts_with(Path::new(&outer.root))
                {
                    pairs.push((outer.name.clone(), inner.name.clone()));
                }
            }
        }
        pairs
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.migration.max_attempts,
            backoff_base: Duration::from_millis(self.migration.backoff_base_ms),
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.scan.remote_timeout_secs)
    }

    pub fn migration_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.migration.interval_secs.min(i64::MAX as u64) as i64)
    }

    pub fn missing_grace(&self) -> chrono::Duration {
        chrono::Duration::days(self.sync.missing_grace_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use std::io::Write;

    fn spec(name: &str, root: &str) -> LocationSpec {
        LocationSpec {
            name: name.to_string(),
            kind: LocationKind::Local,
            root: root.to_string(),
            priority: 0,
            rules: vec![],
            default: false,
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dedup.similarity_threshold, 10);
        assert_eq!(config.migration_interval(), chrono::Duration::hours(24));
        assert_eq!(config.sync.default_strategy, ResolutionStrategy::Manual);
        assert_eq!(config.migration.default_mode, TransferMode::Move);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
db_path = "vault.db"
workers = 2

[[locations]]
name = "fast"
kind = "local"
root = "/srv/fast"
priority = 100
rules = [{{ max_age_days = 30 }}]

[[locations]]
name = "archive"
kind = "object-store"
root = "cold-bucket/media"
priority = 50
default = true
rules = [{{ min_age_days = 30 }}]

[dedup]
similarity_threshold = 6
"#
        )
        .unwrap();

        let config = load_from(file.path()).unwrap();
        assert_eq!(config.db_path, "vault.db");
        assert_eq!(config.workers, 2);
        assert_eq!(config.locations.len(), 2);
        assert_eq!(config.locations[1].kind, LocationKind::ObjectStore);
        assert!(config.locations[1].default);
        assert_eq!(config.locations[0].rules[0].max_age_days, Some(30));
        assert_eq!(config.dedup.similarity_threshold, 6);
        assert_eq!(config.scan.remote_timeout_secs, 30);
    }

    #[test]
    fn test_unknown_kind_is_a_configuration_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            "[[locations]]\nname = \"tape\"\nkind = \"tape\"\nroot = \"/dev/st0\"\n"
        )
        .unwrap();
        assert!(load_from(file.path()).unwrap_err().is_configuration());
    }

    #[test]
    fn test_rejects_duplicate_names_and_defaults() {
        let mut config = AppConfig::default();
        config.locations = vec![spec("a", "/srv/a"), spec("a", "/srv/b")];
        assert!(matches!(config.validate(), Err(Error::DuplicateLocation(_))));

        let mut first = spec("a", "/srv/a");
        first.default = true;
        let mut second = spec("b", "/srv/b");
        second.default = true;
        config.locations = vec![first, second];
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_rejects_inverted_rule_bounds() {
        let mut config = AppConfig::default();
        let mut location = spec("a", "/srv/a");
        location.rules.push(Rule {
            min_age_days: Some(60),
            max_age_days: Some(30),
            ..Rule::default()
        });
        config.locations = vec![location];
        assert!(config.validate().is_err());

        config.locations[0].rules.clear();
        config.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlapping_roots() {
        let mut config = AppConfig::default();
        config.locations = vec![
            spec("home", "/home/user"),
            spec("docs", "/home/user/docs"),
            spec("data", "/var/data"),
        ];
        assert_eq!(
            config.overlapping_roots(),
            vec![("home".to_string(), "docs".to_string())]
        );
        // Overlap is reported, not rejected.
        assert!(config.validate().is_ok());
    }
}
