//! The registry handle: the single source of truth for locations, assets and
//! observations. All state lives in SQLite behind one connection; callers pass
//! an `Arc<LocationRegistry>` around explicitly.

use crate::analyzer::Analysis;
use crate::error::{Error, Result};
use crate::hasher::ContentHash;
use crate::report::RunSummary;
use crate::storage::models::*;
use crate::storage::Database;
use crate::sync::ResolutionStrategy;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub struct LocationRegistry {
    db: Mutex<Database>,
    asset_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocationRegistry {
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::open(path)?;
        info!("Registry opened at {}", path);
        Ok(Self::with_database(db))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_database(Database::open_in_memory()?))
    }

    fn with_database(db: Database) -> Self {
        Self {
            db: Mutex::new(db),
            asset_locks: DashMap::new(),
        }
    }

    /// Recovers from poisoning. Every mutation runs in its own transaction.
    pub(crate) fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` while holding the per-asset lock for `hash`. Operations on the
    /// same content are serialized; different assets proceed in parallel.
    pub fn with_asset_lock<T>(&self, hash: &ContentHash, f: impl FnOnce() -> T) -> T {
        let lock = self
            .asset_locks
            .entry(hash.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        drop(lock);
        self.asset_locks
            .remove_if(hash.as_str(), |_, l| Arc::strong_count(l) == 1);
        result
    }

    // ── Locations ────────────────────────────────────────────────

    pub fn register_location(&self, spec: &LocationSpec) -> Result<Location> {
        validate_spec(spec)?;
        let db = self.db();
        if spec.default {
            if let Some(existing) = db.locations()?.into_iter().find(|l| l.is_default) {
                return Err(Error::InvalidConfig(format!(
                    "location '{}' is already the default",
                    existing.name
                )));
            }
        }
        let location = db.insert_location(spec)?;
        info!(
            "Registered location '{}' ({}, priority {})",
            location.name, location.kind, location.priority
        );
        Ok(location)
    }

    /// Apply new priority, rules or default flag to an existing location.
    /// Kind and root are fixed once registered.
    pub fn update_location(&self, spec: &LocationSpec) -> Result<Location> {
        validate_spec(spec)?;
        let db = self.db();
        let current = db
            .location(&spec.name)?
            .ok_or_else(|| Error::UnknownLocation(spec.name.clone()))?;
        if current.kind != spec.kind || current.root != spec.root {
            return Err(Error::InvalidConfig(format!(
                "location '{}' cannot change kind or root ({} {} -> {} {})",
                spec.name, current.kind, current.root, spec.kind, spec.root
            )));
        }
        if spec.default {
            if let Some(other) = db
                .locations()?
                .into_iter()
                .find(|l| l.is_default && l.name != spec.name)
            {
                return Err(Error::InvalidConfig(format!(
                    "location '{}' is already the default",
                    other.name
                )));
            }
        }
        db.update_location(spec)
    }

    pub fn location(&self, name: &str) -> Result<Location> {
        self.db()
            .location(name)?
            .ok_or_else(|| Error::UnknownLocation(name.to_string()))
    }

    pub fn locations(&self) -> Result<Vec<Location>> {
        self.db().locations()
    }

    // ── Scans ────────────────────────────────────────────────────

    pub fn begin_scan(&self, location: &str) -> Result<i64> {
        self.db().begin_scan(location)
    }

    /// Close a scan that ran to completion. Only then are unseen paths marked
    /// missing; a cancelled scan leaves existing observations untouched.
    pub fn complete_scan(&self, location: &str, generation: i64) -> Result<usize> {
        self.db().complete_scan(location, generation, Utc::now())
    }

    pub fn cached_identity(
        &self,
        location: &str,
        path: &str,
        size: u64,
        mtime: i64,
    ) -> Result<Option<(ContentHash, Option<u64>)>> {
        self.db().cached_identity(location, path, size, mtime)
    }

    // ── Observations ─────────────────────────────────────────────

    pub fn upsert_observation(&self, input: &ObservationInput) -> Result<UpsertOutcome> {
        let outcome = self.db().upsert_observation(input, Utc::now())?;
        debug!(
            "{} at {}:{} -> {:?}",
            input.content_hash.short(),
            input.location,
            input.path,
            outcome
        );
        Ok(outcome)
    }

    pub(crate) fn record_transfer(
        &self,
        destination: &ObservationInput,
        removed_source: Option<i64>,
    ) -> Result<UpsertOutcome> {
        self.db()
            .record_transfer(destination, removed_source, Utc::now())
    }

    /// Live observations of an asset, in location registration order.
    pub fn observations(&self, hash: &ContentHash) -> Result<Vec<Observation>> {
        self.db().observations_for(hash, false)
    }

    pub fn all_observations(&self, hash: &ContentHash) -> Result<Vec<Observation>> {
        self.db().observations_for(hash, true)
    }

    pub fn observations_at(&self, location: &str) -> Result<Vec<Observation>> {
        self.db().observations_at(location, false)
    }

    pub fn observation_at_path(&self, location: &str, path: &str) -> Result<Option<Observation>> {
        self.db().observation_at_path(location, path)
    }

    /// Observations at `location` that its latest completed scan did not find.
    pub fn find_missing(&self, location: &str) -> Result<Vec<Observation>> {
        let db = self.db();
        if db.location(location)?.is_none() {
            return Err(Error::UnknownLocation(location.to_string()));
        }
        db.missing_at(location)
    }

    pub(crate) fn mark_missing(&self, observation_id: i64) -> Result<()> {
        self.db().mark_observation_missing(observation_id, Utc::now())
    }

    pub(crate) fn mark_verified(&self, observation_id: i64, partial_hash: Option<u64>) -> Result<()> {
        self.db()
            .mark_observation_verified(observation_id, partial_hash, Utc::now())
    }

    pub(crate) fn remove_observation(&self, observation_id: i64) -> Result<()> {
        self.db().delete_observation(observation_id)
    }

    pub(crate) fn set_canonical(&self, hash: &ContentHash, winner: &ObservationRef) -> Result<()> {
        self.db().set_canonical(hash, &winner.location, &winner.path)
    }

    /// Drop observations missing for longer than `grace`.
    pub fn purge_missing(&self, grace: Duration) -> Result<usize> {
        self.purge_missing_at(grace, Utc::now())
    }

    pub fn purge_missing_at(&self, grace: Duration, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.db().purge_missing_before(now - grace)?;
        if purged > 0 {
            info!("Purged {} observations missing for over {} days", purged, grace.num_days());
        }
        Ok(purged)
    }

    pub fn verification_candidates(&self) -> Result<Vec<ContentHash>> {
        self.db().verification_candidates()
    }

    pub fn multi_copy_hashes(&self) -> Result<Vec<ContentHash>> {
        self.db().multi_copy_hashes()
    }

    // ── Assets ───────────────────────────────────────────────────

    pub fn find_asset(&self, hash: &ContentHash) -> Result<Option<Asset>> {
        self.db().asset(hash)
    }

    pub fn asset(&self, hash: &ContentHash) -> Result<Asset> {
        self.find_asset(hash)?
            .ok_or_else(|| Error::UnknownAsset(hash.to_string()))
    }

    pub fn query(&self, query: &AssetQuery) -> Result<Vec<Asset>> {
        self.db().query_assets(query)
    }

    pub fn all_assets(&self) -> Result<Vec<Asset>> {
        self.query(&AssetQuery::default())
    }

    pub(crate) fn needs_analysis(&self, hash: &ContentHash) -> Result<bool> {
        self.db().needs_analysis(hash)
    }

    pub fn record_analysis(&self, hash: &ContentHash, analysis: &Analysis) -> Result<()> {
        self.db().set_analysis(hash, analysis, Utc::now())
    }

    pub fn perceptual_hashes(&self) -> Result<Vec<(ContentHash, u64)>> {
        self.db().perceptual_hashes()
    }

    // ── Conflicts ────────────────────────────────────────────────

    pub fn record_conflict(
        &self,
        hash: &ContentHash,
        reason: ConflictReason,
        observations: &[Observation],
    ) -> Result<ConflictRecord> {
        let db = self.db();
        let id = db.record_conflict(hash, reason, observations, Utc::now())?;
        db.conflict(id)?
            .ok_or_else(|| Error::Other(format!("conflict {} vanished", id)))
    }

    pub(crate) fn resolve_conflict(
        &self,
        id: i64,
        strategy: ResolutionStrategy,
        winner: &ObservationRef,
    ) -> Result<()> {
        self.db()
            .resolve_conflict_record(id, strategy, winner, Utc::now())
    }

    pub fn conflict(&self, id: i64) -> Result<Option<ConflictRecord>> {
        self.db().conflict(id)
    }

    pub fn conflicts(&self, open_only: bool) -> Result<Vec<ConflictRecord>> {
        self.db().conflicts(open_only)
    }

    pub fn conflicts_for(&self, hash: &ContentHash) -> Result<Vec<ConflictRecord>> {
        self.db().conflicts_for(hash)
    }

    // ── Dedup history ────────────────────────────────────────────

    /// Store a dedup run; earlier runs stay untouched.
    pub fn record_dedup_run(
        &self,
        threshold: u32,
        groups: &[DuplicateGroup],
    ) -> Result<(DedupRun, Vec<DuplicateGroup>)> {
        self.db().insert_dedup_run(threshold, groups, Utc::now())
    }

    pub fn latest_dedup_run(&self) -> Result<Option<DedupRun>> {
        self.db().latest_dedup_run()
    }

    pub fn duplicate_group(&self, id: i64) -> Result<Option<DuplicateGroup>> {
        self.db().duplicate_group(id)
    }

    pub fn duplicate_groups(&self, run_id: i64) -> Result<Vec<DuplicateGroup>> {
        self.db().duplicate_groups(run_id)
    }

    pub(crate) fn plan_removal(
        &self,
        group_id: i64,
        member: &GroupMember,
        strategy: &str,
    ) -> Result<i64> {
        self.db().insert_removal(group_id, member, strategy, Utc::now())
    }

    pub(crate) fn finish_removal(&self, id: i64, result: &str) -> Result<()> {
        self.db().mark_removal_executed(id, result, Utc::now())
    }

    pub fn removals_for_group(&self, group_id: i64) -> Result<Vec<RemovalEntry>> {
        self.db().removals_for_group(group_id)
    }

    // ── Reporting ────────────────────────────────────────────────

    pub fn stats(&self) -> Result<RegistryStats> {
        self.db().stats()
    }

    /// Append a finished run to the run log.
    pub fn log_run(&self, summary: &RunSummary) -> Result<()> {
        let json = serde_json::to_string(summary)?;
        self.db().log_run(
            &summary.operation,
            summary.succeeded,
            summary.skipped,
            summary.failed,
            &json,
            Utc::now(),
        )
    }

    /// Most recent summary logged for an operation, as JSON.
    pub fn last_run(&self, operation: &str) -> Result<Option<(DateTime<Utc>, String)>> {
        self.db().last_run(operation)
    }
}

fn validate_spec(spec: &LocationSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(Error::InvalidConfig("location name is empty".to_string()));
    }
    if spec.root.trim().is_empty() {
        return Err(Error::InvalidConfig(format!(
            "location '{}' has an empty root",
            spec.name
        )));
    }
    for (i, rule) in spec.rules.iter().enumerate() {
        rule.validate().map_err(|reason| {
            Error::InvalidConfig(format!("location '{}' rule {}: {}", spec.name, i, reason))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn spec(name: &str) -> LocationSpec {
        LocationSpec {
            name: name.to_string(),
            kind: LocationKind::Local,
            root: format!("/srv/{}", name),
            priority: 0,
            rules: vec![],
            default: false,
        }
    }

    #[test]
    fn test_single_default_location() {
        let registry = LocationRegistry::open_in_memory().unwrap();
        let mut a = spec("a");
        a.default = true;
        registry.register_location(&a).unwrap();
        let mut b = spec("b");
        b.default = true;
        assert!(registry.register_location(&b).unwrap_err().is_configuration());
    }

    #[test]
    fn test_update_rejects_root_change() {
        let registry = LocationRegistry::open_in_memory().unwrap();
        registry.register_location(&spec("a")).unwrap();
        let mut moved = spec("a");
        moved.root = "/elsewhere".to_string();
        assert!(registry.update_location(&moved).is_err());

        let mut bumped = spec("a");
        bumped.priority = 7;
        assert_eq!(registry.update_location(&bumped).unwrap().priority, 7);
    }

    #[test]
    fn test_asset_lock_serializes_same_hash() {
        let registry = Arc::new(LocationRegistry::open_in_memory().unwrap());
        let hash = ContentHash::from_stored("aa".repeat(32));
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let hash = hash.clone();
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    registry.with_asset_lock(&hash, || {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(std::time::Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.asset_locks.is_empty());
    }
}
