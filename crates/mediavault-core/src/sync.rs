//! Cross-location consistency: find copies of one asset that disagree, verify
//! cached identities against the bytes, and settle conflicts.

use crate::backend::{Backends, StorageBackend};
use crate::error::{Error, Result};
use crate::hasher::{partial_hash_reader, ContentHash, HashingReader};
use crate::registry::LocationRegistry;
use crate::report::RunSummary;
use crate::storage::models::{
    ConflictReason, ConflictRecord, Location, Observation, ObservationInput, ObservationRef,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    NewestWins,
    LargestWins,
    PrimaryWins,
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::NewestWins => "newest_wins",
            ResolutionStrategy::LargestWins => "largest_wins",
            ResolutionStrategy::PrimaryWins => "primary_wins",
            ResolutionStrategy::Manual => "manual",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "newest_wins" | "newest" => Ok(ResolutionStrategy::NewestWins),
            "largest_wins" | "largest" => Ok(ResolutionStrategy::LargestWins),
            "primary_wins" | "primary" => Ok(ResolutionStrategy::PrimaryWins),
            "manual" => Ok(ResolutionStrategy::Manual),
            other => Err(Error::InvalidConfig(format!(
                "unknown resolution strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Resolution {
    Resolved {
        winner: ObservationRef,
        /// Losing copies deleted, when configured to do so.
        removed: Vec<ObservationRef>,
    },
    /// Manual strategy: the conflict stays open for a human decision.
    Deferred,
}

/// Ranking fields for one candidate copy.
struct Candidate<'o> {
    observation: &'o Observation,
    priority: i64,
    order: i64,
}

/// Pick the winning copy. Pure: same observations and strategy, same winner.
/// Ties fall through mtime, size, location priority, registration order and
/// finally path.
pub fn pick_winner<'o>(
    strategy: ResolutionStrategy,
    observations: &'o [Observation],
    locations: &[Location],
) -> Option<&'o Observation> {
    let by_name: HashMap<&str, &Location> =
        locations.iter().map(|l| (l.name.as_str(), l)).collect();
    let mut candidates: Vec<Candidate<'o>> = observations
        .iter()
        .map(|o| {
            let location = by_name.get(o.location.as_str());
            Candidate {
                observation: o,
                priority: location.map_or(i64::MIN, |l| l.priority),
                order: location.map_or(i64::MAX, |l| l.id),
            }
        })
        .collect();

    let tail = |a: &Candidate, b: &Candidate| -> Ordering {
        b.observation
            .mtime
            .cmp(&a.observation.mtime)
            .then(b.observation.size.cmp(&a.observation.size))
            .then(b.priority.cmp(&a.priority))
            .then(a.order.cmp(&b.order))
            .then(a.observation.path.cmp(&b.observation.path))
    };
    match strategy {
        ResolutionStrategy::NewestWins => candidates.sort_by(tail),
        ResolutionStrategy::LargestWins => candidates.sort_by(|a, b| {
            b.observation
                .size
                .cmp(&a.observation.size)
                .then_with(|| tail(a, b))
        }),
        ResolutionStrategy::PrimaryWins => {
            candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| tail(a, b)))
        }
        ResolutionStrategy::Manual => return None,
    }
    candidates.first().map(|c| c.observation)
}

pub struct SyncTracker<'a> {
    registry: &'a LocationRegistry,
    backends: &'a Backends,
    flag_mtime_divergence: bool,
    delete_losers: bool,
}

impl<'a> SyncTracker<'a> {
    pub fn new(registry: &'a LocationRegistry, backends: &'a Backends) -> Self {
        Self {
            registry,
            backends,
            flag_mtime_divergence: false,
            delete_losers: false,
        }
    }

    /// Treat differing mtimes among same-sized copies as a conflict too.
    pub fn flag_mtime_divergence(mut self, flag: bool) -> Self {
        self.flag_mtime_divergence = flag;
        self
    }

    /// Delete losing copies when a conflict is resolved. Off by default.
    pub fn delete_losers(mut self, delete: bool) -> Self {
        self.delete_losers = delete;
        self
    }

    /// Ways in which the live copies of one asset disagree.
    pub fn divergence(&self, observations: &[Observation]) -> Vec<ConflictReason> {
        let live: Vec<&Observation> = observations.iter().filter(|o| o.is_live()).collect();
        if live.len() < 2 {
            return Vec::new();
        }
        let mut reasons = Vec::new();
        let sizes: BTreeSet<u64> = live.iter().map(|o| o.size).collect();
        if sizes.len() > 1 {
            reasons.push(ConflictReason::SizeDivergence);
        } else if self.flag_mtime_divergence {
            let mtimes: BTreeSet<i64> = live.iter().map(|o| o.mtime).collect();
            if mtimes.len() > 1 {
                reasons.push(ConflictReason::MtimeDivergence);
            }
        }
        reasons
    }

    /// Record a conflict for every divergence among the given observations of
    /// one asset. Already-open conflicts are refreshed, not duplicated.
    pub fn detect(&self, observations: &[Observation]) -> Result<Vec<ConflictRecord>> {
        let Some(first) = observations.first() else {
            return Ok(Vec::new());
        };
        let live: Vec<Observation> = observations.iter().filter(|o| o.is_live()).cloned().collect();
        let reasons = self.divergence(observations);
        if reasons.is_empty() {
            return Ok(Vec::new());
        }
        let history = self.registry.conflicts_for(&first.content_hash)?;
        let mut records = Vec::new();
        for reason in reasons {
            let settled = history.iter().any(|c| {
                !c.is_open() && c.reason == reason && same_copies(&c.observations, &live)
            });
            if settled {
                debug!(
                    "{} on {} already resolved for these copies",
                    reason.as_str(),
                    first.content_hash.short()
                );
                continue;
            }
            let record = self
                .registry
                .record_conflict(&first.content_hash, reason, &live)?;
            warn!(
                "Conflict {} on {}: {}",
                record.id,
                first.content_hash.short(),
                reason.as_str()
            );
            records.push(record);
        }
        Ok(records)
    }

    /// Run detection over every asset held in more than one place.
    pub fn detect_all(&self) -> Result<Vec<ConflictRecord>> {
        let mut records = Vec::new();
        for hash in self.registry.multi_copy_hashes()? {
            let observations = self.registry.observations(&hash)?;
            records.extend(self.detect(&observations)?);
        }
        Ok(records)
    }

    /// Check every live copy of `hash` against the bytes on its backend.
    ///
    /// A cheap stat plus 1KB fingerprint decides whether a full rehash is
    /// needed. Copies whose identity changed are re-registered under the new
    /// hash and an identity-drift conflict is opened on the old one.
    pub fn verify(&self, hash: &ContentHash) -> Result<RunSummary> {
        self.registry
            .with_asset_lock(hash, || self.verify_locked(hash))
    }

    fn verify_locked(&self, hash: &ContentHash) -> Result<RunSummary> {
        let mut summary = RunSummary::new("verify");
        let copies = self.registry.observations(hash)?;
        let mut drifted: Vec<Observation> = Vec::new();

        for copy in &copies {
            let subject = format!("{}:{}", copy.location, copy.path);
            match self.verify_copy(copy) {
                Ok(CopyState::Intact) => summary.succeed(),
                Ok(CopyState::Missing) => {
                    self.registry.mark_missing(copy.id)?;
                    summary.skip(&subject, "file no longer present");
                    summary.bump("missing", 1);
                }
                Ok(CopyState::Drifted(now_holds)) => {
                    summary.succeed();
                    summary.bump("drifted", 1);
                    drifted.push(copy.clone());
                    drifted.push(now_holds);
                }
                Err(e) => {
                    warn!("Could not verify {}: {}", subject, e);
                    summary.fail(&subject, &e);
                }
            }
        }

        if !drifted.is_empty() {
            self.registry
                .record_conflict(hash, ConflictReason::IdentityDrift, &drifted)?;
        }
        let refreshed = self.registry.observations(hash)?;
        let opened = self.detect(&refreshed)?;
        summary.bump("conflicts", (opened.len() + usize::from(!drifted.is_empty())) as u64);
        Ok(summary)
    }

    fn verify_copy(&self, copy: &Observation) -> Result<CopyState> {
        let location = self.registry.location(&copy.location)?;
        let backend = self.backends.for_location(&location)?;
        let Some(entry) = backend.stat(&copy.path)? else {
            return Ok(CopyState::Missing);
        };

        let partial = partial_hash_reader(backend.transfer_out(&copy.path)?)
            .map_err(|e| Error::file_access(&copy.path, e))?;
        let suspicious = copy.needs_verify
            || entry.size != copy.size
            || copy.partial_hash.is_some_and(|p| p != partial);
        if !suspicious {
            self.registry.mark_verified(copy.id, Some(partial))?;
            return Ok(CopyState::Intact);
        }

        debug!("Rehashing {}:{}", copy.location, copy.path);
        let mut hashing = HashingReader::new(backend.transfer_out(&copy.path)?);
        io::copy(&mut hashing, &mut io::sink()).map_err(|e| Error::file_access(&copy.path, e))?;
        let partial = hashing.partial_hash();
        let (fresh, size) = hashing.finish();

        let input = ObservationInput {
            content_hash: fresh.clone(),
            location: copy.location.clone(),
            path: copy.path.clone(),
            size,
            mtime: entry.mtime,
            partial_hash: Some(partial),
            quick_identity: false,
            needs_verify: false,
        };
        self.registry.upsert_observation(&input)?;
        if fresh == copy.content_hash {
            return Ok(CopyState::Intact);
        }
        info!(
            "{}:{} now holds {} (was {})",
            copy.location,
            copy.path,
            fresh.short(),
            copy.content_hash.short()
        );
        let now_holds = self
            .registry
            .observation_at_path(&copy.location, &copy.path)?
            .ok_or_else(|| Error::Other(format!("{}:{} lost after rehash", copy.location, copy.path)))?;
        Ok(CopyState::Drifted(now_holds))
    }

    /// Verify every asset with a copy flagged for re-verification.
    pub fn verify_flagged(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::new("verify");
        for hash in self.registry.verification_candidates()? {
            summary.merge(self.verify(&hash)?);
        }
        Ok(summary)
    }

    /// Apply a strategy to a conflict. `Manual` defers; anything else marks
    /// one copy canonical and closes the conflict.
    pub fn resolve(
        &self,
        conflict: &ConflictRecord,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution> {
        if strategy == ResolutionStrategy::Manual {
            info!("Conflict {} left open for manual resolution", conflict.id);
            return Ok(Resolution::Deferred);
        }
        if !conflict.is_open() {
            return Err(Error::Other(format!("conflict {} is already resolved", conflict.id)));
        }
        self.registry.with_asset_lock(&conflict.content_hash, || {
            self.resolve_locked(conflict, strategy)
        })
    }

    fn resolve_locked(
        &self,
        conflict: &ConflictRecord,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution> {
        let locations = self.registry.locations()?;
        let winner = pick_winner(strategy, &conflict.observations, &locations)
            .ok_or_else(|| Error::Other(format!("conflict {} has no candidates", conflict.id)))?;
        let still_there = self
            .registry
            .observation_at_path(&winner.location, &winner.path)?
            .is_some_and(|o| o.content_hash == winner.content_hash);
        if !still_there {
            return Err(Error::Other(format!(
                "winning copy {}:{} is gone; re-run detection",
                winner.location, winner.path
            )));
        }

        let winner_ref = ObservationRef {
            location: winner.location.clone(),
            path: winner.path.clone(),
        };
        self.registry
            .set_canonical(&winner.content_hash, &winner_ref)?;

        let mut removed = Vec::new();
        if self.delete_losers {
            for loser in conflict
                .observations
                .iter()
                .filter(|o| !(o.location == winner.location && o.path == winner.path))
            {
                let Some(current) = self
                    .registry
                    .observation_at_path(&loser.location, &loser.path)?
                else {
                    continue;
                };
                let backend = self
                    .backends
                    .for_location(&self.registry.location(&loser.location)?)?;
                backend.delete(&loser.path)?;
                self.registry.remove_observation(current.id)?;
                info!("Deleted losing copy {}:{}", loser.location, loser.path);
                removed.push(ObservationRef {
                    location: loser.location.clone(),
                    path: loser.path.clone(),
                });
            }
        }

        self.registry
            .resolve_conflict(conflict.id, strategy, &winner_ref)?;
        info!(
            "Conflict {} resolved by {}: {}:{} wins",
            conflict.id, strategy, winner_ref.location, winner_ref.path
        );
        Ok(Resolution::Resolved {
            winner: winner_ref,
            removed,
        })
    }
}

/// Same set of copies, each with the same size and mtime.
fn same_copies(a: &[Observation], b: &[Observation]) -> bool {
    let key = |o: &Observation| (o.location.clone(), o.path.clone(), o.size, o.mtime);
    a.iter().map(key).collect::<BTreeSet<_>>() == b.iter().map(key).collect::<BTreeSet<_>>()
}

enum CopyState {
    Intact,
    Missing,
    /// The path now holds different content, already re-registered.
    Drifted(Observation),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::LocationKind;
    use chrono::DateTime;

    fn location(id: i64, name: &str, priority: i64) -> Location {
        Location {
            id,
            name: name.to_string(),
            kind: LocationKind::Local,
            root: format!("/srv/{}", name),
            priority,
            rules: vec![],
            is_default: false,
            last_scanned_at: None,
            scan_generation: 1,
        }
    }

    fn observation(location: &str, path: &str, size: u64, mtime: i64) -> Observation {
        Observation {
            id: 0,
            content_hash: ContentHash::from_stored("12".repeat(32)),
            location: location.to_string(),
            path: path.to_string(),
            size,
            mtime,
            partial_hash: None,
            verified_at: DateTime::from_timestamp(0, 0).unwrap(),
            missing_since: None,
            quick_identity: false,
            needs_verify: false,
            canonical: false,
        }
    }

    fn locations() -> Vec<Location> {
        vec![location(1, "loc-a", 10), location(2, "loc-b", 5)]
    }

    #[test]
    fn test_newest_wins() {
        let obs = vec![
            observation("loc-a", "x.jpg", 100, 1_000),
            observation("loc-b", "x.jpg", 100, 2_000),
        ];
        let winner = pick_winner(ResolutionStrategy::NewestWins, &obs, &locations()).unwrap();
        assert_eq!(winner.location, "loc-b");
    }

    #[test]
    fn test_largest_and_primary() {
        let obs = vec![
            observation("loc-a", "x.jpg", 100, 2_000),
            observation("loc-b", "x.jpg", 300, 1_000),
        ];
        let locs = locations();
        assert_eq!(
            pick_winner(ResolutionStrategy::LargestWins, &obs, &locs).unwrap().location,
            "loc-b"
        );
        assert_eq!(
            pick_winner(ResolutionStrategy::PrimaryWins, &obs, &locs).unwrap().location,
            "loc-a"
        );
        assert!(pick_winner(ResolutionStrategy::Manual, &obs, &locs).is_none());
    }

    #[test]
    fn test_winner_is_deterministic_under_reordering() {
        let obs = vec![
            observation("loc-b", "b.jpg", 100, 1_000),
            observation("loc-a", "a.jpg", 100, 1_000),
        ];
        let mut reversed = obs.clone();
        reversed.reverse();
        let locs = locations();
        for strategy in [
            ResolutionStrategy::NewestWins,
            ResolutionStrategy::LargestWins,
            ResolutionStrategy::PrimaryWins,
        ] {
            let a = pick_winner(strategy, &obs, &locs).unwrap();
            let b = pick_winner(strategy, &reversed, &locs).unwrap();
            assert_eq!((&a.location, &a.path), (&b.location, &b.path));
            // Full tie: higher priority location wins
            assert_eq!(a.location, "loc-a");
        }
    }

    #[test]
    fn test_divergence_rules() {
        let registry = LocationRegistry::open_in_memory().unwrap();
        let backends = Backends::default();
        let tracker = SyncTracker::new(&registry, &backends);

        let same = vec![
            observation("loc-a", "x", 100, 1),
            observation("loc-b", "x", 100, 2),
        ];
        assert!(tracker.divergence(&same).is_empty());
        let tracker = tracker.flag_mtime_divergence(true);
        assert_eq!(tracker.divergence(&same), vec![ConflictReason::MtimeDivergence]);

        let sized = vec![
            observation("loc-a", "x", 100, 1),
            observation("loc-b", "x", 120, 1),
        ];
        assert_eq!(tracker.divergence(&sized), vec![ConflictReason::SizeDivergence]);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "newest-wins".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::NewestWins
        );
        assert!("coin_flip".parse::<ResolutionStrategy>().is_err());
    }
}
