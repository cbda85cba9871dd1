//! Duplicate grouping and guarded removal.
//!
//! Exact groups are live copies of one content hash. Similar groups are
//! distinct assets whose perceptual hashes are closer than the threshold; they
//! are reported but never removed automatically, since each member is the
//! only identity of its own bytes.

use super::similarity::SimilarityIndex;
use crate::backend::{Backends, StorageBackend};
use crate::error::{Error, Result};
use crate::hasher::ContentHash;
use crate::migration::RetryPolicy;
use crate::progress::ProgressReporter;
use crate::registry::LocationRegistry;
use crate::report::RunSummary;
use crate::storage::models::{DuplicateGroup, GroupMember, Location, MatchKind, Observation};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Which member of a group survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepStrategy {
    KeepInPrimaryLocation,
    KeepLargest,
    KeepNewest,
}

impl KeepStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeepStrategy::KeepInPrimaryLocation => "keep_in_primary_location",
            KeepStrategy::KeepLargest => "keep_largest",
            KeepStrategy::KeepNewest => "keep_newest",
        }
    }
}

impl FromStr for KeepStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.replace('-', "_").as_str() {
            "keep_in_primary_location" | "primary" => Ok(KeepStrategy::KeepInPrimaryLocation),
            "keep_largest" | "largest" => Ok(KeepStrategy::KeepLargest),
            "keep_newest" | "newest" => Ok(KeepStrategy::KeepNewest),
            other => Err(Error::InvalidConfig(format!(
                "unknown keep strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for KeepStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Higher priority first, then earlier registration, then path.
fn primary_order(a: &GroupMember, b: &GroupMember) -> Ordering {
    b.location_priority
        .cmp(&a.location_priority)
        .then(a.location_order.cmp(&b.location_order))
        .then_with(|| a.path.cmp(&b.path))
}

/// Index of the member a strategy keeps. Deterministic for any member order.
pub fn choose_keeper(strategy: KeepStrategy, members: &[GroupMember]) -> Option<usize> {
    let ranked = |a: &GroupMember, b: &GroupMember| match strategy {
        KeepStrategy::KeepInPrimaryLocation => primary_order(a, b),
        KeepStrategy::KeepLargest => b.size.cmp(&a.size).then_with(|| primary_order(a, b)),
        KeepStrategy::KeepNewest => b.mtime.cmp(&a.mtime).then_with(|| primary_order(a, b)),
    };
    members
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| ranked(a, b))
        .map(|(i, _)| i)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RemovalStatus {
    /// Dry run: would be removed.
    Planned,
    Removed,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovalItem {
    pub member: GroupMember,
    pub status: RemovalStatus,
}

/// What `remove` decided for one group, and what happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovalPlan {
    pub group_id: i64,
    pub kind: MatchKind,
    pub strategy: KeepStrategy,
    pub dry_run: bool,
    pub keep: GroupMember,
    pub items: Vec<RemovalItem>,
}

impl RemovalPlan {
    pub fn reclaimable_bytes(&self) -> u64 {
        self.items
            .iter()
            .filter(|i| matches!(i.status, RemovalStatus::Planned | RemovalStatus::Removed))
            .map(|i| i.member.size)
            .sum()
    }

    pub fn record(&self, summary: &mut RunSummary) {
        for item in &self.items {
            let subject = format!("{}:{}", item.member.location, item.member.path);
            match &item.status {
                RemovalStatus::Planned => {
                    summary.succeed();
                    summary.bump("planned", 1);
                }
                RemovalStatus::Removed => {
                    summary.succeed();
                    summary.bump("removed", 1);
                }
                RemovalStatus::Skipped(reason) => summary.skip(subject, reason.clone()),
                RemovalStatus::Failed(reason) => summary.fail_because(subject, reason.clone()),
            }
        }
        summary.bump("bytes_reclaimable", self.reclaimable_bytes());
    }
}

pub struct DeduplicationService<'a> {
    registry: &'a LocationRegistry,
    backends: &'a Backends,
    index: &'a SimilarityIndex,
    reporter: &'a dyn ProgressReporter,
    retry: RetryPolicy,
}

impl<'a> DeduplicationService<'a> {
    pub fn new(
        registry: &'a LocationRegistry,
        backends: &'a Backends,
        index: &'a SimilarityIndex,
        reporter: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            registry,
            backends,
            index,
            reporter,
            retry: RetryPolicy::default(),
        }
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Group exact copies, then near-duplicates closer than `threshold` bits,
    /// and store the result as a new dedup run. A threshold of 0 groups exact
    /// copies only.
    pub fn find_groups(&self, threshold: u32) -> Result<Vec<DuplicateGroup>> {
        let start = Instant::now();
        self.reporter.on_dedup_start();
        let locations = self.registry.locations()?;
        let by_name: HashMap<&str, &Location> =
            locations.iter().map(|l| (l.name.as_str(), l)).collect();

        let mut groups = self.exact_groups(&by_name)?;
        let exact = groups.len();
        groups.extend(self.similar_groups(threshold, &by_name)?);

        let (run, stored) = self.registry.record_dedup_run(threshold, &groups)?;
        let secs = start.elapsed().as_secs_f64();
        info!(
            "Dedup run {}: {} exact groups, {} similar groups in {:.2}s",
            run.id,
            exact,
            stored.len() - exact,
            secs
        );
        self.reporter.on_dedup_complete(stored.len(), secs);
        Ok(stored)
    }

    fn exact_groups(&self, by_name: &HashMap<&str, &Location>) -> Result<Vec<DuplicateGroup>> {
        let mut groups = Vec::new();
        for hash in self.registry.multi_copy_hashes()? {
            let mut members: Vec<GroupMember> = self
                .registry
                .observations(&hash)?
                .iter()
                .filter_map(|o| member_of(o, by_name))
                .collect();
            if members.len() < 2 {
                continue;
            }
            members.sort_by(primary_order);
            debug!("{}: {} identical copies", hash.short(), members.len());
            groups.push(DuplicateGroup {
                id: 0,
                run_id: 0,
                kind: MatchKind::Exact,
                members,
                representative: 0,
            });
        }
        Ok(groups)
    }

    fn similar_groups(
        &self,
        threshold: u32,
        by_name: &HashMap<&str, &Location>,
    ) -> Result<Vec<DuplicateGroup>> {
        let entries = self.registry.perceptual_hashes()?;
        for (hash, phash) in &entries {
            self.index.add(hash, *phash);
        }
        let Some(max_distance) = threshold.checked_sub(1) else {
            return Ok(Vec::new());
        };

        let mut claimed: HashSet<ContentHash> = HashSet::new();
        let mut groups = Vec::new();
        for (anchor, phash) in &entries {
            if claimed.contains(anchor) {
                continue;
            }
            let Some(first) = self.best_copy(anchor, by_name)? else {
                continue;
            };
            let mut members = vec![first];
            for hit in self.index.query(*phash, max_distance) {
                if &hit.content_hash == anchor || claimed.contains(&hit.content_hash) {
                    continue;
                }
                if let Some(mut copy) = self.best_copy(&hit.content_hash, by_name)? {
                    copy.distance = hit.distance;
                    members.push(copy);
                }
            }
            if members.len() < 2 {
                continue;
            }
            claimed.extend(members.iter().map(|m| m.content_hash.clone()));
            let representative =
                choose_keeper(KeepStrategy::KeepLargest, &members).unwrap_or_default();
            groups.push(DuplicateGroup {
                id: 0,
                run_id: 0,
                kind: MatchKind::Similar,
                members,
                representative,
            });
        }
        Ok(groups)
    }

    /// The copy that stands for an asset in a similar group: its canonical
    /// copy when one is set, else the primary one.
    fn best_copy(
        &self,
        hash: &ContentHash,
        by_name: &HashMap<&str, &Location>,
    ) -> Result<Option<GroupMember>> {
        let observations = self.registry.observations(hash)?;
        if let Some(canonical) = observations.iter().find(|o| o.canonical) {
            return Ok(member_of(canonical, by_name));
        }
        let mut members: Vec<GroupMember> = observations
            .iter()
            .filter_map(|o| member_of(o, by_name))
            .collect();
        members.sort_by(primary_order);
        Ok(members.into_iter().next())
    }

    /// Keep one member per `strategy` and remove the rest, or only plan it
    /// when `dry_run` is set. The last live copy of a hash is never removed.
    pub fn remove(
        &self,
        group: &DuplicateGroup,
        strategy: KeepStrategy,
        dry_run: bool,
    ) -> Result<RemovalPlan> {
        let keep_index = choose_keeper(strategy, &group.members)
            .ok_or_else(|| Error::Other(format!("duplicate group {} is empty", group.id)))?;
        let keep = group.members[keep_index].clone();

        let mut items = Vec::with_capacity(group.members.len().saturating_sub(1));
        for (i, member) in group.members.iter().enumerate() {
            if i == keep_index {
                continue;
            }
            let status = if group.kind == MatchKind::Similar {
                RemovalStatus::Skipped("near-duplicate of a distinct asset; review by hand".to_string())
            } else if dry_run {
                RemovalStatus::Planned
            } else {
                self.execute_removal(group, &keep, member, strategy)?
            };
            items.push(RemovalItem {
                member: member.clone(),
                status,
            });
        }

        Ok(RemovalPlan {
            group_id: group.id,
            kind: group.kind,
            strategy,
            dry_run,
            keep,
            items,
        })
    }

    /// Apply `remove` to every group, collecting per-group failures.
    pub fn remove_groups(
        &self,
        groups: &[DuplicateGroup],
        strategy: KeepStrategy,
        dry_run: bool,
    ) -> (Vec<RemovalPlan>, RunSummary) {
        let start = Instant::now();
        let mut summary = RunSummary::new("dedup-remove");
        let mut plans = Vec::with_capacity(groups.len());
        for group in groups {
            match self.remove(group, strategy, dry_run) {
                Ok(plan) => {
                    plan.record(&mut summary);
                    plans.push(plan);
                }
                Err(e) => {
                    warn!("Duplicate group {} failed: {}", group.id, e);
                    summary.fail(format!("group {}", group.id), &e);
                }
            }
        }
        summary.duration_secs = start.elapsed().as_secs_f64();
        info!(
            "Dedup removal ({}{}): {} removed/planned, {} skipped, {} failed",
            strategy,
            if dry_run { ", dry run" } else { "" },
            summary.succeeded,
            summary.skipped,
            summary.failed
        );
        (plans, summary)
    }

    /// Persist, execute and record one removal. Per-copy failures become a
    /// `Failed` status; only registry errors propagate.
    fn execute_removal(
        &self,
        group: &DuplicateGroup,
        keep: &GroupMember,
        member: &GroupMember,
        strategy: KeepStrategy,
    ) -> Result<RemovalStatus> {
        let removal_id = self
            .registry
            .plan_removal(group.id, member, strategy.as_str())?;
        let status = match self
            .registry
            .with_asset_lock(&member.content_hash, || self.remove_copy(keep, member))
        {
            Ok(status) => status,
            Err(e) if matches!(e, Error::Database(_)) => return Err(e),
            Err(e) => {
                warn!("Not removing {}:{}: {}", member.location, member.path, e);
                RemovalStatus::Failed(e.to_string())
            }
        };
        let label = match &status {
            RemovalStatus::Removed => "removed".to_string(),
            RemovalStatus::Skipped(reason) => format!("skipped: {}", reason),
            RemovalStatus::Failed(reason) => format!("failed: {}", reason),
            RemovalStatus::Planned => "planned".to_string(),
        };
        self.registry.finish_removal(removal_id, &label)?;
        Ok(status)
    }

    fn remove_copy(&self, keep: &GroupMember, member: &GroupMember) -> Result<RemovalStatus> {
        let hash = &member.content_hash;
        let live = self.registry.observations(hash)?;
        let Some(target) = find_copy(&live, &member.location, &member.path) else {
            return Ok(RemovalStatus::Skipped("no longer registered".to_string()));
        };
        let Some(survivor) = find_copy(&live, &keep.location, &keep.path) else {
            return Ok(RemovalStatus::Skipped(format!(
                "kept copy {}:{} is gone; re-run dedup",
                keep.location, keep.path
            )));
        };
        if live.len() < 2 || survivor.id == target.id {
            return Err(Error::LastCopy(hash.to_string()));
        }

        // The survivor must still be on its backend before anything goes.
        let survivor_backend = self
            .backends
            .for_location(&self.registry.location(&survivor.location)?)?;
        match survivor_backend.stat(&survivor.path)? {
            Some(entry) if entry.size == survivor.size => {}
            Some(_) => return Err(Error::LastCopy(hash.to_string())),
            None => {
                self.registry.mark_missing(survivor.id)?;
                return Err(Error::LastCopy(hash.to_string()));
            }
        }

        let backend = self
            .backends
            .for_location(&self.registry.location(&target.location)?)?;
        self.retry.run(&format!("delete {}:{}", target.location, target.path), |_| {
            backend.delete(&target.path)
        })?;
        self.registry.remove_observation(target.id)?;
        info!(
            "Removed duplicate {}:{} (kept {}:{})",
            target.location, target.path, survivor.location, survivor.path
        );
        Ok(RemovalStatus::Removed)
    }
}

fn find_copy<'o>(live: &'o [Observation], location: &str, path: &str) -> Option<&'o Observation> {
    live.iter()
        .find(|o| o.location == location && o.path == path)
}

fn member_of(observation: &Observation, by_name: &HashMap<&str, &Location>) -> Option<GroupMember> {
    let location = by_name.get(observation.location.as_str())?;
    Some(GroupMember {
        content_hash: observation.content_hash.clone(),
        location: observation.location.clone(),
        path: observation.path.clone(),
        size: observation.size,
        mtime: observation.mtime,
        location_priority: location.priority,
        location_order: location.id,
        distance: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_bytes;

    fn member(location: &str, priority: i64, order: i64, size: u64, mtime: i64) -> GroupMember {
        GroupMember {
            content_hash: hash_bytes(b"same"),
            location: location.to_string(),
            path: format!("{}/photo.jpg", location),
            size,
            mtime,
            location_priority: priority,
            location_order: order,
            distance: 0,
        }
    }

    #[test]
    fn test_keep_in_primary_location() {
        let members = vec![
            member("archive", 50, 2, 100, 10),
            member("fast", 100, 1, 100, 5),
            member("backup", 100, 3, 100, 20),
        ];
        assert_eq!(choose_keeper(KeepStrategy::KeepInPrimaryLocation, &members), Some(1));
    }

    #[test]
    fn test_keep_largest_and_newest() {
        let members = vec![
            member("a", 1, 1, 100, 30),
            member("b", 1, 2, 300, 10),
            member("c", 9, 3, 200, 20),
        ];
        assert_eq!(choose_keeper(KeepStrategy::KeepLargest, &members), Some(1));
        assert_eq!(choose_keeper(KeepStrategy::KeepNewest, &members), Some(0));
    }

    #[test]
    fn test_keeper_ignores_member_order() {
        let mut members = vec![
            member("a", 5, 1, 100, 10),
            member("b", 5, 2, 100, 10),
            member("c", 1, 3, 100, 10),
        ];
        let kept = |m: &[GroupMember], s| m[choose_keeper(s, m).unwrap()].location.clone();
        let before = kept(&members, KeepStrategy::KeepLargest);
        members.reverse();
        assert_eq!(kept(&members, KeepStrategy::KeepLargest), before);
        assert_eq!(before, "a");
        assert_eq!(choose_keeper(KeepStrategy::KeepNewest, &[]), None);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "keep-in-primary-location".parse::<KeepStrategy>().unwrap(),
            KeepStrategy::KeepInPrimaryLocation
        );
        assert_eq!("largest".parse::<KeepStrategy>().unwrap(), KeepStrategy::KeepLargest);
        assert!("keep_oldest".parse::<KeepStrategy>().is_err());
    }

    #[test]
    fn test_similar_plans_keep_everything() {
        let plan = RemovalPlan {
            group_id: 1,
            kind: MatchKind::Similar,
            strategy: KeepStrategy::KeepLargest,
            dry_run: false,
            keep: member("a", 1, 1, 100, 1),
            items: vec![RemovalItem {
                member: member("b", 1, 2, 90, 1),
                status: RemovalStatus::Skipped("near-duplicate".to_string()),
            }],
        };
        let mut summary = RunSummary::new("dedup-remove");
        plan.record(&mut summary);
        assert_eq!(plan.reclaimable_bytes(), 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.succeeded, 0);
    }
}
