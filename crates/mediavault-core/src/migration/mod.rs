//! Rule-driven placement: plan where each asset belongs and move or copy it
//! there without ever losing the last good copy.

pub mod retry;
pub mod scheduler;

use crate::backend::{Backend, Backends, StagedFile, StorageBackend};
use crate::error::{Error, Result};
use crate::hasher::{hash_reader, ContentHash, HashingReader};
use crate::progress::ProgressReporter;
use crate::registry::LocationRegistry;
use crate::report::{RunSummary, SummaryCell};
use crate::rules::RuleEngine;
use crate::storage::models::{Asset, Location, Observation, ObservationInput, ObservationRef};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub use retry::RetryPolicy;
pub use scheduler::{Clock, FakeClock, Scheduler, SchedulerHandle, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Copy,
    Move,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationAction {
    pub content_hash: ContentHash,
    /// The copy to read from. `None` when no live copy could be chosen.
    pub from: Option<ObservationRef>,
    pub to_location: String,
    pub to_path: String,
    pub mode: TransferMode,
    /// Source mtime, carried to the destination.
    pub mtime: i64,
}

impl fmt::Display for MigrationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            TransferMode::Copy => "copy",
            TransferMode::Move => "move",
        };
        match &self.from {
            Some(from) => write!(
                f,
                "{} {} {}:{} -> {}:{}",
                mode,
                self.content_hash.short(),
                from.location,
                from.path,
                self.to_location,
                self.to_path
            ),
            None => write!(
                f,
                "{} {} -> {}:{}",
                mode,
                self.content_hash.short(),
                self.to_location,
                self.to_path
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationPlan {
    pub actions: Vec<MigrationAction>,
    /// Assets left where they are, with the reason.
    pub skipped: Vec<(ContentHash, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Transferred,
    /// Nothing to do, e.g. the plan was already carried out.
    Skipped(String),
}

pub struct MigrationService<'a> {
    registry: &'a LocationRegistry,
    backends: &'a Backends,
    reporter: &'a dyn ProgressReporter,
    cancel: &'a AtomicBool,
    retry: RetryPolicy,
    default_mode: TransferMode,
}

impl<'a> MigrationService<'a> {
    pub fn new(
        registry: &'a LocationRegistry,
        backends: &'a Backends,
        reporter: &'a dyn ProgressReporter,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            registry,
            backends,
            reporter,
            cancel,
            retry: RetryPolicy::default(),
            default_mode: TransferMode::Move,
        }
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Mode used when the source location is no longer eligible for the
    /// asset. Copies out of still-eligible locations are always plain copies.
    pub fn default_mode(mut self, mode: TransferMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Decide one action per asset that is not yet in its best location.
    pub fn plan(&self, assets: &[Asset], engine: &RuleEngine) -> Result<MigrationPlan> {
        let locations = self.registry.locations()?;
        let by_name: HashMap<&str, &Location> =
            locations.iter().map(|l| (l.name.as_str(), l)).collect();
        let mut plan = MigrationPlan::default();
        let mut claimed: HashSet<(String, String)> = HashSet::new();

        for asset in assets {
            let hash = &asset.content_hash;
            let copies = self.registry.observations(hash)?;
            if copies.is_empty() {
                plan.skipped.push((hash.clone(), "no live copies".to_string()));
                continue;
            }

            let eligible = engine.classify(asset, &locations);
            let Some(target) = eligible.first() else {
                plan.skipped
                    .push((hash.clone(), "no eligible location".to_string()));
                continue;
            };
            if copies.iter().any(|o| &o.location == target) {
                plan.skipped
                    .push((hash.clone(), format!("already in '{}'", target)));
                continue;
            }

            let Some(source) = choose_source(&copies, &eligible, &by_name) else {
                plan.skipped
                    .push((hash.clone(), "no readable source location".to_string()));
                continue;
            };
            let mode = if eligible.contains(&source.location) {
                TransferMode::Copy
            } else {
                self.default_mode
            };

            let to_path = self.free_path(target, &source.path, hash, &claimed)?;
            claimed.insert((target.clone(), to_path.clone()));

            let action = MigrationAction {
                content_hash: hash.clone(),
                from: Some(ObservationRef {
                    location: source.location.clone(),
                    path: source.path.clone(),
                }),
                to_location: target.clone(),
                to_path,
                mode,
                mtime: source.mtime,
            };
            debug!("Planned {}", action);
            plan.actions.push(action);
        }

        info!(
            "Migration plan: {} actions, {} assets left in place",
            plan.actions.len(),
            plan.skipped.len()
        );
        Ok(plan)
    }

    /// Keep the source path unless it is taken at the target by other
    /// content, in which case a short hash suffix disambiguates it.
    fn free_path(
        &self,
        target: &str,
        path: &str,
        hash: &ContentHash,
        claimed: &HashSet<(String, String)>,
    ) -> Result<String> {
        let taken = |candidate: &str| -> Result<bool> {
            if claimed.contains(&(target.to_string(), candidate.to_string())) {
                return Ok(true);
            }
            Ok(self
                .registry
                .observation_at_path(target, candidate)?
                .is_some_and(|o| &o.content_hash != hash))
        };
        if !taken(path)? {
            return Ok(path.to_string());
        }
        let suffixed = with_suffix(path, &hash.as_str()[..8]);
        if taken(&suffixed)? {
            return Err(Error::Other(format!(
                "no free destination for {} at '{}:{}'",
                hash.short(),
                target,
                path
            )));
        }
        Ok(suffixed)
    }

    /// Execute a plan on the current rayon pool. Actions on the same asset
    /// are serialized through the registry's asset lock.
    pub fn execute_plan(&self, plan: &MigrationPlan) -> RunSummary {
        let start = Instant::now();
        let total = plan.actions.len();
        let summary = SummaryCell::new("migrate");
        summary.with(|s| {
            for (hash, reason) in &plan.skipped {
                s.skip(hash.short(), reason.clone());
            }
        });

        info!("Executing {} migration actions", total);
        self.reporter.on_migration_start(total);
        let done = AtomicUsize::new(0);

        plan.actions.par_iter().for_each(|action| {
            if self.cancel.load(Ordering::Relaxed) {
                return;
            }
            let subject = action.to_string();
            match self.execute(action) {
                Ok(ActionOutcome::Transferred) => summary.with(|s| {
                    s.succeed();
                    s.bump(
                        match action.mode {
                            TransferMode::Copy => "copied",
                            TransferMode::Move => "moved",
                        },
                        1,
                    );
                }),
                Ok(ActionOutcome::Skipped(reason)) => summary.with(|s| s.skip(&subject, reason)),
                Err(e) => {
                    error!("Migration failed: {}: {}", subject, e);
                    summary.with(|s| s.fail(&subject, &e));
                }
            }
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            self.reporter.on_migration_progress(finished, total);
        });

        let mut summary = summary.into_inner();
        summary.cancelled = self.cancel.load(Ordering::Relaxed);
        if summary.cancelled {
            warn!(
                "Migration cancelled after {} of {} actions",
                done.load(Ordering::Relaxed),
                total
            );
        }
        summary.duration_secs = start.elapsed().as_secs_f64();
        summary.sort_issues();
        self.reporter
            .on_migration_complete(summary.succeeded, summary.duration_secs);
        summary
    }

    /// Carry out one action under the asset lock, retrying transient failures.
    pub fn execute(&self, action: &MigrationAction) -> Result<ActionOutcome> {
        self.registry
            .with_asset_lock(&action.content_hash, || self.execute_locked(action))
    }

    fn execute_locked(&self, action: &MigrationAction) -> Result<ActionOutcome> {
        let Some(from) = &action.from else {
            return Ok(ActionOutcome::Skipped("no source copy".to_string()));
        };

        // The plan may be stale by the time we hold the lock.
        let source = match self.registry.observation_at_path(&from.location, &from.path)? {
            Some(o) if o.content_hash == action.content_hash => o,
            _ => return Ok(ActionOutcome::Skipped("source no longer registered".to_string())),
        };
        if let Some(existing) = self
            .registry
            .observation_at_path(&action.to_location, &action.to_path)?
        {
            if existing.content_hash == action.content_hash {
                return Ok(ActionOutcome::Skipped("already at destination".to_string()));
            }
            return Err(Error::Other(format!(
                "destination '{}:{}' now holds {}",
                action.to_location,
                action.to_path,
                existing.content_hash.short()
            )));
        }

        let src = self
            .backends
            .for_location(&self.registry.location(&from.location)?)?;
        let dst = self
            .backends
            .for_location(&self.registry.location(&action.to_location)?)?;

        let partial_hash = match dst.stat(&action.to_path)? {
            // Promoted earlier but never recorded, e.g. after a crash.
            Some(_) => self.adopt_existing(&dst, action)?,
            None => self.retry.run(&action.to_string(), |attempt| {
                if attempt > 1 {
                    debug!("Attempt {} for {}", attempt, action);
                }
                self.transfer_verified(&src, &dst, &from.path, action)
            })?,
        };

        let landed = dst.stat(&action.to_path)?.ok_or_else(|| {
            Error::Other(format!(
                "'{}:{}' vanished after promotion",
                action.to_location, action.to_path
            ))
        })?;
        let destination = ObservationInput {
            content_hash: action.content_hash.clone(),
            location: action.to_location.clone(),
            path: action.to_path.clone(),
            size: landed.size,
            mtime: landed.mtime,
            partial_hash: Some(partial_hash),
            quick_identity: false,
            needs_verify: false,
        };

        match action.mode {
            TransferMode::Copy => {
                self.registry.record_transfer(&destination, None)?;
                info!("Copied {}", action);
            }
            TransferMode::Move => {
                if let Err(e) = self.retry.run("delete source", |_| src.delete(&from.path)) {
                    // The destination is good; keep both registered and report.
                    self.registry.record_transfer(&destination, None)?;
                    return Err(e);
                }
                self.registry.record_transfer(&destination, Some(source.id))?;
                info!("Moved {}", action);
            }
        }
        Ok(ActionOutcome::Transferred)
    }

    /// Stream the source into a staged file, re-read the staged bytes, and
    /// promote only when both hashes equal the asset identity. Returns the
    /// destination's partial fingerprint.
    fn transfer_verified(
        &self,
        src: &Backend,
        dst: &Backend,
        source_path: &str,
        action: &MigrationAction,
    ) -> Result<u64> {
        let reader = src.transfer_out(source_path)?;
        let mut hashing = HashingReader::new(reader);
        let staged = dst.transfer_in(&action.to_path, &mut hashing, action.mtime)?;
        let partial_hash = hashing.partial_hash();
        let (sent, _) = hashing.finish();

        let verified = self.verify_staged(dst, &staged, &sent, action);
        if let Err(e) = verified {
            if let Err(cleanup) = dst.discard(&staged) {
                warn!("Could not discard {}: {}", staged.temp_path, cleanup);
            }
            return Err(e);
        }

        if let Err(e) = dst.promote(&staged) {
            if let Err(cleanup) = dst.discard(&staged) {
                warn!("Could not discard {}: {}", staged.temp_path, cleanup);
            }
            return Err(e);
        }
        Ok(partial_hash)
    }

    fn verify_staged(
        &self,
        dst: &Backend,
        staged: &StagedFile,
        sent: &ContentHash,
        action: &MigrationAction,
    ) -> Result<()> {
        if sent != &action.content_hash {
            return Err(Error::MigrationVerification {
                expected: action.content_hash.to_string(),
                actual: sent.to_string(),
                location: action.to_location.clone(),
            });
        }
        let written = hash_reader(dst.transfer_out(&staged.temp_path)?)
            .map_err(|e| Error::file_access(&staged.temp_path, e))?;
        if written != action.content_hash {
            return Err(Error::MigrationVerification {
                expected: action.content_hash.to_string(),
                actual: written.to_string(),
                location: action.to_location.clone(),
            });
        }
        Ok(())
    }

    /// A file already sits at the destination path. Accept it only if it is
    /// this very content.
    fn adopt_existing(&self, dst: &Backend, action: &MigrationAction) -> Result<u64> {
        let mut hashing = HashingReader::new(dst.transfer_out(&action.to_path)?);
        std::io::copy(&mut hashing, &mut std::io::sink())
            .map_err(|e| Error::file_access(&action.to_path, e))?;
        let partial_hash = hashing.partial_hash();
        let (found, _) = hashing.finish();
        if found != action.content_hash {
            return Err(Error::Other(format!(
                "destination '{}:{}' is occupied by unregistered content {}",
                action.to_location,
                action.to_path,
                found.short()
            )));
        }
        debug!("Adopted existing copy at {}:{}", action.to_location, action.to_path);
        Ok(partial_hash)
    }
}

/// Prefer reading from a copy that is leaving (an ineligible location), then
/// from the highest-priority location, then registration order.
fn choose_source<'o>(
    copies: &'o [Observation],
    eligible: &[String],
    locations: &HashMap<&str, &Location>,
) -> Option<&'o Observation> {
    copies
        .iter()
        .filter(|o| locations.contains_key(o.location.as_str()))
        .min_by_key(|o| {
            let location = locations[o.location.as_str()];
            (
                eligible.contains(&o.location),
                -location.priority,
                location.id,
                o.path.clone(),
            )
        })
}

/// `dir/name.ext` -> `dir/name.<suffix>.ext`
fn with_suffix(path: &str, suffix: &str) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };
    let name = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}.{}.{}", stem, suffix, ext),
        _ => format!("{}.{}", name, suffix),
    };
    match dir {
        Some(dir) => format!("{}/{}", dir, name),
        None => name,
    }
}
