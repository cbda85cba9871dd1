//! The `Vault` facade: one handle wiring configuration, the registry, storage
//! backends and the worker pool into the operations the command surface needs.

use crate::analysis::{DeduplicationService, KeepStrategy, RemovalPlan, SimilarityIndex};
use crate::analyzer::{ContentAnalyzer, NoAnalyzer};
use crate::backend::{Backends, ObjectClient};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::hasher::ContentHash;
use crate::migration::{Clock, MigrationPlan, MigrationService, Scheduler};
use crate::progress::{ProgressReporter, SilentReporter};
use crate::registry::LocationRegistry;
use crate::report::RunSummary;
use crate::rules::RuleEngine;
use crate::scanner::walk::IgnoreSet;
use crate::scanner::Scanner;
use crate::storage::models::{
    ConflictRecord, DuplicateGroup, Location, LocationSpec, RegistryStats,
};
use crate::sync::{Resolution, ResolutionStrategy, SyncTracker};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Registry counts plus every open conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub stats: RegistryStats,
    pub open_conflicts: Vec<ConflictRecord>,
}

/// Cheap to clone; clones share the registry, pool and cancel flag.
#[derive(Clone)]
pub struct Vault {
    config: Arc<AppConfig>,
    registry: Arc<LocationRegistry>,
    backends: Backends,
    index: Arc<SimilarityIndex>,
    analyzer: Arc<dyn ContentAnalyzer>,
    reporter: Arc<dyn ProgressReporter>,
    pool: Arc<ThreadPool>,
    cancel: Arc<AtomicBool>,
}

impl Vault {
    /// Open the registry at `config.db_path`.
    pub fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(LocationRegistry::open(&config.db_path)?);
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: AppConfig, registry: Arc<LocationRegistry>) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("mediavault-worker-{}", i))
            .build()
            .map_err(|e| Error::Other(format!("cannot start worker pool: {}", e)))?;
        let backends = Backends::new(
            IgnoreSet::new(&config.scan.ignore_patterns),
            config.remote_timeout(),
        );
        let index = SimilarityIndex::from_registry(&registry)?;
        debug!("Vault ready with {} workers", config.workers);
        Ok(Self {
            config: Arc::new(config),
            registry,
            backends,
            index: Arc::new(index),
            analyzer: Arc::new(NoAnalyzer),
            reporter: Arc::new(SilentReporter),
            pool: Arc::new(pool),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register the client serving an object-store location.
    pub fn with_client(mut self, location: &str, client: Arc<dyn ObjectClient>) -> Self {
        self.backends = self.backends.with_client(location, client);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ContentAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LocationRegistry> {
        &self.registry
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn similarity_index(&self) -> &SimilarityIndex {
        &self.index
    }

    /// Flag checked between files and actions by every running operation.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        warn!("Cancellation requested");
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn finish(&self, summary: RunSummary) -> Result<RunSummary> {
        self.registry.log_run(&summary)?;
        Ok(summary)
    }

    // ── Locations ────────────────────────────────────────────────

    pub fn register_location(&self, spec: &LocationSpec) -> Result<Location> {
        self.registry.register_location(spec)
    }

    /// Bring the registry in line with the configured locations: new ones are
    /// registered, known ones get their priority, rules and default flag
    /// updated.
    pub fn apply_locations(&self) -> Result<Vec<Location>> {
        let mut applied = Vec::with_capacity(self.config.locations.len());
        for spec in &self.config.locations {
            let location = match self.registry.location(&spec.name) {
                Ok(_) => self.registry.update_location(spec)?,
                Err(Error::UnknownLocation(_)) => self.registry.register_location(spec)?,
                Err(e) => return Err(e),
            };
            applied.push(location);
        }
        info!("{} configured locations applied", applied.len());
        Ok(applied)
    }

    // ── Scanning ─────────────────────────────────────────────────

    pub fn scan(&self, location: &str) -> Result<RunSummary> {
        let scanner = Scanner::new(
            &self.registry,
            &self.backends,
            self.analyzer.as_ref(),
            self.reporter.as_ref(),
            &self.cancel,
        )
        .force_rehash(self.config.scan.force_rehash);
        let summary = self.pool.install(|| scanner.scan(location))?;
        self.finish(summary)
    }

    /// Scan every registered location in registration order. A location
    /// that cannot be scanned is reported and the rest still run.
    pub fn scan_all(&self) -> Result<RunSummary> {
        let mut total = RunSummary::new("scan");
        for location in self.registry.locations()? {
            if self.cancel.load(Ordering::Relaxed) {
                total.cancelled = true;
                break;
            }
            match self.scan(&location.name) {
                Ok(summary) => {
                    total.duration_secs += summary.duration_secs;
                    total.merge(summary);
                }
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) => {
                    warn!("Scan of '{}' failed: {}", location.name, e);
                    total.fail(&location.name, &e);
                }
            }
        }
        Ok(total)
    }

    // ── Migration ────────────────────────────────────────────────

    fn migration_service(&self) -> MigrationService<'_> {
        MigrationService::new(
            &self.registry,
            &self.backends,
            self.reporter.as_ref(),
            &self.cancel,
        )
        .retry_policy(self.config.retry_policy())
        .default_mode(self.config.migration.default_mode)
    }

    pub fn plan_migration(&self) -> Result<MigrationPlan> {
        let assets = self.registry.all_assets()?;
        self.migration_service().plan(&assets, &RuleEngine::now())
    }

    /// Plan and, unless `dry_run`, execute. A dry run reports the planned
    /// action count without touching any location.
    pub fn migrate(&self, dry_run: bool) -> Result<(MigrationPlan, RunSummary)> {
        let start = Instant::now();
        let plan = self.plan_migration()?;
        if dry_run {
            let mut summary = RunSummary::new("migrate");
            summary.bump("planned", plan.actions.len() as u64);
            for (hash, reason) in &plan.skipped {
                summary.skip(hash.short(), reason.clone());
            }
            summary.duration_secs = start.elapsed().as_secs_f64();
            return Ok((plan, summary));
        }
        let service = self.migration_service();
        let summary = self.pool.install(|| service.execute_plan(&plan));
        let summary = self.finish(summary)?;
        Ok((plan, summary))
    }

    /// Periodic plan-and-execute runs. The scheduler holds its own clone of
    /// the vault; call `spawn` on it to run in the background.
    pub fn migration_scheduler(&self, clock: Arc<dyn Clock>) -> Scheduler {
        let vault = self.clone();
        Scheduler::new(
            clock,
            self.config.migration_interval(),
            Box::new(move || vault.migrate(false).map(|(_, summary)| summary)),
        )
    }

    // ── Sync ─────────────────────────────────────────────────────

    fn tracker(&self) -> SyncTracker<'_> {
        SyncTracker::new(&self.registry, &self.backends)
            .flag_mtime_divergence(self.config.sync.flag_mtime_divergence)
            .delete_losers(self.config.sync.delete_losers)
    }

    /// Re-run conflict detection across all multi-copy assets, then report.
    pub fn sync_status(&self) -> Result<SyncStatus> {
        self.tracker().detect_all()?;
        Ok(SyncStatus {
            stats: self.registry.stats()?,
            open_conflicts: self.registry.conflicts(true)?,
        })
    }

    /// Resolve every open conflict of one asset. `None` uses the configured
    /// default strategy.
    pub fn resolve_conflict(
        &self,
        hash: &ContentHash,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<Vec<Resolution>> {
        let strategy = strategy.unwrap_or(self.config.sync.default_strategy);
        let open: Vec<ConflictRecord> = self
            .registry
            .conflicts_for(hash)?
            .into_iter()
            .filter(ConflictRecord::is_open)
            .collect();
        if open.is_empty() {
            return Err(Error::Other(format!("no open conflict for {}", hash)));
        }
        let tracker = self.tracker();
        open.iter()
            .map(|conflict| tracker.resolve(conflict, strategy))
            .collect()
    }

    /// Verify one asset's copies, or every copy flagged for verification.
    pub fn verify(&self, hash: Option<&ContentHash>) -> Result<RunSummary> {
        let tracker = self.tracker();
        let summary = match hash {
            Some(hash) => tracker.verify(hash)?,
            None => tracker.verify_flagged()?,
        };
        self.finish(summary)
    }

    // ── Deduplication ────────────────────────────────────────────

    fn dedup_service(&self) -> DeduplicationService<'_> {
        DeduplicationService::new(
            &self.registry,
            &self.backends,
            &self.index,
            self.reporter.as_ref(),
        )
        .retry_policy(self.config.retry_policy())
    }

    /// Compute and store a fresh dedup run. `None` uses the configured threshold.
    pub fn dedup_report(&self, threshold: Option<u32>) -> Result<Vec<DuplicateGroup>> {
        let threshold = threshold.unwrap_or(self.config.dedup.similarity_threshold);
        self.dedup_service().find_groups(threshold)
    }

    /// Regroup, then keep one copy per exact group and remove the rest.
    pub fn dedup_remove(
        &self,
        strategy: KeepStrategy,
        dry_run: bool,
    ) -> Result<(Vec<RemovalPlan>, RunSummary)> {
        let groups = self.dedup_report(None)?;
        let (plans, summary) = self.dedup_service().remove_groups(&groups, strategy, dry_run);
        if dry_run {
            return Ok((plans, summary));
        }
        Ok((plans, self.finish(summary)?))
    }

    // ── Housekeeping ─────────────────────────────────────────────

    /// Drop observations missing for longer than the configured grace period.
    pub fn purge_missing(&self) -> Result<usize> {
        self.registry.purge_missing(self.config.missing_grace())
    }
}
