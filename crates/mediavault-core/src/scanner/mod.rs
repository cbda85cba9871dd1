//! Location scanning: enumerate a backend, identify each file, and record
//! what was seen in the registry.

pub mod walk;

use crate::analyzer::ContentAnalyzer;
use crate::backend::{Backend, Backends, FileEntry, StorageBackend};
use crate::error::{Error, Result};
use crate::hasher::{ContentHash, HashingReader};
use crate::progress::ProgressReporter;
use crate::registry::LocationRegistry;
use crate::report::{RunSummary, SummaryCell};
use crate::storage::models::{Location, ObservationInput, UpsertOutcome};
use rayon::prelude::*;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One identified file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub content_hash: ContentHash,
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub partial_hash: Option<u64>,
    /// The hash came from the registry rather than from reading the file.
    pub quick_identity: bool,
    /// The listing reported a different size than was read, so the file
    /// changed while it was being hashed.
    pub needs_verify: bool,
}

pub struct Scanner<'a> {
    registry: &'a LocationRegistry,
    backends: &'a Backends,
    analyzer: &'a dyn ContentAnalyzer,
    reporter: &'a dyn ProgressReporter,
    cancel: &'a AtomicBool,
    force_rehash: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(
        registry: &'a LocationRegistry,
        backends: &'a Backends,
        analyzer: &'a dyn ContentAnalyzer,
        reporter: &'a dyn ProgressReporter,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            registry,
            backends,
            analyzer,
            reporter,
            cancel,
            force_rehash: false,
        }
    }

    /// Ignore cached identities and hash every file.
    pub fn force_rehash(mut self, force: bool) -> Self {
        self.force_rehash = force;
        self
    }

    /// Lazily identify the files of a location. Hashing happens as the
    /// iterator is advanced; nothing is written to the registry.
    pub fn records<'b>(
        &'b self,
        location: &'b Location,
        backend: &'b Backend,
    ) -> Result<impl Iterator<Item = Result<ScanRecord>> + 'b> {
        let entries = backend.scan()?;
        let ignore = self.backends.ignore();
        Ok(entries
            .filter(move |entry| match entry {
                Ok(entry) => !ignore.is_ignored(&entry.path),
                Err(_) => true,
            })
            .map(move |entry| entry.and_then(|entry| self.identify(location, backend, entry))))
    }

    fn identify(&self, location: &Location, backend: &Backend, entry: FileEntry) -> Result<ScanRecord> {
        if !self.force_rehash {
            if let Some((content_hash, partial_hash)) =
                self.registry
                    .cached_identity(&location.name, &entry.path, entry.size, entry.mtime)?
            {
                return Ok(ScanRecord {
                    content_hash,
                    path: entry.path,
                    size: entry.size,
                    mtime: entry.mtime,
                    partial_hash,
                    quick_identity: true,
                    needs_verify: false,
                });
            }
        }

        let reader = backend.transfer_out(&entry.path)?;
        let mut hashing = HashingReader::new(reader);
        io::copy(&mut hashing, &mut io::sink()).map_err(|e| Error::file_access(&entry.path, e))?;
        let partial_hash = hashing.partial_hash();
        let (content_hash, size) = hashing.finish();
        let needs_verify = size != entry.size;
        if needs_verify {
            warn!(
                "{} changed while hashing ({} bytes listed, {} read)",
                entry.path, entry.size, size
            );
        }
        Ok(ScanRecord {
            content_hash,
            path: entry.path,
            size,
            mtime: entry.mtime,
            partial_hash: Some(partial_hash),
            quick_identity: false,
            needs_verify,
        })
    }

    /// Scan one location on the current rayon pool.
    ///
    /// Per-file failures are collected in the summary. Paths not seen are
    /// marked missing only when the enumeration ran to completion; a
    /// cancelled or truncated scan leaves earlier observations as they were.
    pub fn scan(&self, location_name: &str) -> Result<RunSummary> {
        let start = Instant::now();
        let location = self.registry.location(location_name)?;
        let backend = self.backends.for_location(&location)?;
        let entries = backend.scan()?;
        let generation = self.registry.begin_scan(&location.name)?;

        info!("Scanning location '{}' ({})", location.name, location.root);
        self.reporter.on_scan_start(&location.name);

        let summary = SummaryCell::new("scan");
        let seen = AtomicUsize::new(0);
        let truncated = AtomicBool::new(false);
        let ignore = self.backends.ignore();

        entries.par_bridge().for_each(|entry| {
            if self.cancel.load(Ordering::Relaxed) {
                return;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // A failed remote listing cannot be resumed past this point.
                    if matches!(e, Error::Remote { .. }) {
                        truncated.store(true, Ordering::Relaxed);
                    }
                    warn!("Skipping entry in '{}': {}", location.name, e);
                    let subject = match &e {
                        Error::FileAccess { path, .. } => path.clone(),
                        _ => location.name.clone(),
                    };
                    summary.with(|s| s.fail(subject, &e));
                    return;
                }
            };
            if ignore.is_ignored(&entry.path) {
                return;
            }
            let files_seen = seen.fetch_add(1, Ordering::Relaxed) + 1;
            self.reporter.on_scan_progress(files_seen, &entry.path);

            let path = entry.path.clone();
            let result = self
                .identify(&location, &backend, entry)
                .and_then(|record| Ok((self.record(&location, &record)?, record)));
            match result {
                Ok((outcome, record)) => summary.with(|s| {
                    s.succeed();
                    s.bump(outcome_counter(&outcome), 1);
                    if record.quick_identity {
                        s.bump("quick_identity", 1);
                    }
                    if record.needs_verify {
                        s.bump("needs_verify", 1);
                    }
                }),
                Err(e) => {
                    error!("Failed to scan {}: {}", path, e);
                    summary.with(|s| s.fail(&path, &e));
                }
            }
        });

        let mut summary = summary.into_inner();
        summary.cancelled = self.cancel.load(Ordering::Relaxed);
        if summary.cancelled {
            warn!("Scan of '{}' cancelled; missing-path detection skipped", location.name);
        } else if truncated.load(Ordering::Relaxed) {
            warn!(
                "Listing of '{}' did not complete; missing-path detection skipped",
                location.name
            );
            summary.skip(&location.name, "listing incomplete, missing paths not marked");
        } else {
            let missing = self.registry.complete_scan(&location.name, generation)?;
            summary.bump("missing", missing as u64);
        }

        summary.duration_secs = start.elapsed().as_secs_f64();
        summary.sort_issues();
        self.reporter
            .on_scan_complete(&location.name, seen.load(Ordering::Relaxed), summary.duration_secs);
        info!(
            "Scan of '{}' finished in {:.2}s: {} recorded, {} failed, {} newly missing",
            location.name,
            summary.duration_secs,
            summary.succeeded,
            summary.failed,
            summary.counter("missing")
        );
        Ok(summary)
    }

    fn record(&self, location: &Location, record: &ScanRecord) -> Result<UpsertOutcome> {
        let outcome = self.registry.upsert_observation(&ObservationInput {
            content_hash: record.content_hash.clone(),
            location: location.name.clone(),
            path: record.path.clone(),
            size: record.size,
            mtime: record.mtime,
            partial_hash: record.partial_hash,
            quick_identity: record.quick_identity,
            needs_verify: record.needs_verify,
        })?;

        if self.registry.needs_analysis(&record.content_hash)? {
            match self
                .analyzer
                .analyze(location, &record.path, &record.content_hash)
            {
                Some(analysis) => {
                    self.registry.record_analysis(&record.content_hash, &analysis)?;
                    debug!(
                        "Analyzed {} ({} tags)",
                        record.content_hash.short(),
                        analysis.tags.len()
                    );
                }
                None => debug!("No analysis available for {}", record.content_hash.short()),
            }
        }
        Ok(outcome)
    }
}

fn outcome_counter(outcome: &UpsertOutcome) -> &'static str {
    match outcome {
        UpsertOutcome::Inserted => "inserted",
        UpsertOutcome::Refreshed => "unchanged",
        UpsertOutcome::Touched => "touched",
        UpsertOutcome::SizeMismatch => "size_mismatch",
        UpsertOutcome::Replaced { .. } => "replaced",
    }
}
