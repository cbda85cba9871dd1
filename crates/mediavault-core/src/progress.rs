/// Trait for reporting progress of long-running operations.
///
/// The CLI implements it with indicatif. All methods have default no-op
/// implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_scan_start(&self, _location: &str) {}
    fn on_scan_progress(&self, _files_seen: usize, _current_path: &str) {}
    fn on_scan_complete(&self, _location: &str, _files_seen: usize, _duration_secs: f64) {}
    fn on_migration_start(&self, _actions: usize) {}
    fn on_migration_progress(&self, _done: usize, _total: usize) {}
    fn on_migration_complete(&self, _succeeded: usize, _duration_secs: f64) {}
    fn on_dedup_start(&self) {}
    fn on_dedup_complete(&self, _groups: usize, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
