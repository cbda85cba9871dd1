use indicatif::{ProgressBar, ProgressStyle};
use mediavault_core::ProgressReporter;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// indicatif progress for the CLI.
///
/// - Scan: spinner, the file count is unknown upfront
/// - Migration: bar over the planned actions
/// - Dedup grouping: spinner
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.slot();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.slot().take() {
            pb.finish_and_clear();
        }
    }

    fn spinner(message: String) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            pb.set_style(style.tick_chars(TICKS));
        }
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }
}

impl ProgressReporter for CliReporter {
    fn on_scan_start(&self, location: &str) {
        self.set_bar(Self::spinner(format!("Scanning {}...", location)));
    }

    fn on_scan_progress(&self, files_seen: usize, _current_path: &str) {
        if let Some(pb) = self.slot().as_ref() {
            pb.set_message(format!("Scanning... {} files seen", files_seen));
        }
    }

    fn on_scan_complete(&self, location: &str, files_seen: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Scan of {} complete: {} files in {:.2}s",
            location, files_seen, duration_secs
        );
    }

    fn on_migration_start(&self, actions: usize) {
        let pb = ProgressBar::new(actions as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "  {spinner:.cyan} Migrating [{bar:30.cyan/dim}] {pos}/{len} assets ({eta} remaining)",
        ) {
            pb.set_style(style.progress_chars("━╸─").tick_chars(TICKS));
        }
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_migration_progress(&self, done: usize, total: usize) {
        if let Some(pb) = self.slot().as_ref() {
            if pb.length() != Some(total as u64) {
                pb.set_length(total as u64);
            }
            pb.set_position(done as u64);
        }
    }

    fn on_migration_complete(&self, succeeded: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Migration complete: {} assets transferred in {:.2}s",
            succeeded, duration_secs
        );
    }

    fn on_dedup_start(&self) {
        self.set_bar(Self::spinner("Grouping duplicates...".to_string()));
    }

    fn on_dedup_complete(&self, groups: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Grouping complete: {} groups in {:.2}s",
            groups, duration_secs
        );
    }
}
