use crate::error::Error;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Skipped,
    Failed,
}

/// One item that did not succeed, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub subject: String,
    pub kind: IssueKind,
    pub reason: String,
}

/// Structured result of a scan, migration, verification or dedup run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub operation: String,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub duration_secs: f64,
    /// Operation-specific counters (new assets, quick-identity hits, ...).
    pub counters: BTreeMap<String, u64>,
    pub issues: Vec<Issue>,
}

impl RunSummary {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn succeed(&mut self) {
        self.succeeded += 1;
    }

    pub fn skip(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        self.skipped += 1;
        self.issues.push(Issue {
            subject: subject.into(),
            kind: IssueKind::Skipped,
            reason: reason.into(),
        });
    }

    pub fn fail(&mut self, subject: impl Into<String>, error: &Error) {
        self.fail_because(subject, error.to_string());
    }

    pub fn fail_because(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        self.failed += 1;
        self.issues.push(Issue {
            subject: subject.into(),
            kind: IssueKind::Failed,
            reason: reason.into(),
        });
    }

    pub fn bump(&mut self, counter: &str, by: u64) {
        *self.counters.entry(counter.to_string()).or_insert(0) += by;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.cancelled |= other.cancelled;
        for (name, value) in other.counters {
            *self.counters.entry(name).or_insert(0) += value;
        }
        self.issues.extend(other.issues);
    }

    /// Issues sorted by subject, so parallel runs report in a stable order.
    pub fn sort_issues(&mut self) {
        self.issues.sort_by(|a, b| a.subject.cmp(&b.subject));
    }

    /// 0 when nothing failed, 1 on partial failure. Configuration errors never
    /// reach a summary; the CLI maps them to 2.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Shared accumulator for parallel workers.
#[derive(Default)]
pub(crate) struct SummaryCell(Mutex<RunSummary>);

impl SummaryCell {
    pub(crate) fn new(operation: &str) -> Self {
        Self(Mutex::new(RunSummary::new(operation)))
    }

    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut RunSummary) -> T) -> T {
        let mut summary = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut summary)
    }

    pub(crate) fn into_inner(self) -> RunSummary {
        self.0.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_reflects_failures() {
        let mut summary = RunSummary::new("scan");
        summary.succeed();
        summary.skip("a.jpg", "already in place");
        assert_eq!(summary.exit_code(), 0);
        summary.fail("b.jpg", &Error::Other("boom".to_string()));
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.issues.len(), 2);
    }

    #[test]
    fn test_merge_adds_counters() {
        let mut a = RunSummary::new("scan");
        a.bump("inserted", 2);
        let mut b = RunSummary::new("scan");
        b.bump("inserted", 3);
        b.succeed();
        a.merge(b);
        assert_eq!(a.counter("inserted"), 5);
        assert_eq!(a.succeeded, 1);
    }
}
