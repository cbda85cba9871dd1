//! Periodic migration runs.
//!
//! The scheduler owns its timer and a shutdown channel. Time comes from an
//! injected [`Clock`] so tests can drive it with [`FakeClock`] and `tick()`.

use crate::error::Result;
use crate::report::RunSummary;
use chrono::{DateTime, Duration, Utc};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Longest the background thread sleeps before re-checking the clock.
const MAX_POLL: std::time::Duration = std::time::Duration::from_secs(60);

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub type Job = Box<dyn FnMut() -> Result<RunSummary> + Send>;

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    interval: Duration,
    next_due: DateTime<Utc>,
    job: Job,
}

impl Scheduler {
    /// The first run is due immediately.
    pub fn new(clock: Arc<dyn Clock>, interval: Duration, job: Job) -> Self {
        let next_due = clock.now();
        Self {
            clock,
            interval,
            next_due,
            job,
        }
    }

    pub fn next_due(&self) -> DateTime<Utc> {
        self.next_due
    }

    /// Run the job if it is due. Returns `None` when nothing ran.
    pub fn tick(&mut self) -> Option<Result<RunSummary>> {
        let now = self.clock.now();
        if now < self.next_due {
            return None;
        }
        info!("Scheduled migration starting");
        let result = (self.job)();
        match &result {
            Ok(summary) => info!(
                "Scheduled migration done: {} succeeded, {} skipped, {} failed",
                summary.succeeded, summary.skipped, summary.failed
            ),
            Err(e) => error!("Scheduled migration failed: {}", e),
        }
        self.next_due = now + self.interval;
        Some(result)
    }

    fn wait_hint(&self) -> std::time::Duration {
        (self.next_due - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
            .min(MAX_POLL)
    }

    /// Run on a background thread until the handle is shut down or dropped.
    pub fn spawn(mut self) -> SchedulerHandle {
        let (shutdown, signal) = mpsc::channel::<()>();
        let thread = thread::spawn(move || loop {
            self.tick();
            match signal.recv_timeout(self.wait_hint()) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        SchedulerHandle { shutdown, thread }
    }
}

pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the current run, if any, and wait for the thread to exit.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
        if self.thread.join().is_err() {
            error!("Scheduler thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(runs: Arc<AtomicUsize>) -> Job {
        Box::new(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(RunSummary::new("migrate"))
        })
    }

    #[test]
    fn test_tick_runs_on_interval() {
        let clock = Arc::new(FakeClock::new(
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(
            clock.clone(),
            Duration::hours(24),
            counting_job(runs.clone()),
        );

        assert!(scheduler.tick().is_some());
        assert!(scheduler.tick().is_none());

        clock.advance(Duration::hours(23));
        assert!(scheduler.tick().is_none());

        clock.advance(Duration::hours(1));
        assert!(scheduler.tick().is_some());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_spawned_scheduler_shuts_down() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let runs = Arc::new(AtomicUsize::new(0));
        let handle =
            Scheduler::new(clock, Duration::hours(24), counting_job(runs.clone())).spawn();
        // The first run is due at once; shutdown waits for it to finish.
        while runs.load(Ordering::SeqCst) == 0 {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        handle.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
