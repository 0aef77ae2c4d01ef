//! Job registry and wall-clock driver.
//!
//! Every registered job is a singleton: while a run is in flight, further
//! triggers of that job are skipped, not queued. Distinct jobs run
//! concurrently. A failed run has already rolled back its transaction; it is
//! logged and retried only at the job's next firing.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::allocation::AllocationReport;
use crate::clock::Clock;
use crate::error::{FairslotError, Result};
use crate::reputation::ReputationReport;
use crate::retention::RetentionReport;
use crate::waitlist::WaitlistReport;

mod cadence;

pub use cadence::{Cadence, ScheduleConfig};

/// A unit of batch work the scheduler can fire.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the job to completion inside a single transaction.
    async fn run_once(&self) -> Result<JobReport>;
}

/// What a job run changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobReport {
    Allocation(AllocationReport),
    Waitlist(WaitlistReport),
    Reputation(ReputationReport),
    Retention(RetentionReport),
}

impl From<AllocationReport> for JobReport {
    fn from(report: AllocationReport) -> Self {
        JobReport::Allocation(report)
    }
}

impl From<WaitlistReport> for JobReport {
    fn from(report: WaitlistReport) -> Self {
        JobReport::Waitlist(report)
    }
}

impl From<ReputationReport> for JobReport {
    fn from(report: ReputationReport) -> Self {
        JobReport::Reputation(report)
    }
}

impl From<RetentionReport> for JobReport {
    fn from(report: RetentionReport) -> Self {
        JobReport::Retention(report)
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobReport::Allocation(r) => write!(
                f,
                "{} slots, {} approved, {} queued, {} invalidated, {} over quota",
                r.slots, r.approved, r.queued, r.invalidated, r.over_quota
            ),
            JobReport::Waitlist(r) => write!(
                f,
                "{} vacancies, {} promoted, {} released, {} unchanged, {} dequeued",
                r.vacancies, r.promoted, r.released, r.unchanged, r.dequeued
            ),
            JobReport::Reputation(r) => {
                write!(f, "{} scanned, {} no-shows", r.scanned, r.no_shows)
            }
            JobReport::Retention(r) => write!(
                f,
                "{} reservations, {} requests, {} quota rows deleted",
                r.reservations_deleted, r.requests_deleted, r.quotas_deleted
            ),
        }
    }
}

/// Result of asking the scheduler to fire a job.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// The run was spawned; the handle resolves to its result.
    Started(JoinHandle<Result<JobReport>>),
    /// A previous run of the same job is still in flight.
    SkippedAlreadyRunning,
}

struct Entry {
    job: Arc<dyn Job>,
    cadence: Cadence,
    running: AtomicBool,
}

/// Registry of jobs with a per-job re-entrancy guard.
pub struct JobScheduler {
    clock: Arc<dyn Clock>,
    entries: Vec<Arc<Entry>>,
    tracker: TaskTracker,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("jobs", &self.entries.iter().map(|e| e.job.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Vec::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Registers a job. Names must be unique.
    pub fn register(&mut self, job: Arc<dyn Job>, cadence: Cadence) -> Result<&mut Self> {
        cadence.validate()?;
        if self.entries.iter().any(|e| e.job.name() == job.name()) {
            return Err(FairslotError::Validation(format!(
                "job '{}' is already registered",
                job.name()
            )));
        }
        self.entries.push(Arc::new(Entry {
            job,
            cadence,
            running: AtomicBool::new(false),
        }));
        Ok(self)
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.job.name()).collect()
    }

    /// Whether a run of the named job is in flight.
    pub fn is_running(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.job.name() == name && e.running.load(Ordering::Acquire))
    }

    /// Fires a job now, subject to the same guard as scheduled firings.
    pub fn trigger(&self, name: &str) -> Result<TriggerOutcome> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.job.name() == name)
            .ok_or_else(|| FairslotError::not_found("job", name))?;
        Ok(fire(&self.tracker, entry))
    }

    /// Drives every registered job on its cadence until `shutdown` fires, then
    /// waits for in-flight runs to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(jobs = ?self.job_names(), "Job scheduler started");
        // A scheduler can be driven again after a previous `run` returned.
        self.tracker.reopen();

        let mut loops = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let entry = entry.clone();
            let clock = self.clock.clone();
            let shutdown = shutdown.clone();
            let tracker = self.tracker.clone();
            loops.push(tokio::spawn(async move {
                let mut target = entry.cadence.next_after(clock.local_now());
                loop {
                    let wait = (target - clock.local_now()).to_std().unwrap_or(Duration::ZERO);
                    tracing::debug!(job = entry.job.name(), next = %target, "Next run scheduled");

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    // Skips are logged inside `fire`; nobody awaits scheduled runs.
                    let _ = fire(&tracker, &entry);

                    // Never schedule the same firing twice, even when the wall
                    // clock lags the timer. A clock that jumped ahead skips the
                    // missed firings instead of replaying them.
                    target = entry.cadence.next_after(target.max(clock.local_now()));
                }
            }));
        }
        for handle in loops {
            let _ = handle.await;
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Job scheduler stopped");
    }
}

fn fire(tracker: &TaskTracker, entry: &Arc<Entry>) -> TriggerOutcome {
    let name = entry.job.name();
    if entry
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        tracing::warn!(job = name, "Previous run still in progress, skipping trigger");
        return TriggerOutcome::SkippedAlreadyRunning;
    }

    let entry = entry.clone();
    let span = tracing::info_span!("job", job = name);
    let handle = tracker.spawn(
        async move {
            let _guard = scopeguard::guard((), |_| {
                entry.running.store(false, Ordering::Release);
            });

            tracing::info!("Job started");
            let result = entry.job.run_once().await;
            match &result {
                Ok(report) => tracing::info!(%report, "Job finished"),
                Err(e) => tracing::error!(error = %e, "Job failed, changes rolled back"),
            }
            result
        }
        .instrument(span),
    );
    TriggerOutcome::Started(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::ErrorKind;
    use chrono::NaiveDate;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Counts runs; optionally parks each run until released.
    struct CountingJob {
        runs: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    impl CountingJob {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                gate: None,
                fail: false,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                gate: Some(gate),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                gate: None,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self) -> Result<JobReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(FairslotError::Other(anyhow::anyhow!("boom")));
            }
            Ok(RetentionReport::default().into())
        }
    }

    fn clock_at(hour: u32, minute: u32) -> Arc<FixedClock> {
        Arc::new(FixedClock::at_local(
            NaiveDate::from_ymd_opt(2024, 6, 10)
                .unwrap()
                .and_hms_opt(hour, minute, 0)
                .unwrap(),
        ))
    }

    #[test_log::test(tokio::test)]
    async fn test_trigger_runs_job() {
        let job = CountingJob::new();
        let mut scheduler = JobScheduler::new(clock_at(9, 0));
        scheduler.register(job.clone(), Cadence::daily(22, 0)).unwrap();

        let TriggerOutcome::Started(handle) = scheduler.trigger("counting").unwrap() else {
            panic!("expected the job to start");
        };
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report, JobReport::Retention(RetentionReport::default()));
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running("counting"));
    }

    #[test_log::test(tokio::test)]
    async fn test_trigger_skips_while_running() {
        let gate = Arc::new(Notify::new());
        let job = CountingJob::gated(gate.clone());
        let mut scheduler = JobScheduler::new(clock_at(9, 0));
        scheduler.register(job.clone(), Cadence::daily(22, 0)).unwrap();

        let TriggerOutcome::Started(first) = scheduler.trigger("counting").unwrap() else {
            panic!("expected the job to start");
        };
        assert!(scheduler.is_running("counting"));
        assert!(matches!(
            scheduler.trigger("counting").unwrap(),
            TriggerOutcome::SkippedAlreadyRunning
        ));

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        // The guard is released once the run finishes.
        gate.notify_one();
        let TriggerOutcome::Started(second) = scheduler.trigger("counting").unwrap() else {
            panic!("expected the job to start again");
        };
        second.await.unwrap().unwrap();
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_run_releases_guard() {
        let job = CountingJob::failing();
        let mut scheduler = JobScheduler::new(clock_at(9, 0));
        scheduler.register(job.clone(), Cadence::daily(22, 0)).unwrap();

        for _ in 0..2 {
            let TriggerOutcome::Started(handle) = scheduler.trigger("counting").unwrap() else {
                panic!("expected the job to start");
            };
            assert!(handle.await.unwrap().is_err());
        }
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_and_duplicate_jobs() {
        let mut scheduler = JobScheduler::new(clock_at(9, 0));
        scheduler
            .register(CountingJob::new(), Cadence::daily(22, 0))
            .unwrap();

        let err = scheduler.trigger("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = scheduler
            .register(CountingJob::new(), Cadence::daily(1, 0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = scheduler
            .register(CountingJob::new(), Cadence::daily(25, 0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_run_fires_on_cadence_until_shutdown() {
        let job = CountingJob::new();
        let mut scheduler = JobScheduler::new(clock_at(21, 59));
        scheduler.register(job.clone(), Cadence::daily(22, 0)).unwrap();
        let scheduler = Arc::new(scheduler);

        let shutdown = CancellationToken::new();
        let driver = tokio::spawn({
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        shutdown.cancel();
        driver.await.unwrap();
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_run_fires_once_per_firing_when_wall_clock_lags() {
        // The wall clock never reaches 22:00 while the timer keeps elapsing.
        let job = CountingJob::new();
        let mut scheduler = JobScheduler::new(clock_at(21, 59));
        scheduler.register(job.clone(), Cadence::daily(22, 0)).unwrap();
        let scheduler = Arc::new(scheduler);

        let shutdown = CancellationToken::new();
        let driver = tokio::spawn({
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        driver.await.unwrap();
    }
}
