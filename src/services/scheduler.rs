use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::db::now_epoch;

/// A unit of recurring background work.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &JobContext) -> Result<()>;
}

/// Handed to every tick. Jobs poll it between batches to observe shutdown.
#[derive(Clone)]
pub struct JobContext {
    job: String,
    shutdown: CancellationToken,
}

impl JobContext {
    pub fn new(job: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            job: job.into(),
            shutdown,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Sleeps for `duration` unless shutdown starts first. Returns false when cut short.
    pub async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_stopping();
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub initial_delay: Duration,
    /// Fire as soon as the initial delay ends instead of one interval later
    pub run_immediately: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            run_immediately: true,
        }
    }
}

impl JobOptions {
    pub fn delayed(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobState {
    pub name: String,
    pub interval_secs: u64,
    pub runs: u64,
    pub skipped: u64,
    pub failures: u64,
    pub last_started_at: Option<i64>,
    pub last_finished_at: Option<i64>,
    pub last_error: Option<String>,
    pub running: bool,
}

struct JobSlot {
    job: Arc<dyn Job>,
    running: AtomicBool,
    state: Mutex<JobState>,
}

impl JobSlot {
    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds the per-job running flag; dropping it (even while unwinding) frees the job.
struct RunGuard {
    slot: Arc<JobSlot>,
}

impl RunGuard {
    fn acquire(slot: &Arc<JobSlot>) -> Option<Self> {
        slot.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { slot: slot.clone() })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.slot.state().running = false;
        self.slot.running.store(false, Ordering::Release);
    }
}

/// In-process timer wheel for the worker's recurring jobs. Ticks of one job
/// never overlap; different jobs run concurrently.
pub struct JobScheduler {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    slots: Mutex<Vec<Arc<JobSlot>>>,
}

impl JobScheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            tracker: TaskTracker::new(),
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn schedule(&self, job: Arc<dyn Job>, every: Duration, options: JobOptions) {
        let every = every.max(Duration::from_millis(1));
        let slot = Arc::new(JobSlot {
            state: Mutex::new(JobState {
                name: job.name().to_string(),
                interval_secs: every.as_secs(),
                ..JobState::default()
            }),
            job,
            running: AtomicBool::new(false),
        });
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(slot.clone());

        info!(
            job = %slot.job.name(),
            interval_secs = every.as_secs(),
            initial_delay_secs = options.initial_delay.as_secs(),
            "job scheduled"
        );

        let shutdown = self.shutdown.clone();
        let tracker = self.tracker.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = sleep(options.initial_delay) => {}
            }
            let first = if options.run_immediately {
                Instant::now()
            } else {
                Instant::now() + every
            };
            let mut ticker = interval_at(first, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                fire(&slot, &tracker, &shutdown);
            }
        });
    }

    /// Runs a job once outside any timer, with the same panic containment.
    pub async fn run_once(&self, job: &dyn Job) -> Result<()> {
        let ctx = JobContext::new(job.name(), self.shutdown.clone());
        match AssertUnwindSafe(job.run(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("job {} panicked: {}", job.name(), panic_message(&*panic))),
        }
    }

    pub fn job_states(&self) -> Vec<JobState> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|slot| slot.state().clone())
            .collect()
    }

    /// Stops issuing ticks and waits for in-flight ones. Returns false on timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        let in_flight = self.tracker.len();
        info!(in_flight, timeout_secs = timeout.as_secs(), "scheduler draining");
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("scheduler drained");
                true
            }
            Err(_) => {
                warn!("scheduler shutdown timed out with work still in flight");
                false
            }
        }
    }
}

fn fire(slot: &Arc<JobSlot>, tracker: &TaskTracker, shutdown: &CancellationToken) {
    let Some(guard) = RunGuard::acquire(slot) else {
        slot.state().skipped += 1;
        warn!(job = %slot.job.name(), "previous tick still running, skipping");
        return;
    };
    {
        let mut state = slot.state();
        state.running = true;
        state.last_started_at = Some(now_epoch());
    }

    let slot = slot.clone();
    let ctx = JobContext::new(slot.job.name(), shutdown.clone());
    tracker.spawn(async move {
        let _guard = guard;
        let started = std::time::Instant::now();
        let outcome = AssertUnwindSafe(slot.job.run(&ctx)).catch_unwind().await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(format!("panicked: {}", panic_message(&*panic))),
        };

        let mut state = slot.state();
        state.runs += 1;
        state.last_finished_at = Some(now_epoch());
        match error {
            None => {
                state.last_error = None;
                info!(job = %slot.job.name(), elapsed_ms = started.elapsed().as_millis() as u64, "job tick finished");
            }
            Some(message) => {
                state.failures += 1;
                error!(job = %slot.job.name(), error = %message, "job tick failed");
                state.last_error = Some(message);
            }
        }
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
