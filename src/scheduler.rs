// Polling Loop Scheduler
//
// Runs a periodic job as a self-rescheduling tokio task: one cycle runs to
// completion, then the loop sleeps for a fixed delay before the next one.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Summary of one job cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// Items the cycle looked at
    pub items_processed: usize,

    /// Rows written
    pub changes_made: usize,

    /// Per-item failures that did not abort the cycle
    pub errors: usize,

    /// Wall time spent in the cycle
    #[serde(with = "serde_duration_millis")]
    pub duration: Duration,
}

// Custom serde module for Duration (serialize/deserialize as milliseconds)
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// A unit of periodic work
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Job name (for logging)
    fn name(&self) -> &str;

    /// Run a single cycle to completion
    async fn run_once(&self) -> Result<JobReport>;
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Cancellable self-rescheduling loop around a [`PeriodicJob`]
///
/// The delay is measured from cycle completion, so cycles of the same loop
/// never overlap. Stopping cancels the pending delay only; a cycle already
/// in flight always runs to completion.
pub struct PollingLoop {
    job: Arc<dyn PeriodicJob>,
    interval: Duration,
    handle: Mutex<Option<LoopHandle>>,
    cycles: Arc<AtomicU64>,
}

impl PollingLoop {
    pub fn new(job: Arc<dyn PeriodicJob>, interval: Duration) -> Self {
        Self {
            job,
            interval,
            handle: Mutex::new(None),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<LoopHandle>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the loop; the first cycle starts immediately
    ///
    /// Returns false if the loop is already running. After `stop()` the
    /// old task may still be finishing its last cycle; the new task waits
    /// for it before running its first cycle.
    pub fn start(&self) -> bool {
        let mut handle = self.lock_handle();

        let previous = match handle.take() {
            Some(existing) if !existing.task.is_finished() => {
                if !existing.cancel.is_cancelled() {
                    tracing::debug!("[{}] Already running", self.job.name());
                    *handle = Some(existing);
                    return false;
                }
                tracing::info!(
                    "[{}] Restarting once the in-flight cycle finishes",
                    self.job.name()
                );
                Some(existing.task)
            }
            _ => None,
        };

        tracing::info!(
            "[{}] Starting with {:?} interval",
            self.job.name(),
            self.interval
        );

        let cancel = CancellationToken::new();
        let job = self.job.clone();
        let interval = self.interval;
        let token = cancel.clone();
        let cycles = self.cycles.clone();

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    tracing::error!("[{}] Previous loop task ended abnormally: {}", job.name(), e);
                }
            }
            run_loop(job, interval, token, cycles).await;
        });

        *handle = Some(LoopHandle { cancel, task });
        true
    }

    /// Cancel the pending next cycle; an in-flight cycle is not interrupted
    pub fn stop(&self) {
        if let Some(existing) = self.lock_handle().as_ref() {
            if !existing.cancel.is_cancelled() {
                tracing::info!("[{}] Stopping", self.job.name());
                existing.cancel.cancel();
            }
        }
    }

    /// True while started and not stopped
    pub fn is_running(&self) -> bool {
        self.lock_handle()
            .as_ref()
            .map(|h| !h.cancel.is_cancelled() && !h.task.is_finished())
            .unwrap_or(false)
    }

    /// Number of cycles that ran to completion (successfully or not)
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Stop and wait for an in-flight cycle to finish
    pub async fn shutdown(&self) {
        let handle = self.lock_handle().take();

        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::error!("[{}] Loop task ended abnormally: {}", self.job.name(), e);
            }
            tracing::info!("[{}] Stopped", self.job.name());
        }
    }
}

async fn run_loop(
    job: Arc<dyn PeriodicJob>,
    interval: Duration,
    cancel: CancellationToken,
    cycles: Arc<AtomicU64>,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        match job.run_once().await {
            Ok(report) => {
                tracing::debug!(
                    "[{}] Cycle done: {} processed, {} changes, {} errors in {:?}",
                    job.name(),
                    report.items_processed,
                    report.changes_made,
                    report.errors,
                    started.elapsed()
                );
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("[{}] Cycle failed, retrying next interval: {}", job.name(), e);
            }
            Err(e) => {
                tracing::error!("[{}] Cycle failed: {}", job.name(), e);
            }
        }
        cycles.fetch_add(1, Ordering::SeqCst);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }

    tracing::debug!("[{}] Loop exited", job.name());
}
