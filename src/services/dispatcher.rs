//! Spawns and supervises one task per claimed job.
//!
//! Jobs run as independent tokio tasks tracked in a registry keyed by source
//! file. A semaphore caps how many of them analyse frames at once; claimed
//! jobs beyond the cap wait for a permit instead of holding up discovery.
//! Each task has an observer that logs a panic and marks the job as errored,
//! so a crash in one job never reaches the discovery loops or other jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::task::TaskTracker;

use crate::services::claim::ClaimCoordinator;
use crate::services::pipeline::Pipeline;

type Registry = Arc<Mutex<HashMap<String, AbortHandle>>>;

pub struct Dispatcher {
    coordinator: ClaimCoordinator,
    pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
    registry: Registry,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(coordinator: ClaimCoordinator, pipeline: Arc<Pipeline>, max_concurrent: usize) -> Self {
        Self {
            coordinator,
            pipeline,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            registry: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Claim `source_file` and, if this worker wins it, start processing.
    ///
    /// Returns true when a task was spawned.
    pub async fn submit(&self, source_file: &str) -> bool {
        if self.is_running(source_file) {
            tracing::debug!(source_file, "Job already running in this worker, skipping claim");
            return false;
        }

        if !self.coordinator.claim(source_file).await {
            return false;
        }

        self.spawn(source_file.to_string());
        true
    }

    fn spawn(&self, source_file: String) {
        let pipeline = Arc::clone(&self.pipeline);
        let permits = Arc::clone(&self.permits);
        let key = source_file.clone();

        // Holding the lock across spawn keeps the observer's removal ordered after this insert.
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::error!(source_file = %key, "Worker pool closed before job could start");
                return;
            };

            metrics::gauge!("jobs_in_flight").increment(1.0);
            tracing::info!(source_file = %key, "Job started");
            let status = pipeline.run(&key).await;
            metrics::gauge!("jobs_in_flight").decrement(1.0);
            tracing::debug!(source_file = %key, %status, "Job task exiting");
        });
        registry.insert(source_file.clone(), handle.abort_handle());
        drop(registry);

        self.tracker.spawn(observe(
            source_file,
            handle,
            Arc::clone(&self.registry),
            Arc::clone(&self.pipeline),
        ));
    }

    /// Number of jobs with a live task in this worker.
    pub fn in_flight(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_running(&self, source_file: &str) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(source_file)
    }

    /// Stop accepting work and wait for every in-flight job to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        let remaining = self.in_flight();
        if remaining > 0 {
            tracing::info!(in_flight = remaining, "Waiting for in-flight jobs to finish");
        }
        self.tracker.wait().await;
    }
}

/// Completion observer for one job task.
async fn observe(
    source_file: String,
    handle: JoinHandle<()>,
    registry: Registry,
    pipeline: Arc<Pipeline>,
) {
    let result = handle.await;

    registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&source_file);

    if let Err(e) = result {
        report_failure(&source_file, e, &pipeline).await;
    }
}

async fn report_failure(source_file: &str, error: JoinError, pipeline: &Pipeline) {
    if error.is_panic() {
        metrics::counter!("task_panics_total").increment(1);
        metrics::gauge!("jobs_in_flight").decrement(1.0);
        tracing::error!(source_file, error = %error, "Job task panicked");
    } else {
        tracing::warn!(source_file, error = %error, "Job task was cancelled");
    }
    pipeline.mark_failed(source_file).await;
}
