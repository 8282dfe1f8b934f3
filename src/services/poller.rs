//! Periodic scan for pending jobs.
//!
//! Catches jobs the change feed never announced: rows written before the
//! listener attached, during a reconnect window, or by an operation the
//! feed is not subscribed to.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::store::{JobStore, StoreError};
use crate::services::dispatcher::Dispatcher;

pub struct Poller {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    batch_size: i64,
}

impl Poller {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            dispatcher,
            interval,
            batch_size,
        }
    }

    /// Run one scan. Returns how many jobs this worker started.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let jobs = self.store.pending_jobs(self.batch_size).await?;
        if !jobs.is_empty() {
            tracing::debug!(pending = jobs.len(), "Poller found pending jobs");
        }

        let mut started = 0;
        for job in jobs {
            if self.dispatcher.submit(&job.source_file).await {
                tracing::info!(source_file = %job.source_file, "Pending job picked up by poller");
                started += 1;
            }
        }
        Ok(started)
    }

    /// Scan every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs_f64(),
            batch_size = self.batch_size,
            "Pending-job poller started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Pending-job poller stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        metrics::counter!("poll_failures_total").increment(1);
                        tracing::error!(error = %e, "Pending-job scan failed, retrying next interval");
                    }
                }
            }
        }
    }
}
