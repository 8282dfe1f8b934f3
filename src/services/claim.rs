use std::sync::Arc;
use strum::Display;

use crate::db::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ClaimOutcome {
    /// This caller moved the job to `processing` and owns it.
    Claimed,
    /// The job was already claimed or is no longer pending.
    Lost,
    /// The store could not be asked; treated as not claimed.
    Failed,
}

/// Single point through which jobs become owned by this worker.
#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn JobStore>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn try_claim(&self, source_file: &str) -> ClaimOutcome {
        match self.store.claim(source_file).await {
            Ok(true) => {
                metrics::counter!("jobs_claimed_total").increment(1);
                tracing::info!(source_file, "Claimed job, status set to processing");
                ClaimOutcome::Claimed
            }
            Ok(false) => {
                metrics::counter!("claims_lost_total").increment(1);
                tracing::debug!(source_file, "Job already claimed or no longer pending");
                ClaimOutcome::Lost
            }
            Err(e) => {
                metrics::counter!("claim_errors_total").increment(1);
                tracing::error!(source_file, error = %e, "Claim failed, not dispatching");
                ClaimOutcome::Failed
            }
        }
    }

    /// True iff this call won the job.
    pub async fn claim(&self, source_file: &str) -> bool {
        self.try_claim(source_file).await == ClaimOutcome::Claimed
    }
}
