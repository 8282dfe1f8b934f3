use async_trait::async_trait;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;

use crate::db::queries;
use crate::models::job::{Job, JobOutcome};

/// The job table as the worker and the submission API see it.
///
/// `claim` and `write_terminal_status` are the only mutations the worker
/// performs. `create_job` is used by submissions only.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `pending` row. Fails with [`StoreError::Duplicate`] when the
    /// key already has a row.
    async fn create_job(&self, source_file: &str) -> Result<Job, StoreError>;

    /// Atomically move `source_file` from `pending` to `processing`.
    async fn claim(&self, source_file: &str) -> Result<bool, StoreError>;

    /// Record the final outcome of a job this process claimed. Returns false
    /// when the row was no longer `processing`.
    async fn write_terminal_status(
        &self,
        source_file: &str,
        outcome: &JobOutcome,
    ) -> Result<bool, StoreError>;

    /// Up to `limit` pending jobs, oldest first.
    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, source_file: &str) -> Result<Option<Job>, StoreError>;
}

/// Postgres-backed [`JobStore`] with a per-call deadline.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgJobStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(StoreError::from_sqlx),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, source_file: &str) -> Result<Job, StoreError> {
        self.bounded(queries::create_job(&self.pool, source_file))
            .await
    }

    async fn claim(&self, source_file: &str) -> Result<bool, StoreError> {
        self.bounded(queries::claim_job(&self.pool, source_file))
            .await
    }

    async fn write_terminal_status(
        &self,
        source_file: &str,
        outcome: &JobOutcome,
    ) -> Result<bool, StoreError> {
        self.bounded(queries::write_terminal_status(&self.pool, source_file, outcome))
            .await
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        self.bounded(queries::get_pending_jobs(&self.pool, limit))
            .await
    }

    async fn get_job(&self, source_file: &str) -> Result<Option<Job>, StoreError> {
        self.bounded(queries::get_job(&self.pool, source_file))
            .await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job store unavailable: {0}")]
    Unavailable(String),

    #[error("Job already exists")]
    Duplicate,
}

impl StoreError {
    /// Connection-level failures are reported as `Unavailable` so callers can
    /// tell an unreachable table from a failed statement.
    fn from_sqlx(err: sqlx::Error) -> Self {
        let duplicate = err
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation());
        let unreachable = matches!(
            err,
            sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
                | sqlx::Error::Io(_)
        );

        if duplicate {
            StoreError::Duplicate
        } else if unreachable {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Database(err)
        }
    }
}
