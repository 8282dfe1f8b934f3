use sqlx::PgPool;
use std::sync::Arc;

use crate::db::store::JobStore;
use crate::services::storage::ObjectStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub jobs: Arc<dyn JobStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub source_bucket: String,
}

impl AppState {
    pub fn new(
        db: PgPool,
        jobs: Arc<dyn JobStore>,
        storage: Arc<dyn ObjectStore>,
        source_bucket: &str,
    ) -> Self {
        Self {
            db,
            jobs,
            storage,
            source_bucket: source_bucket.to_string(),
        }
    }
}
