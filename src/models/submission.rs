use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::detection::{fixed, CONFIDENCE_PLACES, GEOMETRY_PLACES};
use crate::models::job::Job;

/// Response after submitting a file for hazard detection.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub source_file: String,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
///
/// Numeric detection fields are decimal strings at the scale of their
/// columns, so `0.9` is returned as `"0.9000"`.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub source_file: String,
    pub status: String,
    pub confidence: Option<String>,
    pub location_xyxy: Option<Vec<String>>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub center: Option<Vec<String>>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        let geo = |v: f64| fixed(v, GEOMETRY_PLACES);
        let geo_all = |vs: Vec<f64>| vs.into_iter().map(geo).collect::<Vec<_>>();
        Self {
            source_file: job.source_file,
            status: job.status.to_string(),
            confidence: job.confidence.map(|c| fixed(c, CONFIDENCE_PLACES)),
            location_xyxy: job.location_xyxy.map(geo_all),
            width: job.width.map(geo),
            height: job.height.map(geo),
            center: job.center.map(geo_all),
            image_url: job.image_url,
            created_at: job.created_at,
        }
    }
}
