use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::models::detection::HazardRecord;

/// Status of a detection job in the shared job table.
///
/// Moves forward only: `pending -> processing -> {completed | error | no_hazards_found}`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
    NoHazardsFound,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::NoHazardsFound
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next == JobStatus::Processing,
            JobStatus::Processing => next.is_terminal(),
            _ => false,
        }
    }
}

/// A row of the job table, keyed by the uploaded file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub source_file: String,
    pub status: JobStatus,
    pub confidence: Option<f64>,
    pub location_xyxy: Option<Vec<f64>>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub center: Option<Vec<f64>>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal result written once by the task that claimed the job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        hazard: HazardRecord,
        image_url: String,
    },
    NoHazardsFound,
    Error,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::NoHazardsFound => JobStatus::NoHazardsFound,
            JobOutcome::Error => JobStatus::Error,
        }
    }

    /// Detection fields are written all together or not at all.
    pub fn hazard(&self) -> Option<&HazardRecord> {
        match self {
            JobOutcome::Completed { hazard, .. } => Some(hazard),
            _ => None,
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match self {
            JobOutcome::Completed { image_url, .. } => Some(image_url),
            _ => None,
        }
    }
}
