use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::job::JobStatus;
use crate::models::submission::{JobStatusResponse, SubmitResponse};
use crate::services::intake::{self, IntakeError, Submission};

const MAX_KEY_LEN: usize = 512;

/// Object keys accepted for new jobs: non-empty, bounded, no path traversal.
pub fn valid_source_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('/')
        && !key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        && !key.chars().any(char::is_control)
}

/// POST /api/v1/jobs: Upload a video or image and queue it for detection.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    let mut file: Option<(Option<String>, Option<String>, Vec<u8>)> = None;
    let mut explicit_key: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                file = Some((filename, content_type, data.to_vec()));
            }
            Some("source_file") => {
                let text = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                explicit_key = Some(text.trim().to_string());
            }
            _ => {}
        }
    }

    let (filename, content_type, data) = file.ok_or(StatusCode::BAD_REQUEST)?;
    if data.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let source_file = explicit_key
        .filter(|k| !k.is_empty())
        .or(filename)
        .ok_or(StatusCode::BAD_REQUEST)?;
    if !valid_source_key(&source_file) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let content_type = image::guess_format(&data)
        .map(|f| f.to_mime_type().to_string())
        .ok()
        .or(content_type)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let submission = Submission {
        source_file: &source_file,
        data: &data,
        content_type: &content_type,
    };
    let job = intake::register(
        state.storage.as_ref(),
        state.jobs.as_ref(),
        &state.source_bucket,
        submission,
    )
    .await
    .map_err(|e| match e {
        IntakeError::Duplicate => StatusCode::CONFLICT,
        IntakeError::Storage(other) => {
            tracing::error!(source_file = %source_file, error = %other, "Source upload failed");
            StatusCode::BAD_GATEWAY
        }
        IntakeError::Store(other) => {
            tracing::error!(source_file = %source_file, error = %other, "Failed to create job row");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;

    metrics::counter!("jobs_submitted_total").increment(1);
    tracing::info!(source_file = %job.source_file, bytes = data.len(), "Job submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            source_file: job.source_file,
            status: JobStatus::Pending.to_string(),
            message: "File submitted for hazard detection".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{*source_file}: Check job status and detection result.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(source_file): Path<String>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = state
        .jobs
        .get_job(&source_file)
        .await
        .map_err(|e| {
            tracing::error!(source_file = %source_file, error = %e, "Job lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(job.into()))
}
