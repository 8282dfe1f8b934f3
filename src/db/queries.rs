use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;

use crate::models::job::{Job, JobOutcome, JobStatus};

const JOB_COLUMNS: &str = r#"
    source_file, status,
    confidence::float8 AS confidence,
    location_xyxy::float8[] AS location_xyxy,
    width::float8 AS width,
    height::float8 AS height,
    center::float8[] AS center,
    image_url, created_at
"#;

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Job {
        source_file: row.try_get("source_file")?,
        status,
        confidence: row.try_get("confidence")?,
        location_xyxy: row.try_get("location_xyxy")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        center: row.try_get("center")?,
        image_url: row.try_get("image_url")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert a new job in the `pending` state
pub async fn create_job(pool: &PgPool, source_file: &str) -> Result<Job, sqlx::Error> {
    let sql = format!(
        "INSERT INTO pothole_image_data (source_file, status) VALUES ($1, 'pending') RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&sql).bind(source_file).fetch_one(pool).await?;
    job_from_row(&row)
}

/// Get a job by its source file name
pub async fn get_job(pool: &PgPool, source_file: &str) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM pothole_image_data WHERE source_file = $1");
    let row = sqlx::query(&sql)
        .bind(source_file)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Get pending jobs, oldest first
pub async fn get_pending_jobs(pool: &PgPool, limit: i64) -> Result<Vec<Job>, sqlx::Error> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM pothole_image_data WHERE status = 'pending' ORDER BY created_at ASC LIMIT $1"
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;

    rows.iter().map(job_from_row).collect()
}

/// Flip a job from `pending` to `processing`.
///
/// Returns true only for the caller whose update touched the row.
pub async fn claim_job(pool: &PgPool, source_file: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE pothole_image_data
        SET status = 'processing'
        WHERE source_file = $1 AND status = 'pending'
        "#,
    )
    .bind(source_file)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Write the terminal status and detection fields of a claimed job.
///
/// Only a row still in `processing` is updated, so a terminal state is never overwritten.
pub async fn write_terminal_status(
    pool: &PgPool,
    source_file: &str,
    outcome: &JobOutcome,
) -> Result<bool, sqlx::Error> {
    let hazard = outcome.hazard();

    let result = sqlx::query(
        r#"
        UPDATE pothole_image_data
        SET status = $2,
            confidence = $3::numeric(7, 4),
            location_xyxy = $4::numeric(10, 2)[],
            width = $5::numeric(10, 2),
            height = $6::numeric(10, 2),
            center = $7::numeric(10, 2)[],
            image_url = $8
        WHERE source_file = $1 AND status = 'processing'
        "#,
    )
    .bind(source_file)
    .bind(outcome.status().as_ref())
    .bind(hazard.map(|h| h.confidence))
    .bind(hazard.map(|h| h.location_xyxy.to_vec()))
    .bind(hazard.map(|h| h.width))
    .bind(hazard.map(|h| h.height))
    .bind(hazard.map(|h| h.center.to_vec()))
    .bind(outcome.image_url())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Number of jobs waiting for a worker and currently being processed.
pub async fn job_backlog(pool: &PgPool) -> Result<(i64, i64), sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT
            count(*) FILTER (WHERE status = 'pending') AS pending,
            count(*) FILTER (WHERE status = 'processing') AS processing
        FROM pothole_image_data
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok((row.try_get("pending")?, row.try_get("processing")?))
}
