//! Registering a submitted file as a pending job.

use crate::db::store::{JobStore, StoreError};
use crate::models::job::Job;
use crate::services::storage::{ObjectStore, StorageError};

/// A file received by the API, not yet stored.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub source_file: &'a str,
    pub data: &'a [u8],
    pub content_type: &'a str,
}

/// Upload the file to `bucket` and insert its `pending` row.
///
/// The upload refuses to replace an existing object. When the object is
/// already there but the table has no row for it, an earlier submission
/// uploaded it and then failed to insert; the object is replaced and the
/// insert retried. Only an existing row makes the submission a duplicate.
pub async fn register(
    objects: &dyn ObjectStore,
    jobs: &dyn JobStore,
    bucket: &str,
    submission: Submission<'_>,
) -> Result<Job, IntakeError> {
    let Submission {
        source_file,
        data,
        content_type,
    } = submission;

    match objects
        .upload(bucket, source_file, data, content_type, false)
        .await
    {
        Ok(()) => {}
        Err(StorageError::AlreadyExists(_)) => {
            if jobs.get_job(source_file).await?.is_some() {
                return Err(IntakeError::Duplicate);
            }
            tracing::warn!(
                source_file = %source_file,
                "Replacing source object left by a submission without a job row"
            );
            objects
                .upload(bucket, source_file, data, content_type, true)
                .await?;
        }
        Err(e) => return Err(e.into()),
    }

    match jobs.create_job(source_file).await {
        Ok(job) => Ok(job),
        Err(StoreError::Duplicate) => Err(IntakeError::Duplicate),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("A job for this file already exists")]
    Duplicate,

    #[error("Source upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Job store failed: {0}")]
    Store(#[from] StoreError),
}
