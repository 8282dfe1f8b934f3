//! Per-job processing: fetch the artifact, run detection on every frame,
//! publish the best hit and write the terminal status.

use image::RgbImage;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::store::JobStore;
use crate::models::detection::{BestHazard, HazardTracker};
use crate::models::job::{JobOutcome, JobStatus};
use crate::services::frames::{self, FrameDecoder, FrameError};
use crate::services::inference::Detector;
use crate::services::staging::{flatten_key, staging_path, StagedFile};
use crate::services::storage::{ObjectStore, StorageError};

/// Where artifacts come from and go to.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub staging_dir: PathBuf,
    pub source_bucket: String,
    pub results_bucket: String,
    pub storage_timeout: Duration,
}

/// Storage path of the annotated frame for a job.
pub fn detection_path(source_file: &str) -> String {
    format!("detections/{}.jpg", flatten_key(source_file))
}

struct Analysis {
    hazard: BestHazard,
    annotated: StagedFile,
}

pub struct Pipeline {
    store: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    detector: Arc<dyn Detector>,
    decoder: Arc<dyn FrameDecoder>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        detector: Arc<dyn Detector>,
        decoder: Arc<dyn FrameDecoder>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            objects,
            detector,
            decoder,
            settings,
        }
    }

    /// Process a job this worker has claimed and return the status it ends in.
    ///
    /// Never fails: every error becomes a best-effort `error` write.
    pub async fn run(&self, source_file: &str) -> JobStatus {
        let started = Instant::now();

        let status = match self.process(source_file).await {
            Ok(outcome) => self.finish(source_file, outcome).await,
            Err(e) => {
                tracing::error!(source_file, error = %e, "Job processing failed");
                self.mark_failed(source_file).await;
                JobStatus::Error
            }
        };

        metrics::histogram!("job_processing_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("jobs_finished_total", "status" => status.to_string()).increment(1);
        status
    }

    /// Best-effort `error` write for a claimed job. Returns whether it landed.
    pub async fn mark_failed(&self, source_file: &str) -> bool {
        match self
            .store
            .write_terminal_status(source_file, &JobOutcome::Error)
            .await
        {
            Ok(true) => {
                tracing::info!(source_file, status = %JobStatus::Error, "Job marked as error");
                true
            }
            Ok(false) => {
                tracing::warn!(source_file, "Job was not processing, error status not written");
                false
            }
            Err(e) => {
                tracing::error!(
                    source_file,
                    error = %e,
                    "Could not write error status, job stays in processing"
                );
                false
            }
        }
    }

    async fn finish(&self, source_file: &str, outcome: JobOutcome) -> JobStatus {
        match self.store.write_terminal_status(source_file, &outcome).await {
            Ok(true) => {
                tracing::info!(source_file, status = %outcome.status(), "Job finished");
                outcome.status()
            }
            Ok(false) => {
                tracing::warn!(
                    source_file,
                    status = %outcome.status(),
                    "Job was not processing, terminal status not written"
                );
                outcome.status()
            }
            Err(e) => {
                tracing::error!(source_file, error = %e, "Failed to write terminal status");
                self.mark_failed(source_file).await;
                JobStatus::Error
            }
        }
    }

    async fn process(&self, source_file: &str) -> Result<JobOutcome, PipelineError> {
        let staged = self.fetch(source_file).await?;

        tracing::info!(source_file, "Analyzing frames");
        let analysis = self.analyze(source_file, &staged).await?;

        match analysis {
            Some(analysis) => {
                let hazard = analysis.hazard.record();
                let image_url = self.publish(source_file, &analysis.annotated).await?;
                tracing::info!(
                    source_file,
                    frame = analysis.hazard.frame_index,
                    hazard = %hazard,
                    "Best hazard recorded"
                );
                Ok(JobOutcome::Completed { hazard, image_url })
            }
            None => {
                tracing::info!(source_file, "No hazards found");
                Ok(JobOutcome::NoHazardsFound)
            }
        }
    }

    async fn fetch(&self, source_file: &str) -> Result<StagedFile, PipelineError> {
        tracing::info!(source_file, bucket = %self.settings.source_bucket, "Downloading source artifact");
        let bytes = self
            .with_deadline(self.objects.download(&self.settings.source_bucket, source_file))
            .await
            .map_err(PipelineError::Download)?;

        let path = staging_path(&self.settings.staging_dir, "temp", source_file, "");
        let staged = StagedFile::write(path, &bytes).await?;
        tracing::debug!(source_file, path = %staged.path().display(), bytes = bytes.len(), "Artifact staged");
        Ok(staged)
    }

    async fn analyze(
        &self,
        source_file: &str,
        staged: &StagedFile,
    ) -> Result<Option<Analysis>, PipelineError> {
        let decoder = Arc::clone(&self.decoder);
        let detector = Arc::clone(&self.detector);
        let source = staged.path().to_path_buf();
        let annotated_path = staging_path(&self.settings.staging_dir, "best", source_file, ".jpg");

        let task = tokio::task::spawn_blocking(move || {
            analyze_frames(decoder.as_ref(), detector.as_ref(), &source, annotated_path)
        });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(PipelineError::Inference(panic_message(e.into_panic()))),
            Err(e) => Err(PipelineError::Inference(e.to_string())),
        }
    }

    async fn publish(
        &self,
        source_file: &str,
        annotated: &StagedFile,
    ) -> Result<String, PipelineError> {
        let bytes = tokio::fs::read(annotated.path()).await?;
        let path = detection_path(source_file);

        tracing::info!(source_file, bucket = %self.settings.results_bucket, path = %path, "Uploading annotated frame");
        self.with_deadline(self.objects.upload(
            &self.settings.results_bucket,
            &path,
            &bytes,
            "image/jpeg",
            true,
        ))
        .await
        .map_err(PipelineError::Upload)?;

        Ok(self.objects.public_url(&self.settings.results_bucket, &path))
    }

    async fn with_deadline<T, F>(&self, call: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        tokio::time::timeout(self.settings.storage_timeout, call)
            .await
            .unwrap_or(Err(StorageError::Timeout(self.settings.storage_timeout)))
    }
}

/// Decode, detect and reduce. Runs on the blocking pool.
fn analyze_frames(
    decoder: &dyn FrameDecoder,
    detector: &dyn Detector,
    source: &Path,
    annotated_path: PathBuf,
) -> Result<Option<Analysis>, PipelineError> {
    let mut tracker = HazardTracker::new();
    let mut best_frame: Option<RgbImage> = None;
    let mut frame_count = 0usize;

    for (index, frame) in decoder.frames(source)?.enumerate() {
        let frame = frame?;
        let detections = detector
            .detect(&frame)
            .map_err(|e| PipelineError::Inference(e.to_string()))?;
        if tracker.observe(index, &detections) {
            best_frame = Some(frame);
        }
        frame_count += 1;
    }

    tracing::debug!(frames = frame_count, best = tracker.max_confidence(), "Frame analysis done");

    let (Some(hazard), Some(frame)) = (tracker.into_best(), best_frame) else {
        return Ok(None);
    };

    let annotated = StagedFile::adopt(annotated_path);
    let jpeg = frames::encode_jpeg(&frames::annotate(&frame, &hazard.detection))?;
    std::fs::write(annotated.path(), jpeg)?;

    Ok(Some(Analysis { hazard, annotated }))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "analysis task panicked".to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Download failed: {0}")]
    Download(#[source] StorageError),

    #[error("Upload failed: {0}")]
    Upload(#[source] StorageError),

    #[error("Inference crashed: {0}")]
    Inference(String),

    #[error("Frame decoding failed: {0}")]
    Decode(#[from] FrameError),

    #[error("Staging I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
