//! In-memory collaborators for driving the worker without Postgres, R2 or Workers AI.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hazard_scan::{
    db::store::{JobStore, StoreError},
    models::{
        detection::Detection,
        job::{Job, JobOutcome, JobStatus},
    },
    services::{
        claim::ClaimCoordinator,
        dispatcher::Dispatcher,
        feed::{ChangeFeed, FeedError, FeedEvent, FeedOp, FeedRecord, FeedSubscription},
        frames::{FrameDecoder, FrameError, Frames},
        inference::{Detector, InferenceError},
        pipeline::{Pipeline, PipelineSettings},
        storage::{ObjectStore, StorageError},
    },
};
use image::RgbImage;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SOURCE_BUCKET: &str = "unprocessed_vids";
pub const RESULTS_BUCKET: &str = "processed_images";
pub const PUBLIC_BASE: &str = "https://cdn.test";

// ── Job store ───────────────────────────────────────────────────────

/// Job table with the same claim and terminal-write guards as the SQL.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
    epoch: DateTime<Utc>,
    inserted: AtomicUsize,
    unreachable: AtomicBool,
    panic_next_write: AtomicBool,
    pub fail_creates: AtomicBool,
    pub claim_calls: AtomicUsize,
    pub terminal_writes: Mutex<Vec<(String, JobStatus)>>,
}

impl MemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            epoch: Utc::now(),
            inserted: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
            panic_next_write: AtomicBool::new(false),
            fail_creates: AtomicBool::new(false),
            claim_calls: AtomicUsize::new(0),
            terminal_writes: Mutex::new(Vec::new()),
        })
    }

    /// Insert a pending job; later inserts get later `created_at` values.
    pub fn insert_pending(&self, source_file: &str) {
        let job = self.pending_row(source_file);
        self.jobs.lock().unwrap().insert(source_file.to_string(), job);
    }

    pub fn contains(&self, source_file: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(source_file)
    }

    fn pending_row(&self, source_file: &str) -> Job {
        let n = self.inserted.fetch_add(1, Ordering::SeqCst) as i64;
        Job {
            source_file: source_file.to_string(),
            status: JobStatus::Pending,
            confidence: None,
            location_xyxy: None,
            width: None,
            height: None,
            center: None,
            image_url: None,
            created_at: self.epoch + ChronoDuration::milliseconds(n),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next terminal write panics instead of landing.
    pub fn panic_on_next_write(&self) {
        self.panic_next_write.store(true, Ordering::SeqCst);
    }

    pub fn job(&self, source_file: &str) -> Job {
        self.jobs.lock().unwrap()[source_file].clone()
    }

    pub fn status(&self, source_file: &str) -> JobStatus {
        self.job(source_file).status
    }

    pub fn writes_for(&self, source_file: &str) -> usize {
        self.terminal_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key == source_file)
            .count()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, source_file: &str) -> Result<Job, StoreError> {
        self.check()?;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::Protocol(
                "insert rejected".to_string(),
            )));
        }
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(source_file) {
            return Err(StoreError::Duplicate);
        }
        let job = self.pending_row(source_file);
        jobs.insert(source_file.to_string(), job.clone());
        Ok(job)
    }

    async fn claim(&self, source_file: &str) -> Result<bool, StoreError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(source_file) {
            Some(job) if job.status.can_transition_to(JobStatus::Processing) => {
                job.status = JobStatus::Processing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn write_terminal_status(
        &self,
        source_file: &str,
        outcome: &JobOutcome,
    ) -> Result<bool, StoreError> {
        if self.panic_next_write.swap(false, Ordering::SeqCst) {
            panic!("store crashed while writing {source_file}");
        }
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(source_file) else {
            return Ok(false);
        };
        if !job.status.can_transition_to(outcome.status()) {
            return Ok(false);
        }

        let hazard = outcome.hazard();
        job.status = outcome.status();
        job.confidence = hazard.map(|h| h.confidence);
        job.location_xyxy = hazard.map(|h| h.location_xyxy.to_vec());
        job.width = hazard.map(|h| h.width);
        job.height = hazard.map(|h| h.height);
        job.center = hazard.map(|h| h.center.to_vec());
        job.image_url = outcome.image_url().map(str::to_string);

        self.terminal_writes
            .lock()
            .unwrap()
            .push((source_file.to_string(), outcome.status()));
        Ok(true)
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        self.check()?;
        let mut pending: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn get_job(&self, source_file: &str) -> Result<Option<Job>, StoreError> {
        self.check()?;
        Ok(self.jobs.lock().unwrap().get(source_file).cloned())
    }
}

// ── Object store ────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_downloads: AtomicBool,
    pub fail_uploads: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, bucket: &str, path: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{bucket}/{path}"), data.to_vec());
    }

    pub fn get(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&format!("{bucket}/{path}"))
            .cloned()
    }

    pub fn count_in(&self, bucket: &str) -> usize {
        let prefix = format!("{bucket}/");
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(StorageError::Status { code: 503, path: format!("{bucket}/{path}") });
        }
        self.get(bucket, path)
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{path}")))
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: &[u8],
        _content_type: &str,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Status { code: 503, path: format!("{bucket}/{path}") });
        }
        if !overwrite && self.get(bucket, path).is_some() {
            return Err(StorageError::AlreadyExists(format!("{bucket}/{path}")));
        }
        self.put(bucket, path, data);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{PUBLIC_BASE}/{bucket}/{path}")
    }
}

// ── Frames and detections ───────────────────────────────────────────

/// Yields `frames` blank frames for any staged file that exists.
pub struct BlankFrames {
    frames: usize,
    pub decode_calls: AtomicUsize,
}

impl BlankFrames {
    pub fn new(frames: usize) -> Arc<Self> {
        Arc::new(Self {
            frames,
            decode_calls: AtomicUsize::new(0),
        })
    }
}

impl FrameDecoder for BlankFrames {
    fn frames(&self, path: &Path) -> Result<Frames, FrameError> {
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        if !path.exists() {
            return Err(FrameError::Unsupported(path.display().to_string()));
        }
        let frames = (0..self.frames).map(|_| Ok(RgbImage::new(64, 48)));
        Ok(Box::new(frames.collect::<Vec<_>>().into_iter()))
    }
}

/// Returns the scripted detections for the n-th frame it sees.
pub struct ScriptedDetector {
    script: Vec<Vec<Detection>>,
    panic_on: Option<usize>,
    fail_on: Option<usize>,
    pub calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<Detection>>) -> Arc<Self> {
        Arc::new(Self {
            script,
            panic_on: None,
            fail_on: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn panicking_on(frame: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Vec::new(),
            panic_on: Some(frame),
            fail_on: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing_on(frame: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Vec::new(),
            panic_on: None,
            fail_on: Some(frame),
            calls: AtomicUsize::new(0),
        })
    }
}

impl Detector for ScriptedDetector {
    fn detect(&self, _frame: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on == Some(n) {
            panic!("model crashed on frame {n}");
        }
        if self.fail_on == Some(n) {
            return Err(InferenceError::Rejected("model unavailable".to_string()));
        }
        Ok(self.script.get(n).cloned().unwrap_or_default())
    }
}

pub fn hit(confidence: f64, x1: f64) -> Detection {
    Detection::from_xyxy(confidence, [x1, 8.0, x1 + 12.0, 20.0])
}

// ── Change feed ─────────────────────────────────────────────────────

pub enum SessionEnd {
    Closed,
    ChannelError,
}

pub enum FeedStep {
    /// `subscribe` itself fails.
    Fail(FeedError),
    /// A subscription that yields these items, then ends.
    Session(Vec<Result<FeedEvent, FeedError>>, SessionEnd),
}

/// Plays back `FeedStep`s; once exhausted, subscriptions stay open and silent.
pub struct ScriptedFeed {
    steps: Mutex<VecDeque<FeedStep>>,
    pub subscribes: AtomicUsize,
    pub sessions_started: Arc<AtomicUsize>,
}

impl ScriptedFeed {
    pub fn new(steps: Vec<FeedStep>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            subscribes: AtomicUsize::new(0),
            sessions_started: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn subscribe(&self) -> Result<Box<dyn FeedSubscription>, FeedError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(FeedStep::Fail(e)) => Err(e),
            Some(FeedStep::Session(items, end)) => Ok(Box::new(ScriptedSubscription {
                items: items.into(),
                end: Some(end),
                started: Arc::clone(&self.sessions_started),
                counted: false,
            })),
            None => Ok(Box::new(ScriptedSubscription {
                items: VecDeque::new(),
                end: None,
                started: Arc::clone(&self.sessions_started),
                counted: false,
            })),
        }
    }
}

struct ScriptedSubscription {
    items: VecDeque<Result<FeedEvent, FeedError>>,
    end: Option<SessionEnd>,
    started: Arc<AtomicUsize>,
    counted: bool,
}

#[async_trait]
impl FeedSubscription for ScriptedSubscription {
    async fn next_event(&mut self) -> Result<Option<FeedEvent>, FeedError> {
        if !self.counted {
            self.counted = true;
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(item) = self.items.pop_front() {
            return item.map(Some);
        }
        match self.end.take() {
            Some(SessionEnd::Closed) => Ok(None),
            Some(SessionEnd::ChannelError) => Err(FeedError::Channel(sqlx::Error::PoolClosed)),
            None => futures::future::pending().await,
        }
    }
}

pub fn feed_event(op: FeedOp, source_file: &str, status: &str) -> FeedEvent {
    FeedEvent {
        op,
        record: FeedRecord {
            source_file: Some(source_file.to_string()),
            status: Some(status.to_string()),
        },
    }
}

// ── Wiring ──────────────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub detector: Arc<ScriptedDetector>,
    pub decoder: Arc<BlankFrames>,
    pub pipeline: Arc<Pipeline>,
    pub dispatcher: Arc<Dispatcher>,
    pub staging: tempfile::TempDir,
}

impl Harness {
    pub fn new(detector: Arc<ScriptedDetector>, frames: usize) -> Self {
        let store = MemoryJobStore::new();
        let objects = MemoryObjectStore::new();
        let decoder = BlankFrames::new(frames);
        let staging = tempfile::tempdir().unwrap();

        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            objects.clone(),
            detector.clone(),
            decoder.clone(),
            PipelineSettings {
                staging_dir: staging.path().to_path_buf(),
                source_bucket: SOURCE_BUCKET.to_string(),
                results_bucket: RESULTS_BUCKET.to_string(),
                storage_timeout: Duration::from_secs(5),
            },
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            ClaimCoordinator::new(store.clone()),
            Arc::clone(&pipeline),
            4,
        ));

        Self {
            store,
            objects,
            detector,
            decoder,
            pipeline,
            dispatcher,
            staging,
        }
    }

    /// A pending job whose source artifact is in the source bucket.
    pub fn add_job(&self, source_file: &str) {
        self.objects.put(SOURCE_BUCKET, source_file, b"fake video bytes");
        self.store.insert_pending(source_file);
    }

    /// Names of files left in the staging directory.
    pub fn staged_files(&self) -> Vec<String> {
        std::fs::read_dir(self.staging.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}

/// Poll `condition` every few milliseconds until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
