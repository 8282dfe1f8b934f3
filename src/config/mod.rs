use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which change-feed operations count as "new work".
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedEvents {
    Insert,
    Update,
    All,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Upper bound on pooled PostgreSQL connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// Base URL under which bucket objects are publicly readable
    pub r2_public_base_url: String,

    /// Bucket holding uploaded source videos and images
    #[serde(default = "default_source_bucket")]
    pub source_bucket: String,

    /// Bucket receiving annotated detection frames
    #[serde(default = "default_results_bucket")]
    pub results_bucket: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// Workers AI object-detection model
    #[serde(default = "default_detection_model")]
    pub detection_model: String,

    /// Only keep detections carrying this label (all labels when unset)
    #[serde(default)]
    pub detection_label: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_source_bucket() -> String {
    "unprocessed_vids".to_string()
}

fn default_results_bucket() -> String {
    "processed_images".to_string()
}

fn default_detection_model() -> String {
    "@cf/facebook/detr-resnet-50".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}

/// Tuning for the discovery loops and the job dispatcher.
#[derive(Debug, Deserialize, Validate)]
pub struct WorkerConfig {
    #[garde(range(min = 1))]
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[garde(range(min = 1, max = 1000))]
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: i64,

    #[garde(skip)]
    #[serde(default = "default_feed_events")]
    pub feed_events: FeedEvents,

    #[garde(range(min = 1))]
    #[serde(default = "default_feed_reconnect_initial_ms")]
    pub feed_reconnect_initial_ms: u64,

    #[garde(range(min = 1))]
    #[serde(default = "default_feed_reconnect_max_ms")]
    pub feed_reconnect_max_ms: u64,

    /// Upper bound on jobs analysed at once; defaults to the CPU count
    #[garde(range(min = 1))]
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,

    #[garde(skip)]
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    #[garde(range(min = 1))]
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,

    #[garde(range(min = 1))]
    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,

    /// ffmpeg binary used to decode video containers
    #[garde(length(min = 1))]
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[garde(length(min = 1))]
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,

    /// Prometheus exporter listen address
    #[garde(skip)]
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_poll_batch_size() -> i64 {
    25
}

fn default_feed_events() -> FeedEvents {
    FeedEvents::Insert
}

fn default_feed_reconnect_initial_ms() -> u64 {
    500
}

fn default_feed_reconnect_max_ms() -> u64 {
    30_000
}

fn default_store_timeout_secs() -> u64 {
    15
}

fn default_storage_timeout_secs() -> u64 {
    120
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrent_jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
