use garde::Validate;
use hazard_scan::{
    config::{AppConfig, WorkerConfig},
    db::{
        self,
        store::{JobStore, PgJobStore},
    },
    services::{
        claim::ClaimCoordinator,
        dispatcher::Dispatcher,
        feed::{FeedFilter, FeedListener, PgChangeFeed, ReconnectConfig, JOB_CHANGES_CHANNEL},
        frames::{FfmpegFrameDecoder, ImageFrameDecoder},
        inference::WorkersAiDetector,
        pipeline::{Pipeline, PipelineSettings},
        poller::Poller,
        storage::R2Client,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting hazard detection worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    let worker_config = WorkerConfig::from_env().expect("Failed to load worker configuration");
    worker_config
        .validate()
        .expect("Invalid worker configuration");

    let metrics_addr: SocketAddr = worker_config
        .metrics_addr
        .parse()
        .expect("METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    describe_metrics();

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize services
    tracing::info!("Initializing services");
    let store: Arc<dyn JobStore> =
        Arc::new(PgJobStore::new(db_pool.clone(), worker_config.store_timeout()));

    let objects = Arc::new(
        R2Client::new(
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
            &config.r2_public_base_url,
        )
        .expect("Failed to initialize R2 client"),
    );

    let detector = Arc::new(
        WorkersAiDetector::new(
            &config.cf_account_id,
            &config.cf_api_token,
            &config.detection_model,
            config.detection_label.clone(),
            tokio::runtime::Handle::current(),
        )
        .expect("Failed to initialize Workers AI detector"),
    );

    let video = FfmpegFrameDecoder::new(&worker_config.ffmpeg_path, &worker_config.ffprobe_path);
    if !video.available() {
        tracing::warn!(
            ffmpeg = %worker_config.ffmpeg_path,
            ffprobe = %worker_config.ffprobe_path,
            "ffmpeg not runnable, video jobs will end in error"
        );
    }

    let staging_dir = worker_config.staging_dir();
    tokio::fs::create_dir_all(&staging_dir)
        .await
        .expect("Failed to create staging directory");

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store),
        objects,
        detector,
        Arc::new(ImageFrameDecoder::with_video(video)),
        PipelineSettings {
            staging_dir,
            source_bucket: config.source_bucket.clone(),
            results_bucket: config.results_bucket.clone(),
            storage_timeout: worker_config.storage_timeout(),
        },
    ));

    let concurrency = worker_config.concurrency();
    let dispatcher = Arc::new(Dispatcher::new(
        ClaimCoordinator::new(Arc::clone(&store)),
        pipeline,
        concurrency,
    ));

    let listener = FeedListener::new(
        Arc::new(PgChangeFeed::new(
            db_pool.clone(),
            JOB_CHANGES_CHANNEL,
            worker_config.store_timeout(),
        )),
        Arc::clone(&dispatcher),
        FeedFilter::new(worker_config.feed_events),
        ReconnectConfig {
            initial_delay: Duration::from_millis(worker_config.feed_reconnect_initial_ms),
            max_delay: Duration::from_millis(worker_config.feed_reconnect_max_ms),
            ..Default::default()
        },
    );

    let poller = Poller::new(
        store,
        Arc::clone(&dispatcher),
        worker_config.poll_interval(),
        worker_config.poll_batch_size,
    );

    tracing::info!(
        concurrency,
        feed_channel = JOB_CHANGES_CHANNEL,
        feed_events = ?worker_config.feed_events,
        "Worker ready, starting feed listener and poller"
    );

    let cancel = CancellationToken::new();
    let listener_task = tokio::spawn(listener.run(cancel.clone()));
    let poller_task = tokio::spawn(poller.run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    if let Err(e) = listener_task.await {
        tracing::error!(error = %e, "Feed listener task failed");
    }
    if let Err(e) = poller_task.await {
        tracing::error!(error = %e, "Poller task failed");
    }

    dispatcher.shutdown().await;
    tracing::info!("Worker stopped");
}

fn describe_metrics() {
    metrics::describe_counter!("jobs_claimed_total", "Jobs this worker moved to processing");
    metrics::describe_counter!("claims_lost_total", "Claim attempts on jobs no longer pending");
    metrics::describe_counter!("claim_errors_total", "Claim attempts that failed at the store");
    metrics::describe_counter!("jobs_finished_total", "Jobs that reached a terminal status");
    metrics::describe_gauge!("jobs_in_flight", "Jobs currently being processed");
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time from claim to terminal status write"
    );
    metrics::describe_counter!("feed_events_total", "Change-feed notifications received");
    metrics::describe_counter!("feed_resubscribes_total", "Change-feed resubscribe attempts");
    metrics::describe_counter!("poll_failures_total", "Pending-job scans that failed");
    metrics::describe_counter!("task_panics_total", "Job tasks that panicked");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping discovery loops");
}
