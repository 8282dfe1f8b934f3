use hazard_scan::{
    db::{
        self, queries,
        store::{JobStore, PgJobStore, StoreError},
    },
    models::{
        detection::{Detection, HazardRecord},
        job::{JobOutcome, JobStatus},
    },
    services::feed::{ChangeFeed, FeedOp, PgChangeFeed, JOB_CHANGES_CHANNEL},
};
use std::time::Duration;

/// Integration test: job table round trip
///
/// Verifies against a real database:
/// 1. Migrations and schema
/// 2. Job creation and lookup
/// 3. Atomic claim (second claim loses)
/// 4. Guarded terminal write and numeric round trip
/// 5. Change-feed notification from the table trigger
///
/// Note: This requires a running PostgreSQL instance reachable via DATABASE_URL.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_job_table_round_trip() {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let db_pool = db::init_pool(&database_url, 5)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let store = PgJobStore::new(db_pool.clone(), Duration::from_secs(10));
    let feed = PgChangeFeed::new(db_pool.clone(), JOB_CHANGES_CHANNEL, Duration::from_secs(10));
    let mut subscription = feed.subscribe().await.expect("Failed to subscribe to feed");

    let source_file = format!(
        "integration/{}.gif",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );

    // Create
    let job = queries::create_job(&db_pool, &source_file)
        .await
        .expect("Failed to create job");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.confidence.is_none());
    println!("✓ Job created: {}", job.source_file);

    // The insert is announced on the feed
    let event = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = subscription
                .next_event()
                .await
                .expect("Feed errored")
                .expect("Feed closed");
            if event.record.source_file.as_deref() == Some(source_file.as_str()) {
                break event;
            }
        }
    })
    .await
    .expect("No notification for inserted job");
    assert_eq!(event.op, FeedOp::Insert);
    assert_eq!(event.record.status.as_deref(), Some("pending"));
    println!("✓ Insert notification received");

    // Pending scan sees it
    let pending = store.pending_jobs(1000).await.expect("Pending scan failed");
    assert!(pending.iter().any(|j| j.source_file == source_file));

    // Claim exactly once
    let (first, second) = tokio::join!(store.claim(&source_file), store.claim(&source_file));
    let winners = [first.unwrap(), second.unwrap()].iter().filter(|c| **c).count();
    assert_eq!(winners, 1);
    println!("✓ Claim is exclusive");

    // Terminal write with rounded detection fields
    let hazard = HazardRecord::from(&Detection::from_xyxy(0.87654, [10.123, 20.0, 50.456, 80.0]));
    let outcome = JobOutcome::Completed {
        hazard: hazard.clone(),
        image_url: "https://cdn.test/processed_images/detections/x.jpg".to_string(),
    };
    assert!(store
        .write_terminal_status(&source_file, &outcome)
        .await
        .expect("Terminal write failed"));
    assert!(!store
        .write_terminal_status(&source_file, &JobOutcome::Error)
        .await
        .expect("Second terminal write failed"));

    let stored = store
        .get_job(&source_file)
        .await
        .expect("Lookup failed")
        .expect("Job missing");
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.confidence, Some(0.8765));
    assert_eq!(stored.location_xyxy, Some(hazard.location_xyxy.to_vec()));
    assert_eq!(stored.width, Some(hazard.width));
    assert_eq!(stored.center, Some(hazard.center.to_vec()));
    println!("✓ Terminal status written once: {}", stored.status);

    sqlx::query("DELETE FROM pothole_image_data WHERE source_file = $1")
        .bind(&source_file)
        .execute(&db_pool)
        .await
        .expect("Cleanup failed");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_duplicate_job_is_rejected() {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let db_pool = db::init_pool(&database_url, 5)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let source_file = format!(
        "integration/dup-{}.mp4",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    queries::create_job(&db_pool, &source_file)
        .await
        .expect("Failed to create job");

    let err = queries::create_job(&db_pool, &source_file)
        .await
        .expect_err("Duplicate insert should fail");
    match err {
        sqlx::Error::Database(db) => assert!(db.is_unique_violation()),
        other => panic!("Unexpected error: {other}"),
    }

    let store = PgJobStore::new(db_pool.clone(), Duration::from_secs(10));
    let err = store
        .create_job(&source_file)
        .await
        .expect_err("Duplicate insert should fail");
    assert!(matches!(err, StoreError::Duplicate));
    assert!(store.get_job(&source_file).await.expect("Lookup failed").is_some());

    sqlx::query("DELETE FROM pothole_image_data WHERE source_file = $1")
        .bind(&source_file)
        .execute(&db_pool)
        .await
        .expect("Cleanup failed");
}
