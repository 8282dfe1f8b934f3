//! Change-feed listener for the job table.
//!
//! The table trigger publishes every insert and update on a NOTIFY channel.
//! [`FeedListener`] keeps a subscription open and hands every key that
//! turns up in `pending` to the dispatcher. A dropped, failed or timed-out
//! subscription is retried forever with exponential backoff.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::FeedEvents;
use crate::models::job::JobStatus;
use crate::services::dispatcher::Dispatcher;

/// Channel the job table trigger publishes on.
pub const JOB_CHANGES_CHANNEL: &str = "job_changes";

/// Lifecycle of one feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Subscribing,
    Active,
    Closed,
    ChannelError,
    TimedOut,
}

impl ConnectionState {
    /// States that end a subscription and lead to a resubscribe.
    pub fn is_dropped(self) -> bool {
        matches!(
            self,
            ConnectionState::Closed | ConnectionState::ChannelError | ConnectionState::TimedOut
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRecord {
    pub source_file: Option<String>,
    pub status: Option<String>,
}

/// One row mutation as published by the table trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEvent {
    pub op: FeedOp,
    pub record: FeedRecord,
}

impl FeedEvent {
    pub fn from_payload(payload: &str) -> Result<Self, FeedError> {
        serde_json::from_str(payload).map_err(FeedError::Payload)
    }
}

/// Decides which feed events are candidate jobs.
#[derive(Debug, Clone, Copy)]
pub struct FeedFilter {
    events: FeedEvents,
}

impl FeedFilter {
    pub fn new(events: FeedEvents) -> Self {
        Self { events }
    }

    /// The job key if `event` describes a pending row of a subscribed operation.
    pub fn accept<'a>(&self, event: &'a FeedEvent) -> Option<&'a str> {
        let op_wanted = match (self.events, event.op) {
            (_, FeedOp::Delete) => false,
            (FeedEvents::All, _) => true,
            (FeedEvents::Insert, op) => op == FeedOp::Insert,
            (FeedEvents::Update, op) => op == FeedOp::Update,
        };
        if !op_wanted {
            return None;
        }

        let pending = event.record.status.as_deref() == Some(JobStatus::Pending.as_ref());
        event
            .record
            .source_file
            .as_deref()
            .filter(|key| pending && !key.is_empty())
    }
}

/// Source of feed subscriptions.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn FeedSubscription>, FeedError>;
}

/// A live subscription.
#[async_trait]
pub trait FeedSubscription: Send {
    /// Next event; `Ok(None)` once the connection has closed.
    async fn next_event(&mut self) -> Result<Option<FeedEvent>, FeedError>;
}

/// Postgres LISTEN/NOTIFY feed on the job table trigger's channel.
pub struct PgChangeFeed {
    pool: PgPool,
    channel: String,
    connect_timeout: Duration,
}

impl PgChangeFeed {
    pub fn new(pool: PgPool, channel: &str, connect_timeout: Duration) -> Self {
        Self {
            pool,
            channel: channel.to_string(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self) -> Result<Box<dyn FeedSubscription>, FeedError> {
        let connect = async {
            let mut listener = PgListener::connect_with(&self.pool).await?;
            listener.listen(&self.channel).await?;
            Ok::<_, sqlx::Error>(listener)
        };

        let listener = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| FeedError::Timeout(self.connect_timeout))?
            .map_err(FeedError::Channel)?;

        Ok(Box::new(PgSubscription { listener }))
    }
}

struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl FeedSubscription for PgSubscription {
    async fn next_event(&mut self) -> Result<Option<FeedEvent>, FeedError> {
        match self.listener.try_recv().await.map_err(FeedError::Channel)? {
            Some(notification) => FeedEvent::from_payload(notification.payload()).map(Some),
            None => Ok(None),
        }
    }
}

/// Tunable parameters for the resubscribe backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first resubscribe attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay, clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

pub struct FeedListener {
    feed: Arc<dyn ChangeFeed>,
    dispatcher: Arc<Dispatcher>,
    filter: FeedFilter,
    reconnect: ReconnectConfig,
    state: watch::Sender<ConnectionState>,
}

impl FeedListener {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        dispatcher: Arc<Dispatcher>,
        filter: FeedFilter,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Subscribing);
        Self {
            feed,
            dispatcher,
            filter,
            reconnect,
            state,
        }
    }

    /// Observe connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Keep the feed subscribed until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut delay = self.reconnect.initial_delay;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            self.transition(ConnectionState::Subscribing, attempt);

            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.feed.subscribe() => result,
            };

            let dropped = match subscribed {
                Ok(subscription) => {
                    self.transition(ConnectionState::Active, attempt);
                    delay = self.reconnect.initial_delay;
                    match self.consume(subscription, &cancel).await {
                        Some(state) => state,
                        None => break,
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Feed subscription failed");
                    e.connection_state()
                }
            };

            self.transition(dropped, attempt);
            metrics::counter!("feed_resubscribes_total").increment(1);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Resubscribing to job feed"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, &self.reconnect);
        }

        tracing::info!("Feed listener stopped");
    }

    /// Drain one subscription. Returns the state it ended in, or `None` on cancellation.
    async fn consume(
        &self,
        mut subscription: Box<dyn FeedSubscription>,
        cancel: &CancellationToken,
    ) -> Option<ConnectionState> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return None,
                next = subscription.next_event() => next,
            };

            match next {
                Ok(Some(event)) => {
                    metrics::counter!("feed_events_total").increment(1);
                    if let Some(source_file) = self.filter.accept(&event) {
                        tracing::info!(source_file, op = ?event.op, "Pending job announced by feed");
                        self.dispatcher.submit(source_file).await;
                    }
                }
                Ok(None) => return Some(ConnectionState::Closed),
                Err(FeedError::Payload(e)) => {
                    tracing::warn!(error = %e, "Skipping malformed feed payload");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Feed subscription errored");
                    return Some(e.connection_state());
                }
            }
        }
    }

    fn transition(&self, next: ConnectionState, attempt: u64) {
        let previous = self.state.send_replace(next);
        if next.is_dropped() {
            tracing::warn!(from = %previous, to = %next, attempt, "Feed connection state changed");
        } else {
            tracing::info!(from = %previous, to = %next, attempt, "Feed connection state changed");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed channel error: {0}")]
    Channel(#[from] sqlx::Error),

    #[error("Feed subscription timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed feed payload: {0}")]
    Payload(#[source] serde_json::Error),
}

impl FeedError {
    /// The state a subscription ends in when it fails with this error.
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            FeedError::Timeout(_) => ConnectionState::TimedOut,
            FeedError::Channel(_) | FeedError::Payload(_) => ConnectionState::ChannelError,
        }
    }
}
