#![allow(dead_code)]

use async_trait::async_trait;
use event_bus::{BusError, BusResult, Delivery, EventBus};
use futures::stream::BoxStream;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use outbox_relay::models::TopicConfig;
use outbox_relay::store::OutboxStore;

/// Connect to the test database. Postgres-backed tests are `#[ignore]`d and
/// expect `DATABASE_URL` to point at a scratch database.
pub async fn setup_pool() -> PgPool {
    dotenvy::dotenv().ok();

    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for Postgres-backed integration tests");

    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&url)
        .await
        .expect("failed to connect to test database")
}

/// Store over one topic and one partition, schema ensured.
pub async fn store_for(pool: &PgPool, topic: &str, table_index: u32) -> OutboxStore {
    let store = OutboxStore::new(
        pool.clone(),
        vec![TopicConfig {
            topic: topic.to_string(),
            table_index,
            delete_existing_on_add: false,
        }],
    );
    store.ensure_schema().await.expect("ensure_schema failed");
    store
}

/// Empty a partition table between tests.
pub async fn clear_partition(pool: &PgPool, table_index: u32) {
    sqlx::query(&format!("DELETE FROM events_outbox_{table_index}"))
        .execute(pool)
        .await
        .expect("failed to clear partition");
}

/// Bus whose publishes always fail; simulates an unreachable broker.
#[derive(Default)]
pub struct FailingBus {
    pub publish_attempts: AtomicUsize,
}

impl FailingBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for FailingBus {
    async fn publish(
        &self,
        _subject: &str,
        _ordering_key: Option<&str>,
        _payload: Vec<u8>,
    ) -> BusResult<()> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        Err(BusError::PublishError("bus unreachable".to_string()))
    }

    async fn subscribe(
        &self,
        _subject: &str,
        _subscription: &str,
        _ack_deadline: Duration,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        Err(BusError::SubscribeError("bus unreachable".to_string()))
    }
}

/// Bus that fails the first `n` publishes, then behaves like [`RecordingBus`].
pub struct FlakyBus {
    failures_remaining: AtomicUsize,
    pub inner: RecordingBus,
}

impl FlakyBus {
    pub fn failing_first(n: usize) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(n),
            inner: RecordingBus::new(),
        }
    }
}

#[async_trait]
impl EventBus for FlakyBus {
    async fn publish(
        &self,
        subject: &str,
        ordering_key: Option<&str>,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BusError::PublishError("transient failure".to_string()));
        }
        self.inner.publish(subject, ordering_key, payload).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        subscription: &str,
        ack_deadline: Duration,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        self.inner.subscribe(subject, subscription, ack_deadline).await
    }
}

/// Bus that records successful publishes for assertions.
#[derive(Default)]
pub struct RecordingBus {
    pub published: Mutex<Vec<PublishedMessage>>,
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub ordering_key: Option<String>,
    pub payload: Vec<u8>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(
        &self,
        subject: &str,
        ordering_key: Option<&str>,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        self.published.lock().unwrap().push(PublishedMessage {
            subject: subject.to_string(),
            ordering_key: ordering_key.map(|k| k.to_string()),
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        _subject: &str,
        _subscription: &str,
        _ack_deadline: Duration,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        Err(BusError::SubscribeError(
            "RecordingBus does not support subscriptions".to_string(),
        ))
    }
}
