//! # EventBus Abstraction
//!
//! Thin adapter over the external message bus consumed by the outbox relay.
//!
//! The bus contract is deliberately narrow:
//!
//! - **publish with ordering key**: messages sharing a non-empty ordering key
//!   are serialized by the bus; messages without a key may be delivered in
//!   parallel.
//! - **subscribe with ack deadline**: delivery is at-least-once. A message
//!   that is not acknowledged within the ack deadline (or that is explicitly
//!   nacked) is redelivered, so handlers must tolerate duplicates.
//!
//! ## Implementations
//!
//! - **NatsBus**: production implementation using NATS JetStream
//! - **InMemoryBus**: test/dev implementation using in-memory channels,
//!   including nack/deadline redelivery so at-least-once consumers can be
//!   exercised without a broker
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, InMemoryBus};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! // Publish two ordered messages
//! bus.publish("orders.events", Some("order-42"), b"created".to_vec()).await?;
//! bus.publish("orders.events", Some("order-42"), b"paid".to_vec()).await?;
//!
//! // Consume with a 30s ack deadline
//! let mut stream = bus
//!     .subscribe("orders.events", "orders-worker", Duration::from_secs(30))
//!     .await?;
//! while let Some(delivery) = futures::StreamExt::next(&mut stream).await {
//!     println!("got {} bytes on {}", delivery.payload.len(), delivery.subject);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod envelope;
mod inmemory_bus;
mod nats_bus;
pub mod retry;

pub use envelope::{parse_envelope, validate_envelope_fields, EventEnvelope};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::{NatsBus, ORDERING_KEY_HEADER};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("acknowledge error: {0}")]
    AckError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Acknowledgement seam between a [`Delivery`] and the underlying bus.
///
/// Implementations are single-shot: both methods consume the handle.
#[async_trait]
pub trait AckHandle: Send {
    /// Acknowledge the message. The bus will not redeliver it.
    async fn ack(self: Box<Self>) -> BusResult<()>;

    /// Negatively acknowledge the message, requesting redelivery.
    async fn nack(self: Box<Self>) -> BusResult<()>;
}

/// A message delivered to a subscriber, carrying its acknowledgement handle.
///
/// Dropping a delivery without acking it leaves the message subject to the
/// bus's redelivery policy once the ack deadline passes.
pub struct Delivery {
    /// The subject/topic this message was published to
    pub subject: String,
    /// Ordering key the producer attached, if any
    pub ordering_key: Option<String>,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    ack: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(
        subject: String,
        ordering_key: Option<String>,
        payload: Vec<u8>,
        ack: Box<dyn AckHandle>,
    ) -> Self {
        Self {
            subject,
            ordering_key,
            payload,
            ack,
        }
    }

    /// Acknowledge successful processing. The message is never redelivered.
    pub async fn ack(self) -> BusResult<()> {
        self.ack.ack().await
    }

    /// Request redelivery. The bus's own retry policy governs when the
    /// message is seen again.
    pub async fn nack(self) -> BusResult<()> {
        self.ack.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("ordering_key", &self.ordering_key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Core event bus abstraction consumed by the outbox relay.
///
/// The relay never talks to a broker directly; the drainer, the immediate
/// post-commit publish path, and the consumer router all go through this
/// trait so the broker can be swapped for [`InMemoryBus`] in tests.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a subject.
    ///
    /// When `ordering_key` is `Some`, the bus serializes delivery of messages
    /// sharing that key; publish order is preserved per key. `None` means no
    /// ordering constraint.
    async fn publish(
        &self,
        subject: &str,
        ordering_key: Option<&str>,
        payload: Vec<u8>,
    ) -> BusResult<()>;

    /// Subscribe to a subject as a named subscription.
    ///
    /// Subscribers sharing a `subscription` name form a competing-consumer
    /// group on buses that support it. A delivery that is not acked within
    /// `ack_deadline` is redelivered (at-least-once semantics).
    async fn subscribe(
        &self,
        subject: &str,
        subscription: &str,
        ack_deadline: Duration,
    ) -> BusResult<BoxStream<'static, Delivery>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
