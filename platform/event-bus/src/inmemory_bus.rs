//! In-memory implementation of the EventBus trait for testing and development

use crate::{AckHandle, BusResult, Delivery, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

const OUTCOME_PENDING: u8 = 0;
const OUTCOME_ACKED: u8 = 1;
const OUTCOME_NACKED: u8 = 2;

/// Message as carried on the internal broadcast channel.
#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    ordering_key: Option<String>,
    payload: Vec<u8>,
}

/// EventBus implementation using in-memory channels
///
/// Suitable for unit tests, local development without a broker, and
/// integration tests that need fast, isolated message buses.
///
/// Messages are broadcast to all subscriptions. Each subscription tracks its
/// own acknowledgements: a delivery that is nacked, or not acked within the
/// ack deadline, is redelivered on that subscription. Redelivery repeats
/// until the message is acked, which is enough to exercise at-least-once
/// consumers.
///
/// Publish order is preserved per subscription, so ordering-key tests can
/// assert insertion order directly.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus};
/// use futures::StreamExt;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// // Subscribe before publishing
/// let mut stream = bus
///     .subscribe("test.events", "test-sub", Duration::from_secs(5))
///     .await?;
///
/// bus.publish("test.events", None, b"hello".to_vec()).await?;
///
/// let delivery = stream.next().await.unwrap();
/// assert_eq!(delivery.subject, "test.events");
/// assert_eq!(delivery.payload, b"hello");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    // Single broadcast channel for all messages; subscriptions filter by
    // subject pattern. A large buffer avoids dropping messages in tests.
    sender: Arc<broadcast::Sender<StoredMessage>>,
}

impl InMemoryBus {
    /// Create a new in-memory event bus with a buffer of 1000 messages.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory event bus with a custom buffer size.
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Check if a subject matches a subscription pattern.
    ///
    /// Supports NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more trailing tokens
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared ack state between a delivery and its redelivery watchdog.
struct AckState {
    outcome: AtomicU8,
    resolved: Notify,
}

struct InMemoryAck {
    state: Arc<AckState>,
}

#[async_trait]
impl AckHandle for InMemoryAck {
    async fn ack(self: Box<Self>) -> BusResult<()> {
        self.state.outcome.store(OUTCOME_ACKED, Ordering::SeqCst);
        self.state.resolved.notify_one();
        Ok(())
    }

    async fn nack(self: Box<Self>) -> BusResult<()> {
        self.state.outcome.store(OUTCOME_NACKED, Ordering::SeqCst);
        self.state.resolved.notify_one();
        Ok(())
    }
}

/// Wrap a message into a delivery and arm its redelivery watchdog.
///
/// The watchdog requeues the message when the delivery is nacked or when the
/// ack deadline expires with no resolution.
fn make_delivery(
    msg: StoredMessage,
    ack_deadline: Duration,
    redeliver_tx: mpsc::UnboundedSender<StoredMessage>,
) -> Delivery {
    let state = Arc::new(AckState {
        outcome: AtomicU8::new(OUTCOME_PENDING),
        resolved: Notify::new(),
    });

    let watchdog_state = state.clone();
    let watchdog_msg = msg.clone();
    tokio::spawn(async move {
        let redeliver = tokio::select! {
            _ = watchdog_state.resolved.notified() => {
                watchdog_state.outcome.load(Ordering::SeqCst) == OUTCOME_NACKED
            }
            _ = tokio::time::sleep(ack_deadline) => {
                watchdog_state.outcome.load(Ordering::SeqCst) == OUTCOME_PENDING
            }
        };
        if redeliver {
            // Receiver gone means the subscription ended; nothing to do.
            let _ = redeliver_tx.send(watchdog_msg);
        }
    });

    Delivery::new(
        msg.subject,
        msg.ordering_key,
        msg.payload,
        Box::new(InMemoryAck { state }),
    )
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(
        &self,
        subject: &str,
        ordering_key: Option<&str>,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        let msg = StoredMessage {
            subject: subject.to_string(),
            ordering_key: ordering_key.map(|k| k.to_string()),
            payload,
        };

        // No receivers is fine: the message is simply unobserved.
        let _ = self.sender.send(msg);

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        subscription: &str,
        ack_deadline: Duration,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        let mut receiver = self.sender.subscribe();
        let pattern = subject.to_string();
        let subscription = subscription.to_string();
        let (redeliver_tx, mut redeliver_rx) = mpsc::unbounded_channel::<StoredMessage>();

        let stream = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    // Redeliveries take priority over fresh messages.
                    biased;
                    redelivered = redeliver_rx.recv() => redelivered,
                    received = receiver.recv() => match received {
                        Ok(msg) => {
                            if !Self::matches_pattern(&msg.subject, &pattern) {
                                continue;
                            }
                            Some(msg)
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                subscription = %subscription,
                                skipped = skipped,
                                "in-memory subscriber lagged, messages dropped"
                            );
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => None,
                    },
                };

                let Some(msg) = next else { break };
                yield make_delivery(msg, ack_deadline, redeliver_tx.clone());
            }
        };

        Ok(stream.boxed())
    }
}
