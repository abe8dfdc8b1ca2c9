//! NATS JetStream implementation of the EventBus trait

use crate::{AckHandle, BusError, BusResult, Delivery, EventBus};
use async_nats::jetstream::{self, consumer::pull, stream, AckKind};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;

/// Header carrying the producer's ordering key on published messages.
pub const ORDERING_KEY_HEADER: &str = "Outbox-Ordering-Key";

/// EventBus implementation backed by NATS JetStream
///
/// Publishes go through the JetStream context so the broker acknowledges
/// persistence before `publish` returns. Subscriptions are durable pull
/// consumers: the subscription name becomes the durable name, and the ack
/// deadline maps to the consumer's `ack_wait`, so unacked messages are
/// redelivered by the server.
///
/// The ordering key travels in the [`ORDERING_KEY_HEADER`] header. Per-key
/// delivery serialization is the broker's concern; this adapter guarantees
/// the key survives the wire.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(client, "OUTBOX_EVENTS");
/// bus.ensure_stream(vec!["outbox.events".to_string()]).await?;
///
/// bus.publish("outbox.events", Some("k1"), b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    context: jetstream::Context,
    stream_name: String,
}

impl NatsBus {
    /// Create a new NatsBus from an already-connected client.
    ///
    /// `stream_name` names the JetStream stream that backs all subjects this
    /// bus publishes to or consumes from.
    pub fn new(client: Client, stream_name: impl Into<String>) -> Self {
        Self {
            context: jetstream::new(client),
            stream_name: stream_name.into(),
        }
    }

    /// Create the backing stream if it does not exist yet.
    ///
    /// Call once at startup, before publishing or subscribing, with every
    /// subject the process will use. Publishing to a subject no stream covers
    /// fails at the broker.
    pub async fn ensure_stream(&self, subjects: Vec<String>) -> BusResult<()> {
        self.context
            .get_or_create_stream(stream::Config {
                name: self.stream_name.clone(),
                subjects,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        Ok(())
    }

    /// JetStream durable names must not contain `.`, `*` or `>`.
    fn durable_name(subscription: &str) -> String {
        subscription.replace(['.', '*', '>'], "-")
    }
}

struct JetStreamAck {
    message: jetstream::Message,
}

#[async_trait]
impl AckHandle for JetStreamAck {
    async fn ack(self: Box<Self>) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nack(self: Box<Self>) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(
        &self,
        subject: &str,
        ordering_key: Option<&str>,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        let mut headers = async_nats::HeaderMap::new();
        if let Some(key) = ordering_key {
            headers.insert(ORDERING_KEY_HEADER, key);
        }

        let publish_ack = self
            .context
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        // Wait for the broker to confirm the message was persisted.
        publish_ack
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        subscription: &str,
        ack_deadline: Duration,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        let js_stream = self
            .context
            .get_or_create_stream(stream::Config {
                name: self.stream_name.clone(),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let durable = Self::durable_name(subscription);
        let consumer = js_stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: subject.to_string(),
                    ack_wait: ack_deadline,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = async_stream::stream! {
            while let Some(next) = messages.next().await {
                match next {
                    Ok(msg) => {
                        let subject = msg.message.subject.to_string();
                        let payload = msg.message.payload.to_vec();
                        let ordering_key = msg
                            .message
                            .headers
                            .as_ref()
                            .and_then(|h| h.get(ORDERING_KEY_HEADER))
                            .map(|v| v.as_str().to_string());

                        yield Delivery::new(
                            subject,
                            ordering_key,
                            payload,
                            Box::new(JetStreamAck { message: msg }),
                        );
                    }
                    Err(e) => {
                        // Transient pull errors; the consumer recovers on the
                        // next iteration.
                        tracing::warn!(error = %e, "jetstream consumer error");
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running NATS server with JetStream enabled.
    // For CI, use the InMemoryBus tests instead.
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine -js

    #[test]
    fn test_durable_name_sanitized() {
        assert_eq!(NatsBus::durable_name("outbox.debugger-sub"), "outbox-debugger-sub");
        assert_eq!(NatsBus::durable_name("plain"), "plain");
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_subscribe() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let bus = NatsBus::new(client, "EVENT_BUS_TEST");
        bus.ensure_stream(vec!["test.nats.events".to_string()])
            .await
            .unwrap();

        let mut stream = bus
            .subscribe("test.nats.events", "test-sub", Duration::from_secs(5))
            .await
            .unwrap();

        bus.publish("test.nats.events", Some("k1"), b"hello".to_vec())
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(delivery.subject, "test.nats.events");
        assert_eq!(delivery.ordering_key.as_deref(), Some("k1"));
        assert_eq!(delivery.payload, b"hello");
        delivery.ack().await.unwrap();
    }
}
