//! Consumer router: topic → handler dispatch with ack-on-success
//!
//! Each registered topic gets its own dispatch loop over a bus subscription.
//! A delivery is acked only after its handler returns `Ok`; on error it is
//! nacked and the bus's redelivery policy governs retry. The router adds no
//! backoff of its own. Because delivery is at-least-once (and the outbox
//! path can legitimately publish duplicates), handlers must be idempotent;
//! see [`crate::idempotency`] for the dedup helpers.

use event_bus::{Delivery, EventBus};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::OutboxError;

type Handler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct Router {
    bus: Arc<dyn EventBus>,
    subscription: String,
    ack_deadline: Duration,
    handlers: Vec<(String, Handler)>,
}

impl Router {
    pub fn new(bus: Arc<dyn EventBus>, subscription: impl Into<String>, ack_deadline: Duration) -> Self {
        Self {
            bus,
            subscription: subscription.into(),
            ack_deadline,
            handlers: Vec::new(),
        }
    }

    /// Register a handler for a topic.
    ///
    /// The handler receives the raw payload bytes. `Ok` acknowledges the
    /// message; `Err` leaves it to be redelivered.
    pub fn register_handler<F, Fut>(&mut self, topic: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .push((topic.into(), Arc::new(move |payload| handler(payload).boxed())));
    }

    /// Subscribe every registered topic and dispatch until shutdown.
    ///
    /// A subscription failure at startup is fatal: the process must not run
    /// half-configured. Handler failures during steady state are local to
    /// one message and never end the loop.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), OutboxError> {
        if self.handlers.is_empty() {
            return Err(OutboxError::Config(
                "router started with no handlers registered".to_string(),
            ));
        }

        let mut loops = Vec::new();
        for (topic, handler) in self.handlers {
            let stream = self
                .bus
                .subscribe(&topic, &self.subscription, self.ack_deadline)
                .await?;

            tracing::info!(
                topic = %topic,
                subscription = %self.subscription,
                "consumer subscribed"
            );

            loops.push(tokio::spawn(dispatch_loop(
                topic,
                stream,
                handler,
                shutdown.clone(),
            )));
        }

        for task in loops {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "dispatch loop terminated abnormally");
            }
        }

        Ok(())
    }
}

async fn dispatch_loop(
    topic: String,
    mut stream: BoxStream<'static, Delivery>,
    handler: Handler,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            next = stream.next() => match next {
                Some(delivery) => delivery,
                None => {
                    tracing::warn!(topic = %topic, "subscription stream ended");
                    break;
                }
            },
            _ = shutdown.changed() => {
                tracing::info!(topic = %topic, "dispatch loop stopping");
                break;
            }
        };

        match handler(delivery.payload.clone()).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(topic = %topic, error = %e, "ack failed");
                }
            }
            Err(e) => {
                tracing::warn!(
                    topic = %topic,
                    error = %format!("{e:#}"),
                    "handler failed; message will be redelivered"
                );
                if let Err(e) = delivery.nack().await {
                    tracing::warn!(topic = %topic, error = %e, "nack failed");
                }
            }
        }
    }
}
