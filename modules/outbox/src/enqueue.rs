//! Transactional enqueue and the direct bypass
//!
//! Both paths produce the same [`EventEnvelope`] and the same single-shot
//! [`PublishTicket`]; they differ only in durability. The durable path
//! inserts a pending row inside the caller's transaction, so the drainer can
//! finish the job if the post-commit publish attempt never happens or fails.
//! The direct path publishes with no persisted fallback: a failure there is
//! lost, which is the trade-off callers opt into for non-critical traffic.

use event_bus::{EventBus, EventEnvelope};
use serde::Serialize;
use sqlx::{Postgres, Transaction};
use std::sync::Arc;

use crate::error::OutboxError;
use crate::store::OutboxStore;

/// Deferred publish action bound to one enqueued event.
///
/// `fire` consumes the ticket, so invoking it twice is a compile error
/// rather than a runtime double-publish. Fire it only after the enclosing
/// transaction has committed: before that the row may not be durable yet,
/// and a rollback would orphan the publish.
///
/// Firing is fire-and-forget by design: the caller's transaction has already
/// committed and cannot be unwound, so failures are logged, never returned.
/// On the durable path the pending row stays in place for the drainer; on
/// the direct path the event is simply gone.
///
/// Note the at-least-once wrinkle: if the publish succeeds but the
/// delivered-status write fails, the drainer will publish the event again.
/// Consumers deduplicate on `event_id`.
#[must_use = "a ticket that is never fired leaves delivery to the drainer"]
pub struct PublishTicket {
    action: TicketAction,
}

enum TicketAction {
    Durable {
        store: OutboxStore,
        bus: Arc<dyn EventBus>,
        table_index: u32,
        event_id: i64,
        subject: String,
        ordering_key: Option<String>,
        payload: Vec<u8>,
    },
    Direct {
        bus: Arc<dyn EventBus>,
        subject: String,
        ordering_key: Option<String>,
        payload: Vec<u8>,
    },
}

impl PublishTicket {
    /// Attempt the immediate publish. See the type docs for semantics.
    pub async fn fire(self) {
        match self.action {
            TicketAction::Durable {
                store,
                bus,
                table_index,
                event_id,
                subject,
                ordering_key,
                payload,
            } => {
                match bus
                    .publish(&subject, ordering_key.as_deref(), payload)
                    .await
                {
                    Ok(()) => {
                        if let Err(e) = store
                            .mark_delivered(store.pool(), table_index, event_id)
                            .await
                        {
                            tracing::warn!(
                                event_id = event_id,
                                error = %e,
                                "published but delivered-mark failed; drainer may republish"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            event_id = event_id,
                            subject = %subject,
                            error = %e,
                            "immediate publish failed; record stays pending for the drainer"
                        );
                    }
                }
            }
            TicketAction::Direct {
                bus,
                subject,
                ordering_key,
                payload,
            } => {
                if let Err(e) = bus
                    .publish(&subject, ordering_key.as_deref(), payload)
                    .await
                {
                    tracing::warn!(
                        subject = %subject,
                        error = %e,
                        "direct publish failed; event lost (bypass path has no durability)"
                    );
                }
            }
        }
    }
}

/// Durable enqueuer: outbox insert inside the caller's transaction.
#[derive(Clone)]
pub struct DurableEnqueuer {
    store: OutboxStore,
    bus: Arc<dyn EventBus>,
    source: String,
}

impl DurableEnqueuer {
    pub fn new(store: OutboxStore, bus: Arc<dyn EventBus>, source: impl Into<String>) -> Self {
        Self {
            store,
            bus,
            source: source.into(),
        }
    }

    /// Insert one pending event as part of `tx` and return its ticket.
    ///
    /// On insert failure the error is returned, no ticket exists, and the
    /// caller is expected to roll `tx` back.
    pub async fn enqueue<T: Serialize>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic: &str,
        ordering_key: Option<&str>,
        payload: &T,
    ) -> Result<PublishTicket, OutboxError> {
        let envelope = EventEnvelope::new(self.source.clone(), payload)
            .with_ordering_key(ordering_key.map(|k| k.to_string()));
        let value = serde_json::to_value(&envelope)?;

        let table_index = self.store.topic_config(topic)?.table_index;
        let event_id = self
            .store
            .insert_event(tx, topic, ordering_key, &value)
            .await?;

        Ok(PublishTicket {
            action: TicketAction::Durable {
                store: self.store.clone(),
                bus: self.bus.clone(),
                table_index,
                event_id,
                subject: topic.to_string(),
                ordering_key: ordering_key.map(|k| k.to_string()),
                payload: serde_json::to_vec(&value)?,
            },
        })
    }
}

/// Direct bypass: same envelope, no outbox row, no durability.
#[derive(Clone)]
pub struct DirectPublisher {
    bus: Arc<dyn EventBus>,
    source: String,
}

impl DirectPublisher {
    pub fn new(bus: Arc<dyn EventBus>, source: impl Into<String>) -> Self {
        Self {
            bus,
            source: source.into(),
        }
    }

    /// Build a ticket that publishes unconditionally when fired.
    pub fn ticket<T: Serialize>(
        &self,
        topic: &str,
        ordering_key: Option<&str>,
        payload: &T,
    ) -> Result<PublishTicket, OutboxError> {
        let envelope = EventEnvelope::new(self.source.clone(), payload)
            .with_ordering_key(ordering_key.map(|k| k.to_string()));

        Ok(PublishTicket {
            action: TicketAction::Direct {
                bus: self.bus.clone(),
                subject: topic.to_string(),
                ordering_key: ordering_key.map(|k| k.to_string()),
                payload: serde_json::to_vec(&envelope)?,
            },
        })
    }
}

/// The enqueue capability, selected by configuration.
///
/// Both variants satisfy the same contract (enqueue inside a transaction,
/// get a post-commit ticket), so call sites do not branch on durability.
#[derive(Clone)]
pub enum Enqueuer {
    Durable(DurableEnqueuer),
    Direct(DirectPublisher),
}

impl Enqueuer {
    /// Enqueue one event as part of `tx`.
    ///
    /// The direct variant ignores `tx`: it performs no database work and its
    /// ticket publishes regardless of whether the transaction commits.
    pub async fn enqueue<T: Serialize>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic: &str,
        ordering_key: Option<&str>,
        payload: &T,
    ) -> Result<PublishTicket, OutboxError> {
        match self {
            Enqueuer::Durable(durable) => durable.enqueue(tx, topic, ordering_key, payload).await,
            Enqueuer::Direct(direct) => direct.ticket(topic, ordering_key, payload),
        }
    }
}
