use chrono::{DateTime, Utc};

/// Lifecycle state of an outbox record.
///
/// `pending` rows are eligible for draining; `delivered` rows are done;
/// `failed` rows exceeded the attempt budget and need operator attention,
/// so the drainer skips them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Delivered,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Delivered => "delivered",
            EventStatus::Failed => "failed",
        }
    }
}

/// Outbox record as stored in an `events_outbox_<N>` partition table.
///
/// `id` is assigned by the database sequence at insert time, so within one
/// partition it reflects insertion order; the drainer relies on this for
/// per-key ordering.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: i64,
    pub topic: String,
    /// Empty string means no ordering constraint.
    pub ordering_key: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Ordering key as the bus expects it: `None` when unordered.
    pub fn ordering_key(&self) -> Option<&str> {
        if self.ordering_key.is_empty() {
            None
        } else {
            Some(&self.ordering_key)
        }
    }
}

/// Maps a topic to the outbox partition table its events are written to.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub topic: String,
    /// Suffix of the `events_outbox_<N>` table this topic writes to.
    pub table_index: u32,
    /// When set, adding an event first deletes pending rows for the same
    /// topic (the newest event supersedes unsent ones).
    pub delete_existing_on_add: bool,
}
