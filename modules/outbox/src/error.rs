use event_bus::BusError;

/// Errors surfaced by the outbox core.
///
/// Per-event publish failures during steady-state draining are *not* errors
/// at this level: the drainer records the attempt and retries on a later
/// tick. This type covers structural failures that the caller must act on.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no outbox table configured for topic: {0}")]
    UnknownTopic(String),
}
