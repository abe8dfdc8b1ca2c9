//! Consumer-side deduplication
//!
//! Delivery is at-least-once end to end: the bus redelivers unacked
//! messages, and the outbox path itself can publish a record twice when the
//! delivered-status write fails after a successful publish. Handlers dedup
//! on the envelope's `event_id` via the `processed_events` table.

use sqlx::PgPool;
use uuid::Uuid;

/// Check if an event has already been processed.
pub async fn is_event_processed(pool: &PgPool, event_id: Uuid) -> Result<bool, sqlx::Error> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT event_id FROM processed_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(pool)
            .await?;

    Ok(row.is_some())
}

/// Mark an event as processed to prevent duplicate processing.
pub async fn mark_event_processed(
    pool: &PgPool,
    event_id: Uuid,
    subject: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO processed_events (event_id, subject)
        VALUES ($1, $2)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(event_id)
    .bind(subject)
    .execute(pool)
    .await?;

    tracing::debug!(event_id = %event_id, "event marked processed");

    Ok(())
}

/// Run `handler` at most once per event id.
///
/// Returns `Ok(false)` when the event was already processed (the handler is
/// skipped), `Ok(true)` when the handler ran and the event is now recorded.
pub async fn process_event_idempotent<F, Fut>(
    pool: &PgPool,
    event_id: Uuid,
    subject: &str,
    handler: F,
) -> anyhow::Result<bool>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    if is_event_processed(pool, event_id).await? {
        tracing::debug!(event_id = %event_id, "duplicate delivery, skipping");
        return Ok(false);
    }

    handler().await?;

    mark_event_processed(pool, event_id, subject).await?;

    Ok(true)
}
