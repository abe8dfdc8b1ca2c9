//! Outbox storage: partitioned pending-event tables
//!
//! Events live in `events_outbox_<N>` tables, one per configured partition.
//! The table is the single source of truth for what still has to reach the
//! bus: rows are inserted inside the caller's transaction, claimed by the
//! drainer with `FOR UPDATE SKIP LOCKED`, and flipped to `delivered` once
//! the bus accepted them.

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::OutboxError;
use crate::models::{EventStatus, OutboxEvent, TopicConfig};

#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
    topics: Vec<TopicConfig>,
}

impl OutboxStore {
    pub fn new(pool: PgPool, topics: Vec<TopicConfig>) -> Self {
        Self { pool, topics }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Partition config for a topic.
    pub fn topic_config(&self, topic: &str) -> Result<&TopicConfig, OutboxError> {
        self.topics
            .iter()
            .find(|t| t.topic == topic)
            .ok_or_else(|| OutboxError::UnknownTopic(topic.to_string()))
    }

    /// Distinct partition indexes, one drain worker each.
    pub fn table_indexes(&self) -> Vec<u32> {
        let mut indexes: Vec<u32> = self.topics.iter().map(|t| t.table_index).collect();
        indexes.sort_unstable();
        indexes.dedup();
        indexes
    }

    fn table_name(table_index: u32) -> String {
        format!("events_outbox_{table_index}")
    }

    /// Create the partition tables and the consumer-side dedup table if they
    /// do not exist. Idempotent; called once at process start.
    pub async fn ensure_schema(&self) -> Result<(), OutboxError> {
        for index in self.table_indexes() {
            let table = Self::table_name(index);
            let ddl = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id BIGSERIAL PRIMARY KEY,
                    topic TEXT NOT NULL,
                    ordering_key TEXT NOT NULL DEFAULT '',
                    payload JSONB NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    delivered_at TIMESTAMPTZ
                )
                "#
            );
            sqlx::query(&ddl).execute(&self.pool).await?;

            let idx = format!(
                r#"
                CREATE INDEX IF NOT EXISTS {table}_pending_idx
                ON {table} (ordering_key, id)
                WHERE status = 'pending'
                "#
            );
            sqlx::query(&idx).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                event_id UUID PRIMARY KEY,
                subject TEXT NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::debug!("outbox schema ensured");

        Ok(())
    }

    /// Insert a pending event as part of the caller's transaction.
    ///
    /// The row only becomes visible to the drainer once that transaction
    /// commits. Returns the assigned event id.
    pub async fn insert_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic: &str,
        ordering_key: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<i64, OutboxError> {
        let config = self.topic_config(topic)?;
        let table = Self::table_name(config.table_index);

        if config.delete_existing_on_add {
            let delete = format!("DELETE FROM {table} WHERE topic = $1 AND status = 'pending'");
            sqlx::query(&delete).bind(topic).execute(&mut **tx).await?;
        }

        let insert = format!(
            r#"
            INSERT INTO {table} (topic, ordering_key, payload)
            VALUES ($1, $2, $3)
            RETURNING id
            "#
        );
        let (id,): (i64,) = sqlx::query_as(&insert)
            .bind(topic)
            .bind(ordering_key.unwrap_or(""))
            .bind(payload)
            .fetch_one(&mut **tx)
            .await?;

        tracing::debug!(event_id = id, topic = %topic, "event enqueued to outbox");

        Ok(id)
    }

    /// Claim up to `batch_size` pending rows of one partition for delivery.
    ///
    /// Rows are locked with `FOR UPDATE SKIP LOCKED` inside the given
    /// transaction, so a concurrent drain worker cannot claim the same
    /// record. Ordered by `(ordering_key, id)` ascending: oldest first
    /// within a key.
    pub async fn claim_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table_index: u32,
        batch_size: i64,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let table = Self::table_name(table_index);
        let select = format!(
            r#"
            SELECT id, topic, ordering_key, payload, status, attempts, created_at, delivered_at
            FROM {table}
            WHERE status = 'pending'
            ORDER BY ordering_key ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let events = sqlx::query_as::<_, OutboxEvent>(&select)
            .bind(batch_size)
            .fetch_all(&mut **tx)
            .await?;

        Ok(events)
    }

    /// Transition a record to `delivered`.
    pub async fn mark_delivered<'e, E>(
        &self,
        executor: E,
        table_index: u32,
        event_id: i64,
    ) -> Result<(), OutboxError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let table = Self::table_name(table_index);
        let update = format!(
            r#"
            UPDATE {table}
            SET status = 'delivered', delivered_at = NOW()
            WHERE id = $1
            "#
        );
        sqlx::query(&update).bind(event_id).execute(executor).await?;

        tracing::debug!(event_id = event_id, "event marked delivered");

        Ok(())
    }

    /// Record a failed publish attempt.
    ///
    /// Bumps the attempt counter; once `max_attempts` is reached the record
    /// flips to `failed` and leaves the drain rotation.
    pub async fn record_failure<'e, E>(
        &self,
        executor: E,
        table_index: u32,
        event_id: i64,
        max_attempts: i32,
    ) -> Result<(), OutboxError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let table = Self::table_name(table_index);
        let update = format!(
            r#"
            UPDATE {table}
            SET attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= $2 THEN 'failed' ELSE 'pending' END
            WHERE id = $1
            "#
        );
        sqlx::query(&update)
            .bind(event_id)
            .bind(max_attempts)
            .execute(executor)
            .await?;

        Ok(())
    }

    /// Count records of a partition in a given status. Test and ops helper.
    pub async fn count_by_status(
        &self,
        table_index: u32,
        status: EventStatus,
    ) -> Result<i64, OutboxError> {
        let table = Self::table_name(table_index);
        let select = format!("SELECT COUNT(*) FROM {table} WHERE status = $1");
        let (count,): (i64,) = sqlx::query_as(&select)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
