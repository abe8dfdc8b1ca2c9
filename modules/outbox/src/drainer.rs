//! Background drain loop
//!
//! One worker per outbox partition, each sweeping on a fixed interval:
//! claim a batch of pending rows, publish them oldest-first, mark successes
//! delivered, leave failures pending for the next tick. Single-writer per
//! partition plus `(ordering_key, id)` batch order is what preserves per-key
//! publish order; `FOR UPDATE SKIP LOCKED` keeps an overlapping worker from
//! double-publishing a claimed record.
//!
//! A publish failure blocks every later event in the batch that shares the
//! failed (non-empty) ordering key, since publishing those would break
//! insertion order.

use event_bus::EventBus;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::OutboxError;
use crate::store::OutboxStore;

#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Maximum records claimed per tick and partition.
    pub batch_size: i64,
    /// Sleep between sweeps.
    pub interval: Duration,
    /// Publish attempts before a record is marked `failed`.
    pub max_attempts: i32,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

pub struct Drainer {
    store: OutboxStore,
    bus: Arc<dyn EventBus>,
    config: DrainConfig,
}

impl Drainer {
    pub fn new(store: OutboxStore, bus: Arc<dyn EventBus>, config: DrainConfig) -> Self {
        Self { store, bus, config }
    }

    /// Run drain workers until the shutdown signal fires.
    ///
    /// Spawns one worker per partition; partitions drain concurrently,
    /// records within a partition sequentially. Shutdown is honoured
    /// between ticks; an in-flight batch completes first.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            partitions = self.store.table_indexes().len(),
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "starting outbox drainer"
        );

        let mut workers = Vec::new();
        for table_index in self.store.table_indexes() {
            let store = self.store.clone();
            let bus = self.bus.clone();
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(drain_partition(
                store,
                bus,
                config,
                table_index,
                shutdown,
            )));
        }

        for worker in workers {
            // Workers only end on shutdown; a join error means one panicked.
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "drain worker terminated abnormally");
            }
        }

        tracing::info!("outbox drainer stopped");
    }

    /// Sweep one partition once. Exposed so callers (and tests) can drain
    /// on demand without the interval loop.
    pub async fn drain_once(&self, table_index: u32) -> Result<usize, OutboxError> {
        drain_tick(&self.store, &self.bus, &self.config, table_index).await
    }
}

async fn drain_partition(
    store: OutboxStore,
    bus: Arc<dyn EventBus>,
    config: DrainConfig,
    table_index: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match drain_tick(&store, &bus, &config, table_index).await {
                    Ok(published) if published > 0 => {
                        tracing::debug!(
                            table_index = table_index,
                            published = published,
                            "drain tick published events"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Tick-level failures (connection loss, claim errors)
                        // are retried on the next tick, never fatal.
                        tracing::error!(
                            table_index = table_index,
                            error = %e,
                            "drain tick failed"
                        );
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::info!(table_index = table_index, "drain worker stopping");
                break;
            }
        }
    }
}

async fn drain_tick(
    store: &OutboxStore,
    bus: &Arc<dyn EventBus>,
    config: &DrainConfig,
    table_index: u32,
) -> Result<usize, OutboxError> {
    let mut tx = store.pool().begin().await?;
    let events = store
        .claim_pending(&mut tx, table_index, config.batch_size)
        .await?;

    if events.is_empty() {
        tx.commit().await?;
        return Ok(0);
    }

    // Keys whose earliest event failed this tick; later events for the same
    // key must wait so insertion order is preserved.
    let mut blocked_keys: HashSet<String> = HashSet::new();
    let mut published = 0;

    for event in events {
        if let Some(key) = event.ordering_key() {
            if blocked_keys.contains(key) {
                tracing::debug!(
                    event_id = event.id,
                    ordering_key = %key,
                    "skipping event behind a failed one for the same key"
                );
                continue;
            }
        }

        let payload = serde_json::to_vec(&event.payload)?;
        match bus
            .publish(&event.topic, event.ordering_key(), payload)
            .await
        {
            Ok(()) => {
                store
                    .mark_delivered(&mut *tx, table_index, event.id)
                    .await?;
                published += 1;
                tracing::trace!(
                    event_id = event.id,
                    topic = %event.topic,
                    "drained event published"
                );
            }
            Err(e) => {
                tracing::warn!(
                    event_id = event.id,
                    topic = %event.topic,
                    attempts = event.attempts + 1,
                    error = %e,
                    "publish failed, will retry on a later tick"
                );
                store
                    .record_failure(&mut *tx, table_index, event.id, config.max_attempts)
                    .await?;
                if let Some(key) = event.ordering_key() {
                    blocked_keys.insert(key.to_string());
                }
            }
        }
    }

    tx.commit().await?;

    Ok(published)
}
