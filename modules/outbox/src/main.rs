use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use event_bus::{parse_envelope, EventBus, InMemoryBus, NatsBus};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use outbox_relay::config::{BusType, Config};
use outbox_relay::db::connect_pool;
use outbox_relay::drainer::Drainer;
use outbox_relay::enqueue::{DirectPublisher, DurableEnqueuer, Enqueuer};
use outbox_relay::idempotency::process_event_idempotent;
use outbox_relay::router::Router;
use outbox_relay::store::OutboxStore;

/// Envelope `source` for events this process emits.
const SOURCE: &str = "outbox-relay";

#[derive(Parser)]
#[command(name = "outbox-relay")]
#[command(about = "Transactional outbox relay: drain, publish, and listen")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background drain loop until interrupted
    Drain,
    /// Emit synthetic events through the outbox (or the direct bypass)
    Publish {
        /// Route through the outbox table; false publishes directly with no
        /// durability fallback
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        use_outbox: bool,

        /// Number of messages to publish (must be > 0)
        #[arg(long, default_value_t = 0)]
        max_msg: u32,

        /// Ordering key; empty means unordered
        #[arg(long, default_value = "")]
        ordering_key: String,
    },
    /// Run the consumer router until interrupted
    Listen,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli.command).await {
        tracing::error!(error = %format!("{err:#}"), "fatal error");
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Drain => run_drain().await,
        Commands::Publish {
            use_outbox,
            max_msg,
            ordering_key,
        } => run_publish(use_outbox, max_msg, &ordering_key).await,
        Commands::Listen => run_listen().await,
    }
}

fn validate_publish_args(max_msg: u32) -> anyhow::Result<()> {
    anyhow::ensure!(max_msg > 0, "--max-msg must be greater than 0");
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    Config::from_env().map_err(|e| anyhow::anyhow!(e))
}

async fn build_bus(config: &Config) -> anyhow::Result<Arc<dyn EventBus>> {
    match config.bus_type {
        BusType::Nats => {
            let nats_url = config
                .nats_url
                .as_deref()
                .context("NATS_URL required for the NATS bus")?;
            tracing::info!(url = %nats_url, "connecting to NATS");
            let client = async_nats::connect(nats_url)
                .await
                .context("failed to connect to NATS")?;
            let bus = NatsBus::new(client, config.stream_name.clone());
            bus.ensure_stream(vec![config.topic.clone()]).await?;
            Ok(Arc::new(bus))
        }
        BusType::InMemory => {
            tracing::warn!("using in-memory bus; messages do not leave this process");
            Ok(Arc::new(InMemoryBus::new()))
        }
    }
}

/// Flip the shutdown flag when the process receives Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        let _ = tx.send(true);
    });
    rx
}

async fn run_drain() -> anyhow::Result<()> {
    let config = load_config()?;
    let pool = connect_pool(&config).await?;
    let store = OutboxStore::new(pool, config.topic_configs());
    store.ensure_schema().await?;

    let bus = build_bus(&config).await?;
    let drainer = Drainer::new(store, bus, config.drain_config());

    drainer.run(shutdown_on_ctrl_c()).await;

    Ok(())
}

async fn run_publish(use_outbox: bool, max_msg: u32, ordering_key: &str) -> anyhow::Result<()> {
    // Reject bad flags before touching the database or the bus.
    validate_publish_args(max_msg)?;

    let config = load_config()?;
    let pool = connect_pool(&config).await?;
    let store = OutboxStore::new(pool.clone(), config.topic_configs());
    store.ensure_schema().await?;

    let bus = build_bus(&config).await?;

    let enqueuer = if use_outbox {
        Enqueuer::Durable(DurableEnqueuer::new(store, bus, SOURCE))
    } else {
        Enqueuer::Direct(DirectPublisher::new(bus, SOURCE))
    };

    let key = if ordering_key.is_empty() {
        None
    } else {
        Some(ordering_key)
    };

    tracing::info!(
        use_outbox = use_outbox,
        max_msg = max_msg,
        ordering_key = %ordering_key,
        "publishing messages"
    );

    // One transaction per message, callbacks fired only after their commits.
    let mut tickets = Vec::new();
    for i in 0..max_msg {
        let mut tx = pool.begin().await?;
        let payload = serde_json::json!({
            "message": format!("event message {i}"),
            "sequence": i,
        });

        match enqueuer.enqueue(&mut tx, &config.topic, key, &payload).await {
            Ok(ticket) => {
                tx.commit().await?;
                tickets.push(ticket);
            }
            Err(e) => {
                tx.rollback().await?;
                tracing::error!(sequence = i, error = %e, "enqueue failed, transaction rolled back");
            }
        }
    }

    tracing::info!(count = tickets.len(), "firing post-commit publish callbacks");
    for ticket in tickets {
        ticket.fire().await;
    }

    Ok(())
}

async fn run_listen() -> anyhow::Result<()> {
    let config = load_config()?;
    let pool = connect_pool(&config).await?;
    // Creates processed_events, the consumer-side dedup table.
    let store = OutboxStore::new(pool.clone(), config.topic_configs());
    store.ensure_schema().await?;

    let bus = build_bus(&config).await?;

    let mut router = Router::new(bus, config.subscription.clone(), config.ack_deadline);

    let topic = config.topic.clone();
    router.register_handler(config.topic.as_str(), move |payload: Vec<u8>| {
        let pool = pool.clone();
        let topic = topic.clone();
        async move {
            // A message that cannot validate will never validate: ack it
            // away instead of nacking it into an endless redelivery loop.
            // Only transient failures (the dedup-table write below) return
            // Err and get redelivered.
            let (event_id, envelope) = match parse_envelope(&payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed message");
                    return Ok(());
                }
            };

            process_event_idempotent(&pool, event_id, &topic, || async {
                tracing::info!(event_id = %event_id, payload = %envelope, "received event");
                Ok(())
            })
            .await?;

            Ok(())
        }
    });

    router.run(shutdown_on_ctrl_c()).await?;

    Ok(())
}
