use event_bus::retry::{retry_with_backoff, RetryConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::Config;
use crate::error::OutboxError;

/// Connect the shared, bounded pool.
///
/// The initial connect is retried with backoff (`db_connect_retries`
/// attempts) so a briefly unavailable database does not kill the process at
/// startup; exhaustion surfaces a fatal error.
pub async fn connect_pool(config: &Config) -> Result<PgPool, OutboxError> {
    let retry = RetryConfig {
        max_attempts: config.db_connect_retries,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(5),
    };

    let pool = retry_with_backoff(
        || async {
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .max_lifetime(Some(config.connection_max_lifetime))
                .connect(&config.database_url)
                .await
        },
        &retry,
        "database_connect",
    )
    .await?;

    tracing::info!("database connection established");

    Ok(pool)
}
