use std::env;
use std::time::Duration;

use crate::drainer::DrainConfig;
use crate::models::TopicConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "nats".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to nats");
                BusType::Nats
            }
        }
    }
}

/// Process configuration, environment-driven.
///
/// Everything here is a connection or tuning parameter; the outbox core
/// takes these as inputs and contains no environment access of its own.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub database_url: String,
    pub nats_url: Option<String>,
    /// JetStream stream backing all relay subjects.
    pub stream_name: String,
    pub topic: String,
    pub subscription: String,
    pub table_index: u32,
    pub delete_existing_on_add: bool,
    pub batch_size: i64,
    pub drain_interval: Duration,
    pub max_attempts: i32,
    pub ack_deadline: Duration,
    pub max_connections: u32,
    pub connection_max_lifetime: Duration,
    pub db_connect_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let nats_url = match bus_type {
            BusType::Nats => Some(
                env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            ),
            BusType::InMemory => None,
        };

        Ok(Self {
            bus_type,
            database_url,
            nats_url,
            stream_name: env::var("NATS_STREAM").unwrap_or_else(|_| "OUTBOX_EVENTS".to_string()),
            topic: env::var("OUTBOX_TOPIC").unwrap_or_else(|_| "outbox.debugger".to_string()),
            subscription: env::var("OUTBOX_SUBSCRIPTION")
                .unwrap_or_else(|_| "outbox-debugger-sub".to_string()),
            table_index: parse_env("OUTBOX_TABLE_INDEX", 1)?,
            delete_existing_on_add: parse_env("OUTBOX_DELETE_EXISTING_ON_ADD", false)?,
            batch_size: parse_env("DRAIN_BATCH_SIZE", 100)?,
            drain_interval: Duration::from_secs(parse_env("DRAIN_INTERVAL_SECS", 60)?),
            max_attempts: parse_env("OUTBOX_MAX_ATTEMPTS", 5)?,
            ack_deadline: Duration::from_secs(parse_env("ACK_DEADLINE_SECS", 40)?),
            max_connections: parse_env("DB_MAX_CONNECTIONS", 10)?,
            connection_max_lifetime: Duration::from_secs(parse_env(
                "DB_CONNECTION_MAX_LIFETIME_SECS",
                3000,
            )?),
            db_connect_retries: parse_env("DB_CONNECT_RETRIES", 3)?,
        })
    }

    /// Topic-to-partition mapping the store is built with.
    pub fn topic_configs(&self) -> Vec<TopicConfig> {
        vec![TopicConfig {
            topic: self.topic.clone(),
            table_index: self.table_index,
            delete_existing_on_add: self.delete_existing_on_add,
        }]
    }

    pub fn drain_config(&self) -> DrainConfig {
        DrainConfig {
            batch_size: self.batch_size,
            interval: self.drain_interval,
            max_attempts: self.max_attempts,
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| format!("invalid {name} value {raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            "BUS_TYPE",
            "DATABASE_URL",
            "NATS_URL",
            "NATS_STREAM",
            "OUTBOX_TOPIC",
            "OUTBOX_SUBSCRIPTION",
            "OUTBOX_TABLE_INDEX",
            "OUTBOX_DELETE_EXISTING_ON_ADD",
            "DRAIN_BATCH_SIZE",
            "DRAIN_INTERVAL_SECS",
            "OUTBOX_MAX_ATTEMPTS",
            "ACK_DEADLINE_SECS",
            "DB_MAX_CONNECTIONS",
            "DB_CONNECTION_MAX_LIFETIME_SECS",
            "DB_CONNECT_RETRIES",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/outbox");
        env::set_var("BUS_TYPE", "inmemory");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bus_type, BusType::InMemory);
        assert!(config.nats_url.is_none());
        assert_eq!(config.topic, "outbox.debugger");
        assert_eq!(config.table_index, 1);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.drain_interval, Duration::from_secs(60));
        assert_eq!(config.ack_deadline, Duration::from_secs(40));
        assert_eq!(config.max_attempts, 5);
        assert!(!config.delete_existing_on_add);
    }

    #[test]
    #[serial]
    fn test_missing_database_url_rejected() {
        clear_env();
        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_nats_defaults_and_overrides() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/outbox");
        env::set_var("BUS_TYPE", "nats");
        env::set_var("DRAIN_INTERVAL_SECS", "5");
        env::set_var("OUTBOX_TABLE_INDEX", "3");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bus_type, BusType::Nats);
        assert_eq!(config.nats_url.as_deref(), Some("nats://localhost:4222"));
        assert_eq!(config.drain_interval, Duration::from_secs(5));
        assert_eq!(config.topic_configs()[0].table_index, 3);
    }

    #[test]
    #[serial]
    fn test_invalid_number_rejected() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/outbox");
        env::set_var("DRAIN_BATCH_SIZE", "lots");

        assert!(Config::from_env().is_err());
    }
}
