use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::order::EventKind;
use crate::messaging::FailurePolicy;
use crate::utils::RetryConfig;

// ============================================================================
// Configuration - Environment driven
// ============================================================================
//
// `from_env` reads an optional `.env` file first, then the process
// environment. Queue names have no defaults: a service that publishes to a
// guessed queue is worse than one that refuses to publish.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Redpanda,
    Memory,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redpanda" | "kafka" => Ok(TransportKind::Redpanda),
            "memory" => Ok(TransportKind::Memory),
            other => Err(format!("unknown broker transport '{other}'")),
        }
    }
}

/// Queue name per event kind. `None` means not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueConfig {
    pub order_created: Option<String>,
    pub order_shipped: Option<String>,
    pub order_delivered: Option<String>,
    pub order_failed_stock: Option<String>,
}

impl QueueConfig {
    pub fn queue_for(&self, kind: EventKind) -> Option<&str> {
        let name = match kind {
            EventKind::OrderCreated => &self.order_created,
            EventKind::OrderShipped => &self.order_shipped,
            EventKind::OrderDelivered => &self.order_delivered,
            EventKind::OrderFailedStock => &self.order_failed_stock,
        };
        name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub transport: TransportKind,
    pub url: String,
    pub consumer_group: String,
    pub reconnect: RetryConfig,
    pub heartbeat: Duration,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone)]
pub struct ScyllaConfig {
    pub nodes: Vec<String>,
    pub keyspace: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub queues: QueueConfig,
    /// `None` keeps orders in memory.
    pub scylla: Option<ScyllaConfig>,
    pub metrics_port: u16,
    pub health_grpc_addr: SocketAddr,
    pub run_demo: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = RetryConfig::broker_reconnect();
        let reconnect = RetryConfig {
            max_attempts: parse(&get, "BROKER_RECONNECT_MAX_ATTEMPTS", defaults.max_attempts)?,
            initial_delay: Duration::from_millis(parse(
                &get,
                "BROKER_RECONNECT_INITIAL_DELAY_MS",
                defaults.initial_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse(
                &get,
                "BROKER_RECONNECT_MAX_DELAY_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
            multiplier: defaults.multiplier,
        };
        if reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "BROKER_RECONNECT_MAX_ATTEMPTS",
                value: "0".into(),
                reason: "at least one attempt is required".into(),
            });
        }

        let heartbeat = parse(&get, "BROKER_HEARTBEAT_SECS", 10u64)?;
        if heartbeat == 0 {
            return Err(ConfigError::Invalid {
                key: "BROKER_HEARTBEAT_SECS",
                value: "0".into(),
                reason: "heartbeat must be at least one second".into(),
            });
        }

        let broker = BrokerConfig {
            transport: parse(&get, "BROKER_TRANSPORT", TransportKind::Redpanda)?,
            url: get("BROKER_URL").unwrap_or_else(|| "127.0.0.1:9092".to_string()),
            consumer_group: get("BROKER_CONSUMER_GROUP").unwrap_or_else(|| "order-lifecycle".to_string()),
            reconnect,
            heartbeat: Duration::from_secs(heartbeat),
            failure_policy: parse(&get, "CONSUMER_FAILURE_POLICY", FailurePolicy::DeadLetter)?,
        };

        let queues = QueueConfig {
            order_created: get("ORDER_CREATED_QUEUE"),
            order_shipped: get("ORDER_SHIPPED_QUEUE"),
            order_delivered: get("ORDER_DELIVERED_QUEUE"),
            order_failed_stock: get("ORDER_FAILED_STOCK_QUEUE"),
        };

        let scylla = get("SCYLLA_NODES").map(|nodes| ScyllaConfig {
            nodes: nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect(),
            keyspace: get("SCYLLA_KEYSPACE").unwrap_or_else(|| "orders_ks".to_string()),
        });

        Ok(Self {
            broker,
            queues,
            scylla,
            metrics_port: parse(&get, "METRICS_PORT", 9090u16)?,
            health_grpc_addr: parse(&get, "HEALTH_GRPC_ADDR", SocketAddr::from(([0, 0, 0, 0], 50051)))?,
            run_demo: parse(&get, "RUN_DEMO", false)?,
        })
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();

        assert_eq!(config.broker.transport, TransportKind::Redpanda);
        assert_eq!(config.broker.url, "127.0.0.1:9092");
        assert_eq!(config.broker.reconnect, RetryConfig::broker_reconnect());
        assert_eq!(config.broker.failure_policy, FailurePolicy::DeadLetter);
        assert_eq!(config.queues, QueueConfig::default());
        assert!(config.scylla.is_none());
        assert_eq!(config.metrics_port, 9090);
        assert!(!config.run_demo);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("BROKER_TRANSPORT", "memory"),
            ("BROKER_RECONNECT_MAX_ATTEMPTS", "3"),
            ("BROKER_RECONNECT_INITIAL_DELAY_MS", "250"),
            ("CONSUMER_FAILURE_POLICY", "requeue"),
            ("ORDER_CREATED_QUEUE", "order.created"),
            ("ORDER_FAILED_STOCK_QUEUE", " "),
            ("SCYLLA_NODES", "10.0.0.1:9042, 10.0.0.2:9042"),
            ("RUN_DEMO", "true"),
        ])
        .unwrap();

        assert_eq!(config.broker.transport, TransportKind::Memory);
        assert_eq!(config.broker.reconnect.max_attempts, 3);
        assert_eq!(config.broker.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(config.broker.failure_policy, FailurePolicy::Requeue);
        assert_eq!(config.queues.queue_for(EventKind::OrderCreated), Some("order.created"));
        assert_eq!(config.queues.queue_for(EventKind::OrderFailedStock), None);
        assert_eq!(config.scylla.unwrap().nodes, vec!["10.0.0.1:9042", "10.0.0.2:9042"]);
        assert!(config.run_demo);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let error = config(&[("METRICS_PORT", "ninety")]).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { key: "METRICS_PORT", .. }));

        let error = config(&[("BROKER_RECONNECT_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { key: "BROKER_RECONNECT_MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn test_zero_heartbeat_is_rejected() {
        let error = config(&[("BROKER_HEARTBEAT_SECS", "0")]).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { key: "BROKER_HEARTBEAT_SECS", .. }));

        let config = config(&[("BROKER_HEARTBEAT_SECS", "1")]).unwrap();
        assert_eq!(config.broker.heartbeat, Duration::from_secs(1));
    }
}
