use std::sync::Arc;

use super::connection::BrokerConnection;
use super::transport::BrokerError;
use crate::config::QueueConfig;
use crate::domain::order::{
    DomainEvent, EventKind, OrderCreatedPayload, OrderDeliveredPayload, OrderShippedPayload,
};
use crate::metrics::Metrics;

// ============================================================================
// Event Publisher
// ============================================================================
//
// Serializes domain events to JSON and hands them to `BrokerConnection`.
// Queue names come from configuration; a missing name is an error, never a
// default. No per-message retry here: failures are logged and returned.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("No queue configured for {0} events")]
    QueueNotConfigured(EventKind),

    #[error("Failed to serialize {kind} event: {source}")]
    Serialize {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to publish {kind} to {queue}: {source}")]
    Broker {
        kind: EventKind,
        queue: String,
        /// Encoded event, kept so the caller can park it.
        payload: Vec<u8>,
        #[source]
        source: BrokerError,
    },
}

pub struct EventPublisher {
    connection: Arc<BrokerConnection>,
    queues: QueueConfig,
    metrics: Option<Arc<Metrics>>,
}

impl EventPublisher {
    pub fn new(connection: Arc<BrokerConnection>, queues: QueueConfig) -> Self {
        Self {
            connection,
            queues,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn order_created(&self, event: &OrderCreatedPayload) -> Result<(), PublishError> {
        self.publish(event).await
    }

    pub async fn order_shipped(&self, event: &OrderShippedPayload) -> Result<(), PublishError> {
        self.publish(event).await
    }

    pub async fn order_delivered(&self, event: &OrderDeliveredPayload) -> Result<(), PublishError> {
        self.publish(event).await
    }

    async fn publish<E: DomainEvent>(&self, event: &E) -> Result<(), PublishError> {
        let kind = E::KIND;
        let result = self.send(event).await;

        match &result {
            Ok(()) => {
                tracing::info!(event = %kind, order_id = %event.aggregate_id(), "Published event");
            }
            Err(error) => {
                tracing::error!(
                    event = %kind,
                    order_id = %event.aggregate_id(),
                    error = %error,
                    "Failed to publish event"
                );
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_event_published(kind.as_str(), result.is_ok());
        }

        result
    }

    async fn send<E: DomainEvent>(&self, event: &E) -> Result<(), PublishError> {
        let kind = E::KIND;
        let queue = self
            .queues
            .queue_for(kind)
            .ok_or(PublishError::QueueNotConfigured(kind))?;
        let payload = serde_json::to_vec(event).map_err(|source| PublishError::Serialize { kind, source })?;

        self.connection
            .publish(queue, &payload)
            .await
            .map_err(|source| PublishError::Broker {
                kind,
                queue: queue.to_string(),
                payload,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::aggregate::tests::create_command;
    use crate::domain::order::Order;
    use crate::messaging::memory::InMemoryBroker;
    use crate::utils::RetryConfig;
    use chrono::Utc;
    use std::time::Duration;

    fn queues() -> QueueConfig {
        QueueConfig {
            order_created: Some("orders.created".into()),
            order_shipped: Some("orders.shipped".into()),
            order_delivered: None,
            order_failed_stock: Some("orders.failed.stock".into()),
        }
    }

    async fn connected(broker: &InMemoryBroker) -> Arc<BrokerConnection> {
        let connection = BrokerConnection::builder(Arc::new(broker.clone()))
            .retry(RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            })
            .build();
        connection.connect().await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_order_created_round_trip() {
        let broker = InMemoryBroker::new();
        let publisher = EventPublisher::new(connected(&broker).await, queues());
        let order = Order::create(create_command(), Utc::now());
        let event = OrderCreatedPayload::from_order(&order);

        publisher.order_created(&event).await.unwrap();

        let published = broker.drain("orders.created");
        assert_eq!(published.len(), 1);
        let decoded: OrderCreatedPayload = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(decoded.order_id, order.id);
        assert_eq!(decoded.items, event.items);
    }

    #[tokio::test]
    async fn test_unset_queue_fails_fast() {
        let broker = InMemoryBroker::new();
        let publisher = EventPublisher::new(connected(&broker).await, queues());
        let order = Order::create(create_command(), Utc::now());

        let result = publisher.order_delivered(&OrderDeliveredPayload::from_order(&order)).await;

        assert!(matches!(result, Err(PublishError::QueueNotConfigured(EventKind::OrderDelivered))));
    }

    #[tokio::test]
    async fn test_broker_failure_is_returned_with_payload() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        let publisher = EventPublisher::new(connection.clone(), queues());
        connection.close().await.unwrap();

        let order = Order::create(create_command(), Utc::now());
        let result = publisher.order_created(&OrderCreatedPayload::from_order(&order)).await;

        match result {
            Err(PublishError::Broker { queue, payload, source, .. }) => {
                assert_eq!(queue, "orders.created");
                assert!(!payload.is_empty());
                assert!(matches!(source, BrokerError::NotConnected));
            }
            other => panic!("expected broker error, got {other:?}"),
        }
    }
}
