use async_trait::async_trait;
use std::sync::Arc;

use super::{Compensation, OrderOrchestrator};
use crate::domain::order::StockFailureEnvelope;
use crate::messaging::{Delivery, HandlerError, MessageHandler};

/// Consumer for `order.failed.stock`: cancels orders whose stock could not be reserved.
pub struct StockFailureHandler {
    orchestrator: Arc<OrderOrchestrator>,
}

impl StockFailureHandler {
    pub fn new(orchestrator: Arc<OrderOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl MessageHandler for StockFailureHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let order_id = StockFailureEnvelope::decode_order_id(&delivery.payload).map_err(|e| {
            tracing::warn!(queue = %delivery.queue, error = %e, "Rejecting malformed stock failure message");
            HandlerError::Schema(e.to_string())
        })?;

        match self.orchestrator.compensate_stock_failure(order_id).await {
            Ok(Compensation::Applied { notified }) => {
                tracing::debug!(order_id = %order_id, notified, "Stock failure compensated");
                Ok(())
            }
            Ok(Compensation::Discarded(reason)) => {
                tracing::debug!(order_id = %order_id, ?reason, "Stock failure discarded");
                Ok(())
            }
            Err(e) => {
                tracing::error!(order_id = %order_id, error = ?e, "Stock failure compensation failed");
                Err(HandlerError::Processing(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{harness, order_in, queues};
    use super::*;
    use crate::domain::order::{OrderStatus, STOCK_FAILURE_REASON};
    use crate::messaging::DeliveryTag;
    use crate::store::OrderStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn delivery(payload: &[u8]) -> Delivery {
        Delivery {
            queue: "order.failed.stock".into(),
            payload: payload.to_vec(),
            tag: DeliveryTag { partition: 0, offset: 0 },
            redelivered: false,
        }
    }

    fn envelope(order_id: Uuid) -> Vec<u8> {
        serde_json::to_vec(&StockFailureEnvelope::for_order(order_id)).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_message_is_schema_error() {
        let h = harness().await;
        let handler = StockFailureHandler::new(h.orchestrator.clone());

        let result = handler.handle(&delivery(br#"{"orderId":"nope"}"#)).await;

        assert!(matches!(result, Err(HandlerError::Schema(_))));
    }

    #[tokio::test]
    async fn test_store_failure_is_processing_error() {
        let h = harness().await;
        let order = order_in(&h, OrderStatus::Pendiente).await;
        h.store.set_unavailable(true);
        let handler = StockFailureHandler::new(h.orchestrator.clone());

        let result = handler.handle(&delivery(&envelope(order.id))).await;

        assert!(matches!(result, Err(HandlerError::Processing(_))));
    }

    #[tokio::test]
    async fn test_unknown_order_is_acknowledged() {
        let h = harness().await;
        let handler = StockFailureHandler::new(h.orchestrator.clone());

        assert!(handler.handle(&delivery(&envelope(Uuid::new_v4()))).await.is_ok());
    }

    #[tokio::test]
    async fn test_registered_consumer_cancels_pending_order() {
        let h = harness().await;
        let pending = order_in(&h, OrderStatus::Pendiente).await;
        let shipped = order_in(&h, OrderStatus::Enviado).await;
        h.orchestrator.register_compensation(&h.connection, &queues()).await.unwrap();

        h.broker.inject("order.failed.stock", &envelope(pending.id));
        h.broker.inject("order.failed.stock", &envelope(shipped.id));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pending = h.store.find_by_id(pending.id, true).await.unwrap().unwrap();
        assert_eq!(pending.status(), OrderStatus::Cancelado);
        assert_eq!(pending.cancellation_reason(), Some(STOCK_FAILURE_REASON));

        let shipped = h.store.find_by_id(shipped.id, true).await.unwrap().unwrap();
        assert_eq!(shipped.status(), OrderStatus::Enviado);
        assert_eq!(h.broker.depth("order.failed.stock"), 0);
    }
}
