use async_trait::async_trait;

use crate::domain::order::{Order, OrderStatus};

// ============================================================================
// Notifier - Transactional email collaborator
// ============================================================================
//
// Calls are fire-and-forget from the orchestrator's point of view: an error
// here is logged by the caller and never fails the order operation.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification to {to} failed: {reason}")]
    Delivery { to: String, reason: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_order_confirmation(&self, order: &Order) -> Result<(), NotifyError>;

    async fn send_status_update(&self, order: &Order, previous: OrderStatus) -> Result<(), NotifyError>;

    async fn send_cancellation(&self, order: &Order) -> Result<(), NotifyError>;
}

/// Renders each email's subject line and logs it instead of sending it.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub const fn new() -> Self {
        Self
    }
}

pub fn confirmation_subject(order: &Order) -> String {
    format!("Confirmación de tu pedido #{}", short_id(order))
}

pub fn status_update_subject(order: &Order, previous: OrderStatus) -> String {
    format!(
        "Tu pedido #{} pasó de {} a {}",
        short_id(order),
        previous,
        order.status()
    )
}

pub fn cancellation_subject(order: &Order) -> String {
    format!("Tu pedido #{} fue cancelado", short_id(order))
}

fn short_id(order: &Order) -> String {
    order.id.simple().to_string()[..8].to_uppercase()
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_order_confirmation(&self, order: &Order) -> Result<(), NotifyError> {
        tracing::info!(
            to = %order.client_email,
            order_id = %order.id,
            total = order.total(),
            subject = %confirmation_subject(order),
            "Order confirmation email"
        );
        Ok(())
    }

    async fn send_status_update(&self, order: &Order, previous: OrderStatus) -> Result<(), NotifyError> {
        tracing::info!(
            to = %order.client_email,
            order_id = %order.id,
            tracking_number = order.tracking_number().unwrap_or("-"),
            subject = %status_update_subject(order, previous),
            "Order status email"
        );
        Ok(())
    }

    async fn send_cancellation(&self, order: &Order) -> Result<(), NotifyError> {
        tracing::info!(
            to = %order.client_email,
            order_id = %order.id,
            reason = order.cancellation_reason().unwrap_or("-"),
            subject = %cancellation_subject(order),
            "Order cancellation email"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::aggregate::tests::create_command;
    use crate::domain::order::UpdateStatus;
    use chrono::Utc;

    #[test]
    fn test_subjects() {
        let mut order = Order::create(create_command(), Utc::now());
        let change = order
            .apply_status(&UpdateStatus::to(OrderStatus::EnProcesamiento), Utc::now())
            .unwrap();

        let subject = status_update_subject(&order, change.previous);
        assert!(subject.ends_with("pasó de pendiente a en_procesamiento"));
        assert_eq!(short_id(&order).len(), 8);
        assert!(confirmation_subject(&order).contains(&short_id(&order)));
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let order = Order::create(create_command(), Utc::now());
        let notifier = LogNotifier::new();

        assert!(notifier.send_order_confirmation(&order).await.is_ok());
        assert!(notifier.send_status_update(&order, OrderStatus::Pendiente).await.is_ok());
        assert!(notifier.send_cancellation(&order).await.is_ok());
    }
}
