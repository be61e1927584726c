use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::commands::{CreateOrder, UpdateStatus};
use super::errors::OrderError;
use super::state_machine;
use super::value_objects::{OrderItem, OrderStatus};

pub const DEFAULT_CANCELLATION_REASON: &str = "Cancelado por el usuario";
pub const STOCK_FAILURE_REASON: &str = "Stock insuficiente";

// ============================================================================
// Order Aggregate
// ============================================================================
//
// Status, timestamps, tracking number and cancellation reason only change
// through `apply_status` and `cancel`, which both go through the state
// machine. Items and total are fixed at creation.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    // Identity
    pub id: Uuid,
    pub(crate) version: i64,

    pub client_id: String,
    pub client_name: String,
    pub client_email: String,
    pub shipping_address: String,

    status: OrderStatus,
    total: i64,
    items: Vec<OrderItem>,

    tracking_number: Option<String>,
    cancellation_reason: Option<String>,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,

    pub(crate) is_deleted: bool,

    // Audit Trail
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a successful status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: OrderStatus,
    pub current: OrderStatus,
}

impl Order {
    /// Build a new pending order. The command is expected to be validated.
    pub fn create(command: CreateOrder, now: DateTime<Utc>) -> Self {
        let items: Vec<OrderItem> = command
            .items
            .into_iter()
            .map(|item| {
                OrderItem::new(
                    item.product_id,
                    item.product_name,
                    item.product_image_url,
                    item.unit_price,
                    item.quantity,
                )
            })
            .collect();
        let total = items.iter().fold(0i64, |total, item| total.saturating_add(item.subtotal));

        Self {
            id: Uuid::new_v4(),
            version: 0,
            client_id: command.client_id,
            client_name: command.client_name,
            client_email: command.client_email,
            shipping_address: command.shipping_address,
            status: OrderStatus::Pendiente,
            total,
            items,
            tracking_number: None,
            cancellation_reason: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn shipped_at(&self) -> Option<DateTime<Utc>> {
        self.shipped_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    /// Apply an operator-requested status change.
    ///
    /// All checks run before any field is touched, so a rejected request
    /// leaves the order unchanged.
    pub fn apply_status(
        &mut self,
        update: &UpdateStatus,
        now: DateTime<Utc>,
    ) -> Result<StatusChange, OrderError> {
        let target = state_machine::transition(self.status, update.status)?;

        let tracking_number = match target {
            OrderStatus::Enviado => Some(
                update
                    .tracking_number
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or(OrderError::MissingTrackingNumber)?
                    .to_string(),
            ),
            _ => None,
        };

        let previous = self.status;
        match target {
            OrderStatus::Enviado => {
                self.tracking_number = tracking_number;
                self.shipped_at = Some(now);
            }
            OrderStatus::Entregado => {
                self.delivered_at = Some(now);
            }
            OrderStatus::Cancelado => {
                self.mark_cancelled(update.cancellation_reason.as_deref(), now);
            }
            OrderStatus::Pendiente | OrderStatus::EnProcesamiento => {}
        }
        self.status = target;
        self.updated_at = now;

        Ok(StatusChange {
            previous,
            current: target,
        })
    }

    /// Cancel the order. Allowed from any non-terminal status.
    pub fn cancel(&mut self, reason: Option<&str>, now: DateTime<Utc>) -> Result<StatusChange, OrderError> {
        if !state_machine::can_cancel(self.status) {
            return Err(OrderError::NotCancellable {
                id: self.id,
                status: self.status,
            });
        }

        let previous = self.status;
        self.mark_cancelled(reason, now);
        self.status = OrderStatus::Cancelado;
        self.updated_at = now;

        Ok(StatusChange {
            previous,
            current: OrderStatus::Cancelado,
        })
    }

    fn mark_cancelled(&mut self, reason: Option<&str>, now: DateTime<Utc>) {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_CANCELLATION_REASON);
        self.cancellation_reason = Some(reason.to_string());
        self.cancelled_at = Some(now);
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
