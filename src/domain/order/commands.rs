use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::errors::OrderError;
use super::value_objects::OrderStatus;

// ============================================================================
// Order Commands - Represent user intent
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrder {
    pub client_id: String,
    pub client_name: String,
    pub client_email: String,
    pub shipping_address: String,
    pub items: Vec<NewOrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderItem {
    pub product_id: String,
    pub product_name: String,
    pub product_image_url: Option<String>,
    pub unit_price: i64,
    pub quantity: u32,
}

impl CreateOrder {
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.client_id.trim().is_empty() {
            return Err(OrderError::Validation("client id is required".into()));
        }
        if self.client_email.trim().is_empty() {
            return Err(OrderError::Validation("client email is required".into()));
        }
        if self.shipping_address.trim().is_empty() {
            return Err(OrderError::Validation("shipping address is required".into()));
        }
        if self.items.is_empty() {
            return Err(OrderError::Validation("order items cannot be empty".into()));
        }

        for item in &self.items {
            if item.product_id.trim().is_empty() {
                return Err(OrderError::Validation("product id is required".into()));
            }
            if item.quantity == 0 {
                return Err(OrderError::Validation(format!(
                    "quantity for product {} must be positive",
                    item.product_id
                )));
            }
            if item.unit_price < 0 {
                return Err(OrderError::Validation(format!(
                    "unit price for product {} cannot be negative",
                    item.product_id
                )));
            }
        }

        // Subtotals, the total and per-product quantities must stay representable.
        let mut total: i64 = 0;
        let mut quantities: HashMap<&str, u32> = HashMap::new();
        for item in &self.items {
            total = item
                .unit_price
                .checked_mul(i64::from(item.quantity))
                .and_then(|subtotal| total.checked_add(subtotal))
                .ok_or_else(|| OrderError::Validation("order total out of range".into()))?;

            let quantity = quantities.entry(item.product_id.as_str()).or_insert(0);
            *quantity = quantity.checked_add(item.quantity).ok_or_else(|| {
                OrderError::Validation(format!("quantity for product {} out of range", item.product_id))
            })?;
        }

        Ok(())
    }
}

/// Generic status change requested by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub status: OrderStatus,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
}

impl UpdateStatus {
    pub fn to(status: OrderStatus) -> Self {
        Self {
            status,
            tracking_number: None,
            cancellation_reason: None,
        }
    }

    pub fn with_tracking_number(mut self, tracking_number: impl Into<String>) -> Self {
        self.tracking_number = Some(tracking_number.into());
        self
    }
}
