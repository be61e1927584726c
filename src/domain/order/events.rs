use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::aggregate::Order;

// ============================================================================
// Order Events - Wire payloads shared with the rest of the mesh
// ============================================================================
//
// Payloads are JSON with camelCase keys. `order.created` is the contract
// consumed by the inventory service; `order.failed.stock` is the reverse
// direction and arrives wrapped in an envelope.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrderCreated,
    OrderShipped,
    OrderDelivered,
    OrderFailedStock,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderCreated => "order.created",
            EventKind::OrderShipped => "order.shipped",
            EventKind::OrderDelivered => "order.delivered",
            EventKind::OrderFailedStock => "order.failed.stock",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base trait for every event this service publishes.
pub trait DomainEvent: Serialize {
    const KIND: EventKind;

    fn aggregate_id(&self) -> Uuid;
}

/// Compact projection of a new order: id plus product → quantity.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedPayload {
    pub order_id: Uuid,
    pub items: BTreeMap<String, u32>,
}

impl OrderCreatedPayload {
    pub fn from_order(order: &Order) -> Self {
        let mut items = BTreeMap::new();
        for item in order.items() {
            let quantity = items.entry(item.product_id.clone()).or_insert(0u32);
            *quantity = quantity.saturating_add(item.quantity);
        }
        Self {
            order_id: order.id,
            items,
        }
    }
}

impl DomainEvent for OrderCreatedPayload {
    const KIND: EventKind = EventKind::OrderCreated;

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShippedItem {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderShippedPayload {
    pub order_id: Uuid,
    pub client_id: String,
    pub client_email: String,
    pub tracking_number: String,
    pub items: Vec<ShippedItem>,
}

impl OrderShippedPayload {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            client_id: order.client_id.clone(),
            client_email: order.client_email.clone(),
            tracking_number: order.tracking_number().unwrap_or_default().to_string(),
            items: order
                .items()
                .iter()
                .map(|item| ShippedItem {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                })
                .collect(),
        }
    }
}

impl DomainEvent for OrderShippedPayload {
    const KIND: EventKind = EventKind::OrderShipped;

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderDeliveredPayload {
    pub order_id: Uuid,
    pub client_id: String,
    pub client_email: String,
}

impl OrderDeliveredPayload {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            client_id: order.client_id.clone(),
            client_email: order.client_email.clone(),
        }
    }
}

impl DomainEvent for OrderDeliveredPayload {
    const KIND: EventKind = EventKind::OrderDelivered;

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

// ============================================================================
// Inbound: order.failed.stock
// ============================================================================

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct StockFailureEnvelope {
    #[serde(default)]
    pub data: Option<StockFailureData>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StockFailureData {
    #[serde(default)]
    pub order_id: Option<Uuid>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message envelope has no data")]
    MissingData,

    #[error("Message envelope has no order id")]
    MissingOrderId,
}

impl StockFailureEnvelope {
    pub fn for_order(order_id: Uuid) -> Self {
        Self {
            data: Some(StockFailureData {
                order_id: Some(order_id),
                reason: None,
            }),
        }
    }

    /// Extract the order id, failing on any schema mismatch.
    pub fn decode_order_id(payload: &[u8]) -> Result<Uuid, EnvelopeError> {
        let envelope: StockFailureEnvelope = serde_json::from_slice(payload)?;
        envelope
            .data
            .ok_or(EnvelopeError::MissingData)?
            .order_id
            .ok_or(EnvelopeError::MissingOrderId)
    }
}
