use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Order Value Objects
// ============================================================================

/// Lifecycle status of an order. Serialized with the wire names shared by
/// every service in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pendiente,
    EnProcesamiento,
    Enviado,
    Entregado,
    Cancelado,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Pendiente,
        OrderStatus::EnProcesamiento,
        OrderStatus::Enviado,
        OrderStatus::Entregado,
        OrderStatus::Cancelado,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pendiente => "pendiente",
            OrderStatus::EnProcesamiento => "en_procesamiento",
            OrderStatus::Enviado => "enviado",
            OrderStatus::Entregado => "entregado",
            OrderStatus::Cancelado => "cancelado",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Entregado | OrderStatus::Cancelado)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown order status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A line of an order. Prices are integer minor currency units.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub product_name: String,
    pub product_image_url: Option<String>,
    pub unit_price: i64,
    pub quantity: u32,
    pub subtotal: i64,
}

impl OrderItem {
    pub fn new(
        product_id: impl Into<String>,
        product_name: impl Into<String>,
        product_image_url: Option<String>,
        unit_price: i64,
        quantity: u32,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            product_name: product_name.into(),
            product_image_url,
            unit_price,
            quantity,
            subtotal: unit_price.saturating_mul(i64::from(quantity)),
        }
    }
}

/// A requested product the inventory cannot cover.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnavailableItem {
    pub product_id: String,
    pub requested: u32,
    pub available: u32,
}

// ============================================================================
// Unit Tests
// ============================================================================
