use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::order::UnavailableItem;

// ============================================================================
// Inventory Client - Stock validation collaborator
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRequest {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockCheck {
    pub all_available: bool,
    pub unavailable: Vec<UnavailableItem>,
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Inventory service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn check_stock(&self, items: &[StockRequest]) -> Result<StockCheck, InventoryError>;
}

/// Stock levels held in memory. Unknown products have no stock.
#[derive(Default)]
pub struct InMemoryInventory {
    stock: RwLock<HashMap<String, u32>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stock<I, K>(levels: I) -> Self
    where
        I: IntoIterator<Item = (K, u32)>,
        K: Into<String>,
    {
        Self {
            stock: RwLock::new(levels.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    pub async fn set_stock(&self, product_id: impl Into<String>, available: u32) {
        self.stock.write().await.insert(product_id.into(), available);
    }
}

#[async_trait]
impl InventoryClient for InMemoryInventory {
    async fn check_stock(&self, items: &[StockRequest]) -> Result<StockCheck, InventoryError> {
        let stock = self.stock.read().await;

        // Repeated products are checked against their combined quantity.
        let mut requested: Vec<(&str, u32)> = Vec::new();
        for item in items {
            match requested.iter_mut().find(|(id, _)| *id == item.product_id) {
                Some((_, quantity)) => *quantity = quantity.saturating_add(item.quantity),
                None => requested.push((item.product_id.as_str(), item.quantity)),
            }
        }

        let unavailable: Vec<UnavailableItem> = requested
            .into_iter()
            .filter_map(|(product_id, quantity)| {
                let available = stock.get(product_id).copied().unwrap_or(0);
                (available < quantity).then(|| UnavailableItem {
                    product_id: product_id.to_string(),
                    requested: quantity,
                    available,
                })
            })
            .collect();

        Ok(StockCheck {
            all_available: unavailable.is_empty(),
            unavailable,
        })
    }
}
