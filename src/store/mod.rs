use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::order::{Order, OrderError, OrderStatus};

mod memory;
mod scylla_store;

pub use memory::InMemoryOrderStore;
pub use scylla_store::ScyllaOrderStore;

// ============================================================================
// Order Store - Persistence boundary for the Order aggregate
// ============================================================================
//
// Every call is its own transactional unit. `save` is a compare-and-swap on
// the version the order was loaded with, so two writers racing on the same
// order cannot silently overwrite each other: the loser gets
// `StoreError::VersionConflict` and has to reload.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Order {id} was modified concurrently (expected version {expected})")]
    VersionConflict { id: Uuid, expected: i64 },

    #[error("Order {0} not found")]
    NotFound(Uuid),

    #[error("Order {0} already exists")]
    Duplicate(Uuid),

    #[error("Storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    pub fn backend(error: impl Into<anyhow::Error>) -> Self {
        StoreError::Backend(error.into())
    }
}

impl From<StoreError> for OrderError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::VersionConflict { id, .. } => OrderError::ConcurrentModification(id),
            StoreError::NotFound(id) => OrderError::NotFound(id),
            other => OrderError::infrastructure(other),
        }
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist a brand-new order.
    async fn create(&self, order: Order) -> Result<Order, StoreError>;

    /// Load an order; soft-deleted orders are hidden when `exclude_deleted` is set.
    async fn find_by_id(&self, id: Uuid, exclude_deleted: bool) -> Result<Option<Order>, StoreError>;

    /// Write `order` if the stored version still equals `order.version()`.
    /// Returns the order with its version bumped.
    async fn save(&self, order: Order) -> Result<Order, StoreError>;

    /// Orders matching `filter`, newest first. Soft-deleted orders never match.
    async fn query(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderFilter {
    pub order_id: Option<Uuid>,
    pub client_id: Option<String>,
    /// Case-insensitive substring of the client name.
    pub client_name_contains: Option<String>,
    pub status: Option<OrderStatus>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

impl OrderFilter {
    pub fn for_client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, order: &Order) -> bool {
        if order.is_deleted() {
            return false;
        }
        if self.order_id.is_some_and(|id| id != order.id) {
            return false;
        }
        if self.client_id.as_deref().is_some_and(|id| id != order.client_id) {
            return false;
        }
        if let Some(needle) = &self.client_name_contains {
            if !order.client_name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if self.status.is_some_and(|status| status != order.status()) {
            return false;
        }
        if self.created_from.is_some_and(|from| order.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| order.created_at > to) {
            return false;
        }
        true
    }
}

pub(crate) fn newest_first(orders: &mut [Order]) {
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}
