use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{newest_first, OrderFilter, OrderStore, StoreError};
use crate::domain::order::Order;

/// Process-local order store with the same version semantics as the ScyllaDB one.
#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<Uuid, Order>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a backend error, as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful `create` and `save` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }

    /// Flag an order as deleted without removing it.
    pub async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        order.is_deleted = true;
        order.version += 1;
        Ok(())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::backend(anyhow::anyhow!("in-memory store is unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, mut order: Order) -> Result<Order, StoreError> {
        self.check_available()?;

        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate(order.id));
        }
        order.version = 1;
        orders.insert(order.id, order.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(order)
    }

    async fn find_by_id(&self, id: Uuid, exclude_deleted: bool) -> Result<Option<Order>, StoreError> {
        self.check_available()?;

        Ok(self
            .orders
            .read()
            .await
            .get(&id)
            .filter(|order| !(exclude_deleted && order.is_deleted()))
            .cloned())
    }

    async fn save(&self, mut order: Order) -> Result<Order, StoreError> {
        self.check_available()?;

        let mut orders = self.orders.write().await;
        let stored = orders.get_mut(&order.id).ok_or(StoreError::NotFound(order.id))?;
        if stored.version != order.version {
            return Err(StoreError::VersionConflict {
                id: order.id,
                expected: order.version,
            });
        }
        order.version += 1;
        *stored = order.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(order)
    }

    async fn query(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        self.check_available()?;

        let mut found: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|order| filter.matches(order))
            .cloned()
            .collect();
        newest_first(&mut found);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::aggregate::tests::create_command;
    use crate::domain::order::{OrderStatus, UpdateStatus};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_create_and_find() {
        let store = InMemoryOrderStore::new();
        let order = store.create(Order::create(create_command(), Utc::now())).await.unwrap();

        assert_eq!(order.version(), 1);
        let found = store.find_by_id(order.id, true).await.unwrap().unwrap();
        assert_eq!(found, order);
        assert!(store.find_by_id(Uuid::new_v4(), true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_compare_and_swap() {
        let store = InMemoryOrderStore::new();
        let order = store.create(Order::create(create_command(), Utc::now())).await.unwrap();

        let mut first = order.clone();
        first.apply_status(&UpdateStatus::to(OrderStatus::EnProcesamiento), Utc::now()).unwrap();
        let mut second = order.clone();
        second.cancel(None, Utc::now()).unwrap();

        let saved = store.save(first).await.unwrap();
        assert_eq!(saved.version(), 2);

        let result = store.save(second).await;
        assert!(matches!(result, Err(StoreError::VersionConflict { expected: 1, .. })));

        let stored = store.find_by_id(order.id, true).await.unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::EnProcesamiento);
    }

    #[tokio::test]
    async fn test_soft_deleted_orders_are_hidden() {
        let store = InMemoryOrderStore::new();
        let order = store.create(Order::create(create_command(), Utc::now())).await.unwrap();
        store.soft_delete(order.id).await.unwrap();

        assert!(store.find_by_id(order.id, true).await.unwrap().is_none());
        assert!(store.find_by_id(order.id, false).await.unwrap().is_some());
        assert!(store.query(&OrderFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_orders_newest_first() {
        let store = InMemoryOrderStore::new();
        let now = Utc::now();
        let old = store.create(Order::create(create_command(), now - Duration::days(1))).await.unwrap();
        let new = store.create(Order::create(create_command(), now)).await.unwrap();

        let found = store.query(&OrderFilter::for_client("client-1")).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|o| o.id).collect();

        assert_eq!(ids, vec![new.id, old.id]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryOrderStore::new();
        store.set_unavailable(true);

        let result = store.create(Order::create(create_command(), Utc::now())).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(store.writes(), 0);
    }
}
