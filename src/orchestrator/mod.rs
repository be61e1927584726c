use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::clients::{InventoryClient, Notifier, NotifyError, StockRequest};
use crate::config::QueueConfig;
use crate::domain::order::state_machine::{self, TransitionEvent};
use crate::domain::order::{
    CreateOrder, DomainEvent, EventKind, Order, OrderCreatedPayload, OrderDeliveredPayload, OrderError,
    OrderShippedPayload, OrderStatus, StatusChange, UpdateStatus, STOCK_FAILURE_REASON,
};
use crate::messaging::{
    BrokerConnection, BrokerError, DeadLetter, DeadLetterOrigin, DeadLetterSink, EventPublisher, PublishError,
};
use crate::metrics::Metrics;
use crate::store::{OrderFilter, OrderStore, StoreError};

mod compensation;

pub use compensation::StockFailureHandler;

// ============================================================================
// Order Orchestrator
// ============================================================================
//
// Runs every lifecycle command against the store, the inventory and the
// broker, in this order:
//   load → state machine → persist → publish → notify
//
// - Publication happens only after the store accepted the write. A failed
//   publish is logged and parked in the dead-letter queue; it never rolls
//   back or fails the committed operation.
// - Notifications are best effort and never fail an operation.
// - Writes are version-checked by the store. A losing writer gets
//   `OrderError::ConcurrentModification`.
//
// ============================================================================

/// Result of processing one stock-failure event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// The order was cancelled and persisted.
    Applied { notified: bool },
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    NotFound,
    /// The order already left `pendiente`; a stale failure must not cancel it.
    NotPending(OrderStatus),
}

impl Compensation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compensation::Applied { .. } => "applied",
            Compensation::Discarded(DiscardReason::NotFound) => "discarded_not_found",
            Compensation::Discarded(DiscardReason::NotPending(_)) => "discarded_not_pending",
        }
    }
}

pub struct OrderOrchestrator {
    store: Arc<dyn OrderStore>,
    inventory: Arc<dyn InventoryClient>,
    notifier: Arc<dyn Notifier>,
    publisher: Arc<EventPublisher>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    metrics: Option<Arc<Metrics>>,
}

impl OrderOrchestrator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        inventory: Arc<dyn InventoryClient>,
        notifier: Arc<dyn Notifier>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            store,
            inventory,
            notifier,
            publisher,
            dead_letters: None,
            metrics: None,
        }
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Create a pending order after checking stock for every item.
    pub async fn create(&self, command: CreateOrder) -> Result<Order, OrderError> {
        command.validate()?;

        let requests: Vec<StockRequest> = command
            .items
            .iter()
            .map(|item| StockRequest {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            })
            .collect();
        let stock = self.inventory.check_stock(&requests).await.map_err(|e| {
            tracing::error!(error = %e, "Stock check failed");
            OrderError::infrastructure(e)
        })?;
        if !stock.all_available {
            tracing::warn!(
                client_id = %command.client_id,
                unavailable = stock.unavailable.len(),
                "Rejecting order, insufficient stock"
            );
            return Err(OrderError::InsufficientStock(stock.unavailable));
        }

        let order = self
            .store
            .create(Order::create(command, Utc::now()))
            .await
            .map_err(|e| self.store_failure(e))?;

        tracing::info!(
            order_id = %order.id,
            client_id = %order.client_id,
            total = order.total(),
            items = order.items().len(),
            "Order created"
        );
        if let Some(metrics) = &self.metrics {
            metrics.orders_created.inc();
        }

        let event = OrderCreatedPayload::from_order(&order);
        let published = self.publisher.order_created(&event).await;
        self.after_publish(&event, published).await;

        let result = self.notifier.send_order_confirmation(&order).await;
        self.notified("confirmation", order.id, result);

        Ok(order)
    }

    /// Move an order to `update.status` through the state machine.
    pub async fn update_status(&self, id: Uuid, update: UpdateStatus) -> Result<Order, OrderError> {
        let mut order = self.load(id).await?;
        let change = order.apply_status(&update, Utc::now())?;
        let order = self.store.save(order).await.map_err(|e| self.store_failure(e))?;
        self.record_transition(&order, change);

        match state_machine::event_for(change.current) {
            Some(TransitionEvent::Shipped) => {
                let event = OrderShippedPayload::from_order(&order);
                let published = self.publisher.order_shipped(&event).await;
                self.after_publish(&event, published).await;
            }
            Some(TransitionEvent::Delivered) => {
                let event = OrderDeliveredPayload::from_order(&order);
                let published = self.publisher.order_delivered(&event).await;
                self.after_publish(&event, published).await;
            }
            None => {}
        }

        let result = self.notifier.send_status_update(&order, change.previous).await;
        self.notified("status_update", order.id, result);

        Ok(order)
    }

    /// Cancel an order that is not yet delivered or cancelled.
    pub async fn cancel(&self, id: Uuid, reason: Option<&str>) -> Result<Order, OrderError> {
        let mut order = self.load(id).await?;
        let change = order.cancel(reason, Utc::now())?;
        let order = self.store.save(order).await.map_err(|e| self.store_failure(e))?;
        self.record_transition(&order, change);

        let result = self.notifier.send_cancellation(&order).await;
        self.notified("cancellation", order.id, result);

        Ok(order)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get(&self, id: Uuid) -> Result<Order, OrderError> {
        self.load(id).await
    }

    pub async fn find_all(&self, filter: &OrderFilter) -> Result<Vec<Order>, OrderError> {
        self.store.query(filter).await.map_err(|e| self.store_failure(e))
    }

    pub async fn client_history(&self, client_id: &str) -> Result<Vec<Order>, OrderError> {
        self.find_all(&OrderFilter::for_client(client_id)).await
    }

    // ========================================================================
    // Compensation
    // ========================================================================

    /// Register the `order.failed.stock` consumer on `connection`.
    ///
    /// The registration survives a `NotConnected` error and starts with the
    /// next successful connect.
    pub async fn register_compensation(
        self: &Arc<Self>,
        connection: &BrokerConnection,
        queues: &QueueConfig,
    ) -> Result<(), BrokerError> {
        let queue = queues.queue_for(EventKind::OrderFailedStock).ok_or_else(|| {
            BrokerError::Configuration(format!("no queue configured for {} events", EventKind::OrderFailedStock))
        })?;

        match connection
            .consume(queue, Arc::new(StockFailureHandler::new(self.clone())))
            .await
        {
            Ok(()) => {
                tracing::info!(queue = %queue, "Registered stock failure compensation consumer");
                Ok(())
            }
            Err(BrokerError::NotConnected) => {
                tracing::warn!(queue = %queue, "Broker down, compensation consumer starts on next connect");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel `order_id` because stock could not be reserved, if it is still pending.
    ///
    /// A version conflict means the order changed while we were deciding; it
    /// is reloaded and re-checked once.
    pub async fn compensate_stock_failure(&self, order_id: Uuid) -> Result<Compensation, OrderError> {
        let mut retried = false;
        loop {
            let Some(mut order) = self
                .store
                .find_by_id(order_id, true)
                .await
                .map_err(|e| self.store_failure(e))?
            else {
                tracing::warn!(order_id = %order_id, "Discarding stock failure for unknown order");
                return Ok(self.compensated(Compensation::Discarded(DiscardReason::NotFound)));
            };

            if order.status() != OrderStatus::Pendiente {
                tracing::warn!(
                    order_id = %order_id,
                    status = %order.status(),
                    "Discarding stale stock failure, order already progressed"
                );
                return Ok(self.compensated(Compensation::Discarded(DiscardReason::NotPending(order.status()))));
            }

            let change = order.cancel(Some(STOCK_FAILURE_REASON), Utc::now())?;
            let order = match self.store.save(order).await {
                Ok(order) => order,
                Err(StoreError::VersionConflict { .. }) if !retried => {
                    tracing::debug!(order_id = %order_id, "Order changed during compensation, reloading");
                    retried = true;
                    continue;
                }
                Err(e) => return Err(self.store_failure(e)),
            };
            self.record_transition(&order, change);
            tracing::info!(order_id = %order_id, reason = STOCK_FAILURE_REASON, "Order cancelled by stock failure");

            let result = self.notifier.send_cancellation(&order).await;
            let notified = self.notified("cancellation", order.id, result);

            return Ok(self.compensated(Compensation::Applied { notified }));
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn load(&self, id: Uuid) -> Result<Order, OrderError> {
        self.store
            .find_by_id(id, true)
            .await
            .map_err(|e| self.store_failure(e))?
            .ok_or(OrderError::NotFound(id))
    }

    fn store_failure(&self, error: StoreError) -> OrderError {
        match &error {
            StoreError::VersionConflict { id, .. } => {
                tracing::warn!(order_id = %id, "Concurrent modification detected");
            }
            StoreError::NotFound(_) => {}
            other => tracing::error!(error = %other, "Order store failure"),
        }
        error.into()
    }

    /// Park events that could not be published; the state change stays committed.
    async fn after_publish<E: DomainEvent>(&self, event: &E, result: Result<(), PublishError>) {
        let Err(error) = result else {
            return;
        };

        let letter = match &error {
            PublishError::Broker { queue, payload, .. } => {
                DeadLetter::new(DeadLetterOrigin::Publish, queue.as_str(), payload, error.to_string())
            }
            _ => DeadLetter::new(
                DeadLetterOrigin::Publish,
                E::KIND.as_str(),
                &serde_json::to_vec(event).unwrap_or_default(),
                error.to_string(),
            ),
        };

        tracing::warn!(
            order_id = %event.aggregate_id(),
            event = %E::KIND,
            "State change committed but event not published, parking it"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_dead_letter(DeadLetterOrigin::Publish.as_str());
        }
        match &self.dead_letters {
            Some(sink) => sink.park(letter).await,
            None => tracing::error!(
                queue = %letter.queue,
                payload = %letter.payload,
                "No dead-letter sink configured, dropping event"
            ),
        }
    }

    /// Log a failed notification; returns whether it was delivered.
    fn notified(&self, kind: &'static str, order_id: Uuid, result: Result<(), NotifyError>) -> bool {
        match result {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(order_id = %order_id, kind = kind, error = %error, "Notification failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_notification_failure(kind);
                }
                false
            }
        }
    }

    fn record_transition(&self, order: &Order, change: StatusChange) {
        tracing::info!(
            order_id = %order.id,
            from = %change.previous,
            to = %change.current,
            "Order status changed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_status_transition(change.previous.as_str(), change.current.as_str());
        }
    }

    fn compensated(&self, outcome: Compensation) -> Compensation {
        if let Some(metrics) = &self.metrics {
            metrics.record_compensation(outcome.as_str());
        }
        outcome
    }
}
