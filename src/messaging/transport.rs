use async_trait::async_trait;
use std::sync::Arc;

use crate::utils::IsTransient;

// ============================================================================
// Broker Transport Abstraction
// ============================================================================
//
// A transport opens channels; a channel owns one physical connection and
// exposes queue assertion, persistent publish and manual-ack subscriptions.
// `BrokerConnection` is the only caller of these traits.
//
// ============================================================================

/// Position of a delivery inside its queue, used to acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTag {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: Vec<u8>,
    pub tag: DeliveryTag,
    /// Set when the broker re-delivers a message that was never acknowledged.
    pub redelivered: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker is not connected")]
    NotConnected,

    #[error("Broker connection is closed")]
    Closed,

    #[error("Broker connection failed: {0}")]
    Connect(String),

    #[error("Gave up connecting to broker after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Failed to assert queue {queue}: {reason}")]
    QueueAssert { queue: String, reason: String },

    #[error("Failed to publish to {queue}: {reason}")]
    Publish { queue: String, reason: String },

    #[error("Failed to subscribe to {queue}: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("Failed to acknowledge delivery: {0}")]
    Ack(String),

    #[error("Invalid broker configuration: {0}")]
    Configuration(String),
}

impl IsTransient for BrokerError {
    fn is_transient(&self) -> bool {
        !matches!(
            self,
            BrokerError::Configuration(_) | BrokerError::Closed | BrokerError::RetriesExhausted { .. }
        )
    }
}

#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Open a new physical connection and its channel.
    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Make sure `queue` exists, creating it if needed.
    async fn assert_queue(&self, queue: &str, durable: bool) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> Result<(), BrokerError>;

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Resolves once the connection is lost or closed.
    async fn closed(&self);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` once the channel is gone.
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;
}
