// ============================================================================
// Messaging Module
// ============================================================================
//
// Broker plumbing for the order service:
// - transport/  - broker-agnostic channel traits
// - redpanda    - Kafka-protocol transport (rdkafka)
// - memory      - in-process transport for tests and local runs
// - connection  - supervised connection with reconnect and consumers
// - consumer    - per-queue consumer task and settlement policy
// - publisher   - domain event publication
//
// ============================================================================

mod connection;
mod consumer;
pub mod memory;
mod publisher;
mod redpanda;
mod transport;

pub use connection::{BrokerConnection, BrokerConnectionBuilder, ConnectionState};
pub use consumer::{
    DeadLetter, DeadLetterOrigin, DeadLetterSink, Disposition, FailurePolicy, HandlerError,
    MessageHandler,
};
pub use memory::InMemoryBroker;
pub use publisher::{EventPublisher, PublishError};
pub use redpanda::{RedpandaSettings, RedpandaTransport};
pub use transport::{BrokerChannel, BrokerError, BrokerTransport, Delivery, DeliveryTag, Subscription};

#[cfg(test)]
pub(crate) use consumer::tests::RecordingSink;
