// ============================================================================
// Order Domain - Business Logic for the Order Aggregate
// ============================================================================
//
// - Value objects (OrderItem, OrderStatus)
// - State machine (allowed status transitions)
// - Aggregate (Order with its invariants)
// - Commands (CreateOrder, UpdateStatus)
// - Events (wire payloads published and consumed on the broker)
// - Errors (OrderError and its ErrorKind classification)
//
// Nothing here touches storage or transport.
//
// ============================================================================

pub mod value_objects;
pub mod state_machine;
pub mod aggregate;
pub mod commands;
pub mod events;
pub mod errors;

// Re-export for convenience
pub use value_objects::*;
pub use aggregate::*;
pub use commands::*;
pub use events::*;
pub use errors::*;
