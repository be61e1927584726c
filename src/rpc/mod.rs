// ============================================================================
// RPC Module
// ============================================================================
//
// - identity - caller identity carried in request metadata
// - service  - order RPCs with per-role authorization
// - status   - OrderError → tonic::Status mapping
//
// ============================================================================

mod identity;
mod service;
mod status;

pub use identity::{CallerIdentity, Role, USER_EMAIL_HEADER, USER_ID_HEADER, USER_ROLE_HEADER};
pub use service::{CancelOrder, ClientHistory, FindOneOrder, OrderService, UpdateOrderStatus};

/// gRPC service name reported through the health service.
pub const SERVICE_NAME: &str = "order.lifecycle.v1.Orders";
