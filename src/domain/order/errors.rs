use uuid::Uuid;

use super::value_objects::{OrderStatus, UnavailableItem};

// ============================================================================
// Order Errors
// ============================================================================

/// Coarse classification used by transports to pick a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-correctable input problem; nothing was mutated.
    Validation,
    NotFound,
    /// Request conflicts with current state (stock, cancellation, concurrent write).
    Conflict,
    PermissionDenied,
    /// Store, broker or collaborator failure. Details are logged, not returned.
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Tracking number is required to mark an order as {}", OrderStatus::Enviado)]
    MissingTrackingNumber,

    #[error("Invalid order: {0}")]
    Validation(String),

    #[error("Order not found: {0}")]
    NotFound(Uuid),

    #[error("Insufficient stock for {} product(s)", .0.len())]
    InsufficientStock(Vec<UnavailableItem>),

    #[error("Order {id} cannot be cancelled in status {status}")]
    NotCancellable { id: Uuid, status: OrderStatus },

    #[error("Order {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Internal error")]
    Infrastructure(#[source] anyhow::Error),
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::InvalidTransition { .. }
            | OrderError::MissingTrackingNumber
            | OrderError::Validation(_) => ErrorKind::Validation,
            OrderError::NotFound(_) => ErrorKind::NotFound,
            OrderError::InsufficientStock(_)
            | OrderError::NotCancellable { .. }
            | OrderError::ConcurrentModification(_) => ErrorKind::Conflict,
            OrderError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            OrderError::Infrastructure(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn infrastructure(error: impl Into<anyhow::Error>) -> Self {
        OrderError::Infrastructure(error.into())
    }
}
