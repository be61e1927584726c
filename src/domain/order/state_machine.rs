use super::errors::OrderError;
use super::value_objects::OrderStatus;

// ============================================================================
// Order Status State Machine
// ============================================================================
//
//   pendiente ──► en_procesamiento ──► enviado ──► entregado
//       │                │                │
//       └────────────────┴────────────────┴──────► cancelado
//
// Pure logic: no storage, no transport. Entregado and cancelado are terminal.
//
// ============================================================================

/// Statuses reachable in one step from `from`.
pub fn allowed_targets(from: OrderStatus) -> &'static [OrderStatus] {
    match from {
        OrderStatus::Pendiente => &[OrderStatus::EnProcesamiento, OrderStatus::Cancelado],
        OrderStatus::EnProcesamiento => &[OrderStatus::Enviado, OrderStatus::Cancelado],
        OrderStatus::Enviado => &[OrderStatus::Entregado, OrderStatus::Cancelado],
        OrderStatus::Entregado | OrderStatus::Cancelado => &[],
    }
}

pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Validate a requested transition and return the target status.
pub fn transition(current: OrderStatus, requested: OrderStatus) -> Result<OrderStatus, OrderError> {
    if can_transition(current, requested) {
        Ok(requested)
    } else {
        Err(OrderError::InvalidTransition {
            from: current,
            to: requested,
        })
    }
}

/// Cancellation is its own entry point but follows the same edges.
pub fn can_cancel(current: OrderStatus) -> bool {
    can_transition(current, OrderStatus::Cancelado)
}

/// Domain event that accompanies entering a status, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    Shipped,
    Delivered,
}

pub fn event_for(status: OrderStatus) -> Option<TransitionEvent> {
    match status {
        OrderStatus::Enviado => Some(TransitionEvent::Shipped),
        OrderStatus::Entregado => Some(TransitionEvent::Delivered),
        _ => None,
    }
}
