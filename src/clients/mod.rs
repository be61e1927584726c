// ============================================================================
// External Collaborators
// ============================================================================
//
// Narrow interfaces to the services the order lifecycle depends on, plus the
// implementations bundled with the binary.
//
// ============================================================================

mod inventory;
mod notifier;

pub use inventory::{InMemoryInventory, InventoryClient, InventoryError, StockCheck, StockRequest};
pub use notifier::{LogNotifier, Notifier, NotifyError};
