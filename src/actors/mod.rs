// ============================================================================
// Actors Module
// ============================================================================
//
// Actor-based infrastructure for asynchronous, concurrent operations.
//
// Structure:
// - core/           - Shared health types (HealthStatus, ComponentHealth)
// - infrastructure/ - Concrete infrastructure actors (DLQ, Health)
//
// Note: Order lifecycle logic lives in the orchestrator, NOT in actors.
//       Actors are reserved for infrastructure concerns only.
//
// ============================================================================

mod core;
mod infrastructure;

pub use core::{ComponentHealth, HealthCheckable, HealthStatus};
pub use infrastructure::*;
