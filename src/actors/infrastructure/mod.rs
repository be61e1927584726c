// ============================================================================
// Infrastructure Actors
// ============================================================================
//
// - Dead letter queue
// - Health monitoring
//
// ============================================================================

mod dlq;
mod health_monitor;

pub use dlq::{
    CheckDlqHealth, DeadLetters, DlqActor, DlqStats, GetDeadLetters, GetDlqStats, ParkDeadLetter,
    DEFAULT_DLQ_CAPACITY,
};
pub use health_monitor::{
    broker_health, GetSystemHealth, HealthMonitorActor, SystemHealth, UpdateHealth, BROKER_COMPONENT,
    STORE_COMPONENT,
};
