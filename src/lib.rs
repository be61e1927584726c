// ============================================================================
// Order Lifecycle Service
// ============================================================================
//
// Event-driven order orchestration: orders move through
// pendiente → en_procesamiento → enviado → entregado (or cancelado), every
// committed change is announced on the broker, and stock failures reported
// by the inventory service cancel pending orders.
//
// ============================================================================

pub mod actors;
pub mod clients;
pub mod config;
pub mod domain;
pub mod messaging;
pub mod metrics;
pub mod orchestrator;
pub mod rpc;
pub mod store;
pub mod utils;
