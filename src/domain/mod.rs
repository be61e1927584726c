// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Pure order lifecycle rules. Infrastructure (broker, store, collaborators)
// lives outside this module and depends on it, never the other way round.
//
// ============================================================================

pub mod order;
