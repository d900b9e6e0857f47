// ============================================================================
// Actors Module
// ============================================================================
//
// Actors are reserved for background infrastructure. Order, payment and
// courier flows run through their services, not through actors.
//
// ============================================================================

mod reconciliation;

pub use reconciliation::{GetLastRun, LastRun, ReconciliationActor, TriggerReconciliation};
