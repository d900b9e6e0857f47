// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// - core:     Aggregate trait and event envelopes
// - order:    the Order aggregate, its state machine and the vendor splitter
// - payment:  gateway sessions and callback handling
// - courier:  shipments and tracking
// - balance:  vendor balance reconciliation
//
// Storage lives in crate::store; this layer only sees its traits.
//
// ============================================================================

pub mod core;
pub mod order;
pub mod payment;
pub mod courier;
pub mod balance;
