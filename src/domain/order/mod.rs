// ============================================================================
// Order Domain
// ============================================================================
//
// - Value objects (statuses, shipping snapshot, order lines, vendors)
// - Commands and events
// - Errors
// - State machine and parent status derivation
// - Vendor order splitter and delivery rate table
// - Order aggregate and its command handler
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod commands;
pub mod errors;
pub mod state_machine;
pub mod delivery;
pub mod splitter;
pub mod aggregate;
pub mod command_handler;

pub use value_objects::*;
pub use events::*;
pub use commands::*;
pub use errors::*;
pub use state_machine::derive_order_status;
pub use delivery::{DeliveryRateTable, FlatRate, ZoneRateTable};
pub use splitter::split_order;
pub use aggregate::*;
pub use command_handler::*;
