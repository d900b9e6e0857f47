//! Building blocks shared by the order aggregate and its audit trail.

pub mod aggregate;
pub mod event;

pub use aggregate::Aggregate;
pub use event::{DomainEvent, EventEnvelope};
