//! Order lifecycle and payment reconciliation core for a multi-vendor
//! marketplace: vendor order splitting, gateway payments, courier shipments
//! and vendor balance reconciliation.

pub mod actors;
pub mod config;
pub mod domain;
pub mod error;
pub mod http;
pub mod metrics;
pub mod store;
pub mod utils;
