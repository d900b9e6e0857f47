pub mod compute;
pub mod service;

pub use compute::{compute_balances, vendor_share};
pub use service::{ReconciliationReport, ReconciliationService};

use crate::error::ErrorKind;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error("Commission rate {rate} for vendor {vendor_id} is outside 0..=100")]
    InvalidCommissionRate { vendor_id: uuid::Uuid, rate: rust_decimal::Decimal },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconciliationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconciliationError::InvalidCommissionRate { .. } => ErrorKind::Internal,
            ReconciliationError::Store(e) => e.kind(),
        }
    }
}
