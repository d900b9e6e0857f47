// ============================================================================
// Order Aggregate Store
// ============================================================================
//
// Persistence for orders (with their sub-orders and lines as one unit),
// vendors and their derived balances, and payment callback receipts.
//
// Every order write is compare-and-set on the version the caller loaded.
// A lost race returns `SaveOutcome::VersionConflict`; callers reload and
// re-run the command against the fresh state.
//
// ============================================================================

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::core::EventEnvelope;
use crate::domain::order::{Order, OrderEvent, Vendor};
use crate::error::ErrorKind;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("Corrupt record {entity} {id}: {reason}")]
    Corrupt { entity: &'static str, id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Duplicate { .. } => ErrorKind::Conflict,
            StoreError::Database(sqlx::Error::PoolTimedOut) => ErrorKind::External { timeout: true },
            StoreError::Database(sqlx::Error::Io(_)) => ErrorKind::External { timeout: false },
            StoreError::Database(_) | StoreError::Corrupt { .. } | StoreError::Serialization(_) => {
                ErrorKind::Internal
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Someone else wrote the order since it was loaded.
    VersionConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackSource {
    Ipn,
    Success,
    Fail,
    Cancel,
}

impl CallbackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackSource::Ipn => "ipn",
            CallbackSource::Success => "success",
            CallbackSource::Fail => "fail",
            CallbackSource::Cancel => "cancel",
        }
    }
}

/// One gateway callback as received, whether or not it changed anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackReceipt {
    pub id: Uuid,
    pub transaction_id: String,
    pub source: CallbackSource,
    pub verdict: String,
    pub signature: Option<String>,
    pub received_at: DateTime<Utc>,
    /// True when the callback moved the order; false for no-ops and rejects.
    pub processed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorBalance {
    pub vendor_id: Uuid,
    pub total_earned: Decimal,
    pub available_balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Input row for balance reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredSubOrder {
    pub sub_order_id: Uuid,
    pub order_id: Uuid,
    pub vendor_id: Uuid,
    pub payable_amount: Decimal,
    /// `None` when the vendor record is gone; the configured default applies.
    pub commission_rate: Option<Decimal>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist a freshly split order together with its creation events.
    async fn insert_order(&self, order: &Order, events: &[EventEnvelope<OrderEvent>]) -> Result<(), StoreError>;

    async fn load_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn find_by_transaction(&self, transaction_id: &str) -> Result<Option<Order>, StoreError>;

    async fn find_by_sub_order(&self, sub_order_id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn find_by_tracking_code(&self, tracking_code: &str) -> Result<Option<Order>, StoreError>;

    async fn find_by_parcel_id(&self, parcel_id: &str) -> Result<Option<Order>, StoreError>;

    /// Replace the stored order if its version still equals `expected_version`.
    ///
    /// `order.version` must already be the next version.
    async fn save_order(
        &self,
        order: &Order,
        expected_version: i64,
        events: &[EventEnvelope<OrderEvent>],
    ) -> Result<SaveOutcome, StoreError>;

    async fn load_events(&self, order_id: Uuid) -> Result<Vec<EventEnvelope<OrderEvent>>, StoreError>;

    async fn record_callback(&self, receipt: &CallbackReceipt) -> Result<(), StoreError>;

    /// Committed sub-orders currently in Delivered, with their vendor commission.
    async fn delivered_sub_orders(&self) -> Result<Vec<DeliveredSubOrder>, StoreError>;
}

#[async_trait]
pub trait VendorStore: Send + Sync {
    async fn upsert_vendor(&self, vendor: &Vendor) -> Result<(), StoreError>;

    async fn find_vendors(&self, vendor_ids: &[Uuid]) -> Result<HashMap<Uuid, Vendor>, StoreError>;

    /// Overwrite both balance fields for each listed vendor.
    async fn replace_balances(&self, balances: &[VendorBalance]) -> Result<(), StoreError>;

    async fn balance(&self, vendor_id: Uuid) -> Result<Option<VendorBalance>, StoreError>;
}
