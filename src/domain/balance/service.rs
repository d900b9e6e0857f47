use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};

use crate::metrics::Metrics;
use crate::store::{OrderStore, VendorBalance, VendorStore};

use super::compute::compute_balances;
use super::ReconciliationError;

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub delivered_sub_orders: usize,
    pub balances: Vec<VendorBalance>,
    pub completed_at: DateTime<Utc>,
}

/// Recomputes vendor balances from scratch. Safe to run any number of times.
pub struct ReconciliationService {
    orders: Arc<dyn OrderStore>,
    vendors: Arc<dyn VendorStore>,
    default_commission_rate: Decimal,
    metrics: Arc<Metrics>,
}

impl ReconciliationService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        vendors: Arc<dyn VendorStore>,
        default_commission_rate: Decimal,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { orders, vendors, default_commission_rate, metrics }
    }

    pub async fn run(&self) -> Result<ReconciliationReport, ReconciliationError> {
        let started = Instant::now();
        let result = self.reconcile().await;

        match &result {
            Ok(report) => {
                self.metrics.record_reconciliation(report.balances.len(), true);
                info!(
                    vendors = report.balances.len(),
                    delivered_sub_orders = report.delivered_sub_orders,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Vendor balances reconciled"
                );
            }
            Err(e) => {
                self.metrics.record_reconciliation(0, false);
                error!(error = %e, "Balance reconciliation failed");
            }
        }
        result
    }

    async fn reconcile(&self) -> Result<ReconciliationReport, ReconciliationError> {
        // Only committed Delivered rows are visible here
        let delivered = self.orders.delivered_sub_orders().await?;
        let completed_at = Utc::now();
        let balances = compute_balances(&delivered, self.default_commission_rate, completed_at)?;

        self.vendors.replace_balances(&balances).await?;
        for balance in &balances {
            tracing::debug!(vendor_id = %balance.vendor_id, total_earned = %balance.total_earned, "Vendor balance replaced");
        }

        Ok(ReconciliationReport {
            delivered_sub_orders: delivered.len(),
            balances,
            completed_at,
        })
    }
}
