use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::store::{DeliveredSubOrder, VendorBalance};

use super::ReconciliationError;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// What the vendor keeps of one delivered payable amount.
pub fn vendor_share(payable_amount: Decimal, commission_rate: Decimal) -> Decimal {
    payable_amount * (Decimal::ONE - commission_rate / HUNDRED)
}

/// Recompute every vendor's balance from the delivered sub-orders.
///
/// Pure: the same rows always give the same balances, in vendor id order.
/// Earned and available are equal because withdrawals are not netted here.
pub fn compute_balances(
    delivered: &[DeliveredSubOrder],
    default_commission_rate: Decimal,
    computed_at: DateTime<Utc>,
) -> Result<Vec<VendorBalance>, ReconciliationError> {
    let mut totals: BTreeMap<Uuid, Decimal> = BTreeMap::new();

    for row in delivered {
        let rate = row.commission_rate.unwrap_or(default_commission_rate);
        if rate < Decimal::ZERO || rate > HUNDRED {
            return Err(ReconciliationError::InvalidCommissionRate { vendor_id: row.vendor_id, rate });
        }
        *totals.entry(row.vendor_id).or_default() += vendor_share(row.payable_amount, rate);
    }

    Ok(totals
        .into_iter()
        .map(|(vendor_id, total)| {
            let total = total.round_dp(2);
            VendorBalance {
                vendor_id,
                total_earned: total,
                available_balance: total,
                updated_at: computed_at,
            }
        })
        .collect())
}
