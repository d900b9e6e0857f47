use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value_objects::{DeliveryMethod, OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress, SubOrderStatus};

// ============================================================================
// Order Commands - Represent caller intent
// ============================================================================

/// Checkout request: everything needed to build the Order aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub buyer_id: Uuid,
    pub shipping: ShippingAddress,
    pub delivery_method: DeliveryMethod,
    pub payment_method: PaymentMethod,
    pub lines: Vec<NewOrderLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderLine {
    pub product_id: Uuid,
    pub vendor_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    #[serde(default)]
    pub discount_price: Option<Decimal>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    /// Per-unit weight; lines without one weigh nothing.
    #[serde(default)]
    pub weight_kg: Option<Decimal>,
}

/// Commands against an existing order.
#[derive(Debug, Clone)]
pub enum OrderCommand {
    OpenPaymentSession {
        transaction_id: String,
    },
    /// Outcome reported by the gateway (IPN or browser redirect).
    SettlePayment {
        transaction_id: String,
        outcome: PaymentStatus,
        reference: Option<String>,
    },
    Refund {
        reason: Option<String>,
    },
    Confirm,
    Cancel {
        reason: Option<String>,
    },
    RequestReturn {
        reason: Option<String>,
    },
    CompleteReturn,
    ChangeSubOrderStatus {
        sub_order_id: Uuid,
        target: SubOrderStatus,
    },
    ClaimShipment {
        sub_order_id: Uuid,
        requested_at: DateTime<Utc>,
    },
    RecordShipment {
        sub_order_id: Uuid,
        courier: String,
        parcel_id: String,
        tracking_code: String,
    },
    /// Drop the claim taken at `requested_at`; a newer claim is left alone.
    ReleaseShipment {
        sub_order_id: Uuid,
        requested_at: DateTime<Utc>,
    },
    /// Clear a claim that has outlived its lease.
    ExpireShipmentClaim {
        sub_order_id: Uuid,
        now: DateTime<Utc>,
    },
}

impl OrderCommand {
    /// Map an administrative status request onto the command that performs it.
    pub fn for_admin_status(target: OrderStatus, reason: Option<String>) -> Option<Self> {
        match target {
            OrderStatus::Processing => Some(OrderCommand::Confirm),
            OrderStatus::Cancelled => Some(OrderCommand::Cancel { reason }),
            OrderStatus::ReturnRequest => Some(OrderCommand::RequestReturn { reason }),
            OrderStatus::Returned => Some(OrderCommand::CompleteReturn),
            OrderStatus::Pending
            | OrderStatus::PartiallyShipped
            | OrderStatus::Shipped
            | OrderStatus::Delivered => None,
        }
    }
}
