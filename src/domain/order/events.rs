use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::core::DomainEvent;
use super::value_objects::{OrderStatus, PaymentStatus, SubOrderStatus};

// ============================================================================
// Order Events - facts recorded in the order audit trail
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    Placed(OrderPlaced),
    PaymentSessionOpened(PaymentSessionOpened),
    PaymentSettled(PaymentSettled),
    PaymentRefunded(PaymentRefunded),
    StatusChanged(OrderStatusChanged),
    SubOrderStatusChanged(SubOrderStatusChanged),
    ShipmentRequested(ShipmentRequested),
    ShipmentReleased(ShipmentReleased),
    ShipmentCreated(ShipmentCreated),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Placed(_) => "OrderPlaced",
            OrderEvent::PaymentSessionOpened(_) => "PaymentSessionOpened",
            OrderEvent::PaymentSettled(_) => "PaymentSettled",
            OrderEvent::PaymentRefunded(_) => "PaymentRefunded",
            OrderEvent::StatusChanged(_) => "OrderStatusChanged",
            OrderEvent::SubOrderStatusChanged(_) => "SubOrderStatusChanged",
            OrderEvent::ShipmentRequested(_) => "ShipmentRequested",
            OrderEvent::ShipmentReleased(_) => "ShipmentReleased",
            OrderEvent::ShipmentCreated(_) => "ShipmentCreated",
        }
    }
}

/// Order Placed - written once, together with the aggregate
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OrderPlaced {
    pub buyer_id: Uuid,
    pub total_amount: Decimal,
    pub vendor_count: usize,
}

/// A gateway session was opened (or reopened after a failed attempt)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PaymentSessionOpened {
    pub transaction_id: String,
    pub reopened: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PaymentSettled {
    pub transaction_id: Option<String>,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    /// Gateway validation / bank reference, when the callback carried one
    pub reference: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PaymentRefunded {
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OrderStatusChanged {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SubOrderStatusChanged {
    pub sub_order_id: Uuid,
    pub from: SubOrderStatus,
    pub to: SubOrderStatus,
}

/// Marks a courier call in flight so a concurrent request cannot book a
/// second parcel.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ShipmentRequested {
    pub sub_order_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ShipmentReleased {
    pub sub_order_id: Uuid,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ShipmentCreated {
    pub sub_order_id: Uuid,
    pub courier: String,
    pub parcel_id: String,
    pub tracking_code: String,
}
