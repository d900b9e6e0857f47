use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Order Value Objects
// ============================================================================

/// Payment lifecycle of an order, owned by the payment adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Paid => "Paid",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Refunded => "Refunded",
            PaymentStatus::Cancelled => "Cancelled",
        }
    }

    /// Failed or Cancelled: the attempt is over but no money moved.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Online,
    CashOnDelivery,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Online => "online",
            PaymentMethod::CashOnDelivery => "cash_on_delivery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    HomeDelivery,
    Express,
    Pickup,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::HomeDelivery => "home_delivery",
            DeliveryMethod::Express => "express",
            DeliveryMethod::Pickup => "pickup",
        }
    }

    /// Whether shipments for this method go through the courier.
    pub fn uses_courier(&self) -> bool {
        !matches!(self, DeliveryMethod::Pickup)
    }
}

/// Buyer-facing order status. Shipped/Delivered/Partially Shipped are derived
/// from the sub-orders; see `state_machine::derive_order_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Processing,
    #[serde(rename = "Partially Shipped")]
    PartiallyShipped,
    Shipped,
    Delivered,
    Cancelled,
    #[serde(rename = "Return Request")]
    ReturnRequest,
    Returned,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Processing => "Processing",
            OrderStatus::PartiallyShipped => "Partially Shipped",
            OrderStatus::Shipped => "Shipped",
            OrderStatus::Delivered => "Delivered",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::ReturnRequest => "Return Request",
            OrderStatus::Returned => "Returned",
        }
    }
}

/// Vendor-local shipment status of one sub-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubOrderStatus {
    Pending,
    Accepted,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    #[serde(rename = "Return Requested")]
    ReturnRequested,
    Returned,
}

impl SubOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubOrderStatus::Pending => "Pending",
            SubOrderStatus::Accepted => "Accepted",
            SubOrderStatus::Processing => "Processing",
            SubOrderStatus::Shipped => "Shipped",
            SubOrderStatus::Delivered => "Delivered",
            SubOrderStatus::Cancelled => "Cancelled",
            SubOrderStatus::ReturnRequested => "Return Requested",
            SubOrderStatus::Returned => "Returned",
        }
    }
}

/// Error for status strings read back from storage or request bodies.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! impl_status_str {
    ($ty:ty, $kind:literal, [$($variant:ident),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == <$ty>::$variant.as_str() {
                        return Ok(<$ty>::$variant);
                    }
                )+
                Err(ParseStatusError { kind: $kind, value: s.to_string() })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_status_str!(PaymentStatus, "payment status", [Pending, Paid, Failed, Refunded, Cancelled]);
impl_status_str!(PaymentMethod, "payment method", [Online, CashOnDelivery]);
impl_status_str!(DeliveryMethod, "delivery method", [HomeDelivery, Express, Pickup]);
impl_status_str!(OrderStatus, "order status", [
    Pending, Processing, PartiallyShipped, Shipped, Delivered, Cancelled, ReturnRequest, Returned,
]);
impl_status_str!(SubOrderStatus, "sub-order status", [
    Pending, Accepted, Processing, Shipped, Delivered, Cancelled, ReturnRequested, Returned,
]);

/// Consignee details captured at checkout. Never re-read from the buyer profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub name: String,
    pub phone: String,
    pub email: String,
    pub address: String,
    pub city: String,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

/// Product snapshot for one line of a sub-order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: Uuid,
    pub size: Option<String>,
    pub color: Option<String>,
    pub unit_price: Decimal,
    pub discount_price: Option<Decimal>,
    pub quantity: i32,
    pub line_total: Decimal,
    pub weight_kg: Decimal,
}

impl OrderLine {
    /// Price actually charged per unit.
    pub fn effective_price(&self) -> Decimal {
        self.discount_price.unwrap_or(self.unit_price)
    }
}

/// Marketplace seller as far as the order core needs to know it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: Uuid,
    pub name: String,
    /// Percentage of each delivered payable amount kept by the marketplace.
    pub commission_rate: Decimal,
    pub active: bool,
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_strings_round_trip_through_from_str() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::PartiallyShipped,
            OrderStatus::ReturnRequest,
            OrderStatus::Returned,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert_eq!(
            "Return Requested".parse::<SubOrderStatus>().unwrap(),
            SubOrderStatus::ReturnRequested
        );
        assert_eq!("cash_on_delivery".parse::<PaymentMethod>().unwrap(), PaymentMethod::CashOnDelivery);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = "Teleported".parse::<SubOrderStatus>().unwrap_err();
        assert_eq!(err.kind, "sub-order status");
        assert_eq!(err.value, "Teleported");
    }

    #[test]
    fn test_order_status_serializes_with_display_labels() {
        let json = serde_json::to_string(&OrderStatus::ReturnRequest).unwrap();
        assert_eq!(json, "\"Return Request\"");
        let status: OrderStatus = serde_json::from_str("\"Partially Shipped\"").unwrap();
        assert_eq!(status, OrderStatus::PartiallyShipped);
    }

    #[test]
    fn test_effective_price_prefers_discount() {
        let mut line = OrderLine {
            product_id: Uuid::new_v4(),
            size: Some("M".to_string()),
            color: None,
            unit_price: dec!(500),
            discount_price: Some(dec!(450)),
            quantity: 2,
            line_total: dec!(900),
            weight_kg: dec!(0.5),
        };
        assert_eq!(line.effective_price(), dec!(450));

        line.discount_price = None;
        assert_eq!(line.effective_price(), dec!(500));
    }

    #[test]
    fn test_pickup_does_not_use_courier() {
        assert!(!DeliveryMethod::Pickup.uses_courier());
        assert!(DeliveryMethod::HomeDelivery.uses_courier());
        assert!(DeliveryMethod::Express.uses_courier());
    }
}
