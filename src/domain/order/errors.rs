use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::store::StoreError;
use super::value_objects::{OrderStatus, PaymentStatus, SubOrderStatus};

// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order items cannot be empty")]
    EmptyItems,

    #[error("Invalid item quantity: {0}")]
    InvalidQuantity(i32),

    #[error("Invalid price for product {product_id}: {reason}")]
    InvalidPrice { product_id: Uuid, reason: &'static str },

    #[error("Order amounts exceed the supported range")]
    AmountOutOfRange,

    #[error("Invalid weight for product {0}")]
    InvalidWeight(Uuid),

    #[error("Shipping field `{0}` is required")]
    MissingShippingField(&'static str),

    #[error("Unknown vendor: {0}")]
    UnknownVendor(Uuid),

    #[error("Vendor is not accepting orders: {0}")]
    InactiveVendor(Uuid),

    #[error("Vendor group {0} has no lines")]
    EmptyVendorGroup(Uuid),

    #[error("Order total mismatch: sub-orders sum to {sub_order_sum}, lines and charges sum to {line_sum}")]
    TotalMismatch { sub_order_sum: Decimal, line_sum: Decimal },

    #[error("Order not found: {0}")]
    NotFound(Uuid),

    #[error("Sub-order not found: {0}")]
    SubOrderNotFound(Uuid),

    #[error("Cannot move order from {from} to {to}")]
    InvalidOrderTransition { from: OrderStatus, to: OrderStatus },

    #[error("Cannot move sub-order from {from} to {to}")]
    InvalidSubOrderTransition { from: SubOrderStatus, to: SubOrderStatus },

    #[error("Order status {0} is derived from sub-orders and cannot be set directly")]
    DerivedStatus(OrderStatus),

    #[error("Order is {0}; its sub-orders can no longer change")]
    OrderFrozen(OrderStatus),

    #[error("Order must be Processing before vendors fulfil it (currently {0})")]
    ParentNotProcessing(OrderStatus),

    #[error("Online order cannot be confirmed while payment is {0}")]
    PaymentNotSettled(PaymentStatus),

    #[error("Order is already paid")]
    AlreadyPaid,

    #[error("Payment is {0} and cannot be reopened")]
    PaymentClosed(PaymentStatus),

    #[error("Only paid orders can be refunded (payment is {0})")]
    NotPaid(PaymentStatus),

    #[error("Order is not paid online")]
    PaymentMethodMismatch,

    #[error("Transaction {0} does not belong to this order")]
    UnknownTransaction(String),

    #[error("Payment outcome {0} cannot be reported by a callback")]
    InvalidPaymentOutcome(PaymentStatus),

    #[error("Sub-order {sub_order_id} already has parcel {parcel_id}")]
    ShipmentAlreadyCreated { sub_order_id: Uuid, parcel_id: String },

    #[error("A shipment request for sub-order {0} is already in flight")]
    ShipmentInFlight(Uuid),

    #[error("Sub-order {sub_order_id} must be Processing to ship (currently {status})")]
    NotShippable { sub_order_id: Uuid, status: SubOrderStatus },

    #[error("Pickup orders are not handed to the courier")]
    PickupNotShippable,

    #[error("Concurrent updates kept conflicting on order {0}")]
    ConcurrencyConflict(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::EmptyItems
            | OrderError::InvalidQuantity(_)
            | OrderError::InvalidPrice { .. }
            | OrderError::AmountOutOfRange
            | OrderError::InvalidWeight(_)
            | OrderError::MissingShippingField(_)
            | OrderError::UnknownVendor(_)
            | OrderError::InactiveVendor(_)
            | OrderError::EmptyVendorGroup(_)
            | OrderError::DerivedStatus(_)
            | OrderError::InvalidPaymentOutcome(_)
            | OrderError::PickupNotShippable => ErrorKind::Validation,

            OrderError::NotFound(_) | OrderError::SubOrderNotFound(_) => ErrorKind::NotFound,

            OrderError::InvalidOrderTransition { .. }
            | OrderError::InvalidSubOrderTransition { .. }
            | OrderError::OrderFrozen(_)
            | OrderError::ParentNotProcessing(_)
            | OrderError::PaymentNotSettled(_)
            | OrderError::AlreadyPaid
            | OrderError::PaymentClosed(_)
            | OrderError::NotPaid(_)
            | OrderError::PaymentMethodMismatch
            | OrderError::UnknownTransaction(_)
            | OrderError::ShipmentAlreadyCreated { .. }
            | OrderError::ShipmentInFlight(_)
            | OrderError::NotShippable { .. }
            | OrderError::ConcurrencyConflict(_) => ErrorKind::Conflict,

            OrderError::TotalMismatch { .. } => ErrorKind::Internal,
            OrderError::Store(e) => e.kind(),
        }
    }
}
