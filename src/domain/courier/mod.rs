pub mod status;
pub mod client;
pub mod service;

pub use client::{CourierClient, HttpCourier, ParcelReceipt, ParcelRequest};
pub use service::{CourierPush, CourierService, CreatedShipment, ShipmentView, TrackingQuery, TrackingSync, TrackingView};
pub use status::CourierState;

use crate::domain::order::OrderError;
use crate::error::ErrorKind;
use crate::store::StoreError;
use crate::utils::{CircuitBreakerError, IsTransient};

#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("courier timed out")]
    Timeout,

    #[error("courier unavailable: {0}")]
    Unavailable(String),

    #[error("courier rejected the request: {0}")]
    Rejected(String),

    #[error("courier does not know parcel {0}")]
    UnknownParcel(String),

    #[error("unexpected courier response: {0}")]
    InvalidResponse(String),

    #[error("courier circuit is open")]
    CircuitOpen,

    #[error("sub-order {0} has no tracking code yet")]
    NotShipped(uuid::Uuid),

    #[error("no shipment matches {0}")]
    ShipmentNotFound(String),

    #[error("tracking lookup needs a tracking code or an order id")]
    MissingLookupKey,

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CourierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CourierError::Timeout => ErrorKind::External { timeout: true },
            CourierError::Unavailable(_)
            | CourierError::Rejected(_)
            | CourierError::UnknownParcel(_)
            | CourierError::InvalidResponse(_)
            | CourierError::CircuitOpen => ErrorKind::External { timeout: false },
            CourierError::NotShipped(_) => ErrorKind::Conflict,
            CourierError::MissingLookupKey => ErrorKind::Validation,
            CourierError::ShipmentNotFound(_) => ErrorKind::NotFound,
            CourierError::Order(e) => e.kind(),
            CourierError::Store(e) => e.kind(),
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CourierError::Timeout
        } else if e.is_connect() || e.is_request() {
            CourierError::Unavailable(e.to_string())
        } else {
            CourierError::InvalidResponse(e.to_string())
        }
    }
}

impl IsTransient for CourierError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            CourierError::Timeout | CourierError::Unavailable(_) | CourierError::CircuitOpen
        )
    }
}

impl From<CircuitBreakerError<CourierError>> for CourierError {
    fn from(e: CircuitBreakerError<CourierError>) -> Self {
        match e {
            CircuitBreakerError::CircuitOpen(_) => CourierError::CircuitOpen,
            CircuitBreakerError::OperationFailed(e) => e,
        }
    }
}
