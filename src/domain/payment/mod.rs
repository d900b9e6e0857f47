pub mod signature;
pub mod callback;
pub mod gateway;
pub mod service;

pub use callback::{new_transaction_id, validate_callback, CallbackForm, CallbackVerdict, GatewayVerdict, VerifiedCallback};
pub use gateway::{GatewayError, GatewayTransaction, HttpGateway, PaymentGateway, SessionRequest};
pub use service::{InitiatedPayment, IpnOutcome, PaymentRedirect, PaymentService, PaymentUrls};
pub use signature::{SignatureError, SignatureVerifier};

use crate::domain::order::OrderError;
use crate::error::ErrorKind;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Payment state is inconsistent: {0}")]
    Internal(String),
}

impl PaymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PaymentError::Order(e) => e.kind(),
            PaymentError::Gateway(e) => e.kind(),
            PaymentError::Store(e) => e.kind(),
            PaymentError::Internal(_) => ErrorKind::Internal,
        }
    }
}
