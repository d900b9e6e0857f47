use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::domain::balance::ReconciliationError;
use crate::domain::courier::CourierError;
use crate::domain::order::OrderError;
use crate::domain::payment::PaymentError;
use crate::store::StoreError;

/// Coarse classification every domain error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    /// A dependency failed or did not answer; `timeout` distinguishes the two.
    External { timeout: bool },
    Internal,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::External { timeout: true } => "upstream_timeout",
            ErrorKind::External { timeout: false } => "upstream_unavailable",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::External { timeout: true } => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::External { timeout: false } => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error returned by the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Courier(#[from] CourierError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unauthorized")]
    Unauthorized,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Order(e) => e.kind(),
            AppError::Payment(e) => e.kind(),
            AppError::Courier(e) => e.kind(),
            AppError::Reconciliation(e) => e.kind(),
            AppError::Store(e) => e.kind(),
            AppError::Unauthorized => ErrorKind::Validation,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            other => other.kind().status_code(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        let kind = self.kind();
        // Internal details stay in the logs
        let message = match kind {
            ErrorKind::Internal => {
                tracing::error!(error = %self, "Request failed with internal error");
                "internal error".to_string()
            }
            _ => self.to_string(),
        };
        let label = match self {
            AppError::Unauthorized => "unauthorized",
            _ => kind.label(),
        };

        HttpResponse::build(self.status_code()).json(ErrorBody { error: label, message })
    }
}
