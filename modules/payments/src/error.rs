//! Error taxonomy of the payments core and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::gateway::GatewayError;
use crate::models::UnknownVariant;
use crate::money::MoneyError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness guard rejected the write
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The store could not be reached or refused the write for now
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<UnknownVariant> for StoreError {
    fn from(e: UnknownVariant) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

impl From<MoneyError> for StoreError {
    fn from(e: MoneyError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the payment, subscription and vault services
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("no gateway driver registered under '{0}'")]
    GatewayResolution(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("refund of {requested} exceeds refundable balance {refundable}")]
    RefundExceedsCaptured { requested: i64, refundable: i64 },

    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("declined by gateway: {0}")]
    GatewayDeclined(String),

    #[error("gateway error: {0}")]
    Gateway(GatewayError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PaymentError {
    /// Worth retrying the same operation later without changing input
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::GatewayUnavailable(_)
                | PaymentError::Store(StoreError::Database(_))
                | PaymentError::Store(StoreError::Conflict(_))
                | PaymentError::Store(StoreError::Unavailable(_))
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            PaymentError::GatewayResolution(_) => "gateway_resolution_error",
            PaymentError::InvalidAmount(_) => "invalid_amount",
            PaymentError::CurrencyMismatch { .. } => "currency_mismatch",
            PaymentError::RefundExceedsCaptured { .. } => "refund_exceeds_captured",
            PaymentError::GatewayUnavailable(_) => "gateway_unavailable",
            PaymentError::GatewayDeclined(_) => "gateway_declined",
            PaymentError::Gateway(_) => "gateway_error",
            PaymentError::InvalidState(_) => "invalid_state",
            PaymentError::NotFound(_) => "not_found",
            PaymentError::Store(_) => "database_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::GatewayResolution(_)
            | PaymentError::InvalidAmount(_)
            | PaymentError::CurrencyMismatch { .. } => StatusCode::BAD_REQUEST,
            PaymentError::RefundExceedsCaptured { .. } | PaymentError::GatewayDeclined(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PaymentError::InvalidState(_) => StatusCode::CONFLICT,
            PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
            PaymentError::GatewayUnavailable(_) | PaymentError::Gateway(_) => {
                StatusCode::BAD_GATEWAY
            }
            PaymentError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GatewayError> for PaymentError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Unavailable(msg) => PaymentError::GatewayUnavailable(msg),
            GatewayError::Declined(msg) => PaymentError::GatewayDeclined(msg),
            other => PaymentError::Gateway(other),
        }
    }
}

impl From<MoneyError> for PaymentError {
    fn from(e: MoneyError) -> Self {
        match e {
            MoneyError::CurrencyMismatch { left, right } => PaymentError::CurrencyMismatch {
                expected: left.to_string(),
                actual: right.to_string(),
            },
            other => PaymentError::InvalidAmount(other.to_string()),
        }
    }
}

/// Errors at the webhook ingestion boundary
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unknown payment provider '{0}'")]
    UnknownProvider(String),

    #[error("webhook signature verification failed")]
    InvalidSignature,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Standard error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            IngestError::UnknownProvider(_) => (StatusCode::NOT_FOUND, "unknown_provider"),
            IngestError::InvalidSignature => (StatusCode::UNPROCESSABLE_ENTITY, "signature_error"),
            IngestError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        };
        (status, Json(ErrorResponse::new(code, self.to_string()))).into_response()
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Payment request failed");
        }
        (status, Json(ErrorResponse::new(self.error_code(), self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    #[test]
    fn test_gateway_errors_map_to_core_taxonomy() {
        assert!(matches!(
            PaymentError::from(GatewayError::Unavailable("timeout".into())),
            PaymentError::GatewayUnavailable(_)
        ));
        assert!(matches!(
            PaymentError::from(GatewayError::Declined("nsf".into())),
            PaymentError::GatewayDeclined(_)
        ));
        assert!(matches!(
            PaymentError::from(GatewayError::Config("x".into())),
            PaymentError::Gateway(_)
        ));
    }

    #[test]
    fn test_money_errors_map_to_validation_errors() {
        let err = PaymentError::from(MoneyError::CurrencyMismatch {
            left: Currency::USD,
            right: Currency::EUR,
        });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "currency_mismatch");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PaymentError::RefundExceedsCaptured { requested: 2, refundable: 1 }.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            IngestError::InvalidSignature.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            IngestError::UnknownProvider("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_retryable() {
        assert!(PaymentError::GatewayUnavailable("x".into()).is_retryable());
        assert!(!PaymentError::InvalidState("x".into()).is_retryable());
        assert!(!PaymentError::Store(StoreError::NotFound("x".into())).is_retryable());
    }
}
