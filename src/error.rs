use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::billing::BillingError;
use crate::entitlements::EntitlementError;
use crate::ledger::LedgerError;

/// The main error type for Tierwise
///
/// Domain errors are carried intact so callers can match on them; the
/// generic variants cover everything that has no domain of its own.
#[derive(Debug, thiserror::Error)]
pub enum TierwiseError {
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Standard error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
}

impl TierwiseError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Entitlement(err) => match err {
                EntitlementError::Unauthenticated => StatusCode::UNAUTHORIZED,
                EntitlementError::UserNotFound { .. } => StatusCode::NOT_FOUND,
                EntitlementError::QuotaExceeded { .. }
                | EntitlementError::FeatureBlocked { .. } => StatusCode::FORBIDDEN,
                EntitlementError::UnknownPlan { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Billing(err) => match err {
                BillingError::NoCustomer { .. }
                | BillingError::NoSubscription { .. }
                | BillingError::UserNotFoundForBillingEvent { .. } => StatusCode::NOT_FOUND,
                BillingError::AlreadySubscribed { .. } => StatusCode::CONFLICT,
                _ if err.is_client_error() => StatusCode::BAD_REQUEST,
                BillingError::ProviderError { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Check if this error is worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Billing(err) => err.is_retryable(),
            Self::Ledger(err) => err.is_retryable(),
            Self::ServiceUnavailable(_) => true,
            _ => false,
        }
    }

    /// Returns a safe error message suitable for client responses.
    ///
    /// Server errors (5xx) get a generic message; the details are logged
    /// server-side only.
    pub fn safe_message(&self) -> String {
        let status = self.status_code();
        if status.is_server_error() {
            match status {
                StatusCode::SERVICE_UNAVAILABLE => "Service unavailable".to_string(),
                StatusCode::BAD_GATEWAY => "Billing provider error".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for TierwiseError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                target: "tierwise::http",
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                target: "tierwise::http",
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request rejected"
            );
        }

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
        });
        (status, body).into_response()
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, TierwiseError>;

impl From<serde_json::Error> for TierwiseError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            TierwiseError::BadRequest(format!("JSON error: {}", err))
        } else {
            TierwiseError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}
