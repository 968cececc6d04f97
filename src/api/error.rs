//! Mapping of marketplace errors onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::types::ErrorResponse;
use crate::market::MarketError;

/// Error returned by a handler: status plus `{error, message}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn unauthenticated() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthenticated",
            message: "missing x-user-id header".to_string(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "unauthorized",
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation_error",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_of(err: &MarketError) -> StatusCode {
    match err {
        MarketError::Validation(_) => StatusCode::BAD_REQUEST,
        MarketError::Unauthorized(_) => StatusCode::FORBIDDEN,
        MarketError::NotFound { .. } => StatusCode::NOT_FOUND,
        MarketError::InvalidStateTransition(_)
        | MarketError::AlreadyProcessed(_)
        | MarketError::Conflict(_) => StatusCode::CONFLICT,
        MarketError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        MarketError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        MarketError::ExternalVerifierTimeout(_)
        | MarketError::Invariant(_)
        | MarketError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        let status = status_of(&err);
        if status.is_server_error() {
            tracing::error!(code = err.code(), "Request failed: {}", err);
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
