//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use paysync_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidSignature => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_)
            | ApiError::Database(_)
            | ApiError::Config(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidSignature => "invalid_signature",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::ServiceUnavailable => "service_unavailable",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Database(_) => "database_error",
            ApiError::Config(_) | ApiError::Internal(_) => "internal_error",
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::WebhookPayloadInvalid(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookEventNotSupported(msg) => ApiError::BadRequest(msg),
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::EventInFlight(msg) => ApiError::Conflict(msg),
            BillingError::NotConfigured(_) => ApiError::ServiceUnavailable,
            BillingError::StripeApi(msg) => ApiError::Upstream(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs
        let message = match &self {
            ApiError::Database(_) | ApiError::Config(_) | ApiError::Internal(_) => {
                tracing::error!(error = %self, "Request failed");
                "Internal server error".to_string()
            }
            ApiError::Upstream(_) => {
                tracing::error!(error = %self, "Stripe request failed");
                "Payment processor request failed".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": self.code(),
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_webhook_statuses() {
        let cases = [
            (BillingError::WebhookSignatureInvalid, StatusCode::FORBIDDEN),
            (
                BillingError::WebhookPayloadInvalid("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                BillingError::Database("down".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                BillingError::StripeApi("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (BillingError::NotFound("evt".into()), StatusCode::NOT_FOUND),
            (
                BillingError::EventInFlight("evt".into()),
                StatusCode::CONFLICT,
            ),
            (
                BillingError::NotConfigured("key".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
