//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe is not configured: {0}")]
    NotConfigured(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload is not a valid event: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Unsupported webhook event: {0}")]
    WebhookEventNotSupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Another attempt holds the event in the ledger and has not finished
    #[error("Webhook event {0} is still being processed")]
    EventInFlight(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl BillingError {
    /// Whether Stripe should redeliver the webhook that produced this error.
    ///
    /// Only failures of our own infrastructure qualify; bad signatures and
    /// payloads will never succeed on redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_)
                | BillingError::StripeApi(_)
                | BillingError::Internal(_)
                | BillingError::EventInFlight(_)
        )
    }
}
