//! Stripe webhook endpoint

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use paysync_billing::WebhookOutcome;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Handle a Stripe webhook delivery.
///
/// Acknowledges with 200 anything that was verified and either processed or
/// deliberately skipped. A failure of our own storage answers 500 so Stripe
/// redelivers.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing_service().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::InvalidSignature
        })?;

    let event = billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Stripe webhook verification failed");
        ApiError::from(e)
    })?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        connected = event.origin().account().is_some(),
        livemode = event.livemode,
        "Stripe webhook event verified"
    );

    match billing.webhooks.handle_event(&event).await {
        Ok(WebhookOutcome::Processed(outcome)) => {
            tracing::info!(event_id = %event.id, outcome = ?outcome, "Stripe webhook processed");
        }
        Ok(WebhookOutcome::Duplicate(_)) => {}
        Err(e) => {
            tracing::error!(event_id = %event.id, error = %e, "Webhook handling error");
            return Err(e.into());
        }
    }

    Ok(StatusCode::OK)
}
