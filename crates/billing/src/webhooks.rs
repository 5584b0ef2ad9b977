//! Stripe webhook handling
//!
//! Verifies deliveries, claims each event in the `stripe_webhook_events`
//! ledger, routes it, and records the result. Also lists ledger entries and
//! replays events fetched back from Stripe.

use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::VerifiedEvent;
use crate::router::{EventRouter, RouteOutcome};
use crate::signature::SignatureVerifier;
use crate::store::{processing_result, BillingStore, ClaimResult, EventClaim, WebhookEventRecord};

/// A claim stuck in `processing` longer than this may be taken over
const PROCESSING_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// What handling one delivery did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed(RouteOutcome),
    /// Already processed or in flight elsewhere; carries the ledger result
    Duplicate(Option<String>),
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    store: BillingStore,
    verifier: SignatureVerifier,
    router: EventRouter,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, store: BillingStore) -> Self {
        let config = stripe.config();
        let verifier = SignatureVerifier::new(config.webhook_secrets(), config.webhook_tolerance);
        tracing::debug!(
            secrets = ?verifier.secret_names(),
            tolerance_secs = config.webhook_tolerance.as_secs(),
            "Webhook verifier configured"
        );

        Self {
            router: EventRouter::new(store.clone()),
            stripe,
            store,
            verifier,
        }
    }

    /// Verify the `Stripe-Signature` header and parse the event
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<VerifiedEvent> {
        tracing::debug!(
            payload_len = payload.len(),
            signature_len = signature.len(),
            "Verifying webhook delivery"
        );
        self.verifier.verify(payload, signature)
    }

    /// Handle a verified event exactly once.
    ///
    /// The ledger insert hands processing rights to one caller. Redeliveries
    /// of an event whose last attempt failed are processed again; those of
    /// an event still in flight get a retryable `EventInFlight`.
    pub async fn handle_event(&self, event: &VerifiedEvent) -> BillingResult<WebhookOutcome> {
        let origin = event.origin();
        let claim = EventClaim {
            stripe_event_id: &event.id,
            event_type: &event.event_type,
            connected_account: origin.account(),
            event_timestamp: event.created_at().unwrap_or_else(OffsetDateTime::now_utc),
            stale_after: PROCESSING_TIMEOUT,
        };

        let claimed = self.store.claim_event(&claim).await.inspect_err(|e| {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
        })?;

        if let ClaimResult::Duplicate(existing) = claimed {
            // Unfinished attempts may still fail; Stripe must redeliver
            if matches!(
                existing.as_deref(),
                None | Some(processing_result::PROCESSING) | Some(processing_result::REPLAYING)
            ) {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    status = existing.as_deref().unwrap_or("unknown"),
                    "Webhook event still in flight, asking for redelivery"
                );
                return Err(BillingError::EventInFlight(event.id.clone()));
            }

            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                status = existing.as_deref().unwrap_or("unknown"),
                "Duplicate webhook event"
            );
            return Ok(WebhookOutcome::Duplicate(existing));
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let result = self.router.route(event).await;
        self.record_result(&event.id, &event.event_type, &result).await;

        result.map(WebhookOutcome::Processed)
    }

    /// Write the processing result, retrying once
    async fn record_result(
        &self,
        event_id: &str,
        event_type: &str,
        result: &BillingResult<RouteOutcome>,
    ) {
        let (status, error_message) = match result {
            Ok(_) => (processing_result::SUCCESS, None),
            Err(e) => (processing_result::ERROR, Some(e.to_string())),
        };

        let Err(first) = self
            .store
            .finish_event(event_id, status, error_message.as_deref())
            .await
        else {
            return;
        };

        tracing::warn!(
            event_id = %event_id,
            error = %first,
            "First attempt to update webhook event failed, retrying"
        );

        if let Err(retry) = self
            .store
            .finish_event(event_id, status, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                processing_result = %status,
                error_message = ?error_message,
                first_error = %first,
                retry_error = %retry,
                "Failed to update webhook ledger after retry; event may appear stuck in processing"
            );
        }
    }

    /// List ledger entries, optionally filtered by processing result
    pub async fn list_webhooks(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store
            .list_webhook_events(status_filter, limit.clamp(1, 500), offset.max(0))
            .await
    }

    /// Replay a recorded event by fetching it from Stripe and processing it
    /// again. Connect events are fetched on behalf of their account.
    pub async fn replay_webhook(&self, stripe_event_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(stripe_event_id = %stripe_event_id, "Attempting to replay webhook event");

        let existing = self.store.webhook_event(stripe_event_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!(
                "Webhook event {} not found in database",
                stripe_event_id
            ))
        })?;

        let event = self.fetch_event(&existing).await?;

        let note = format!(
            "Replay initiated. Previous status: {}. Previous error: {}",
            existing.processing_result,
            existing.error_message.as_deref().unwrap_or("none")
        );
        self.store.mark_replaying(stripe_event_id, &note).await?;

        let result = self.router.route(&event).await;
        let (new_status, new_error) = match &result {
            Ok(_) => (processing_result::SUCCESS.to_string(), None),
            Err(e) => (processing_result::ERROR.to_string(), Some(e.to_string())),
        };
        self.store
            .finish_event(stripe_event_id, &new_status, new_error.as_deref())
            .await?;

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %existing.processing_result,
            new_status = %new_status,
            success = result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id: existing.id,
            stripe_event_id: stripe_event_id.to_string(),
            event_type: event.event_type,
            previous_status: existing.processing_result,
            previous_error: existing.error_message,
            new_status,
            new_error,
            success: result.is_ok(),
        })
    }

    async fn fetch_event(&self, record: &WebhookEventRecord) -> BillingResult<VerifiedEvent> {
        let event_id = record
            .stripe_event_id
            .parse::<stripe::EventId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid event ID: {}", e)))?;

        let client = match record.connected_account.as_deref() {
            Some(account) => self.stripe.for_account(account)?,
            None => self.stripe.inner()?.clone(),
        };

        // Read into our own envelope; the typed stripe::Event lags newer API
        // versions and would reject some invoice payloads.
        client
            .get::<VerifiedEvent>(&format!("/events/{}", event_id))
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to fetch event from Stripe: {}", e)))
    }
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}
