// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Webhook Reconciliation
//!
//! Drives whole deliveries (signed body -> verify -> ledger -> route ->
//! store) against the in-memory store:
//! - Secret fallback and rejection
//! - Settlement of platform and connected invoices
//! - Unknown invoices and unknown event types
//! - Duplicate, concurrent and failed deliveries

#[cfg(test)]
mod webhook_flow_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use time::OffsetDateTime;
    use tokio::sync::Barrier;

    use crate::client::{StripeClient, StripeConfig};
    use crate::error::BillingError;
    use crate::reconcile::ReconcileOutcome;
    use crate::router::RouteOutcome;
    use crate::signature::sign_header;
    use crate::store::{
        processing_result, BillingStore, ClaimResult, EventClaim, InvoiceStatus,
        NewConnectedInvoice, NewPlatformInvoice,
    };
    use crate::webhooks::{WebhookHandler, WebhookOutcome};

    const PLATFORM_SECRET: &str = "whsec_platform_edge";
    const CONNECT_SECRET: &str = "whsec_connect_edge";
    const EVENT_CREATED: i64 = 1_700_000_000;

    fn handler(store: BillingStore, connect_secret: Option<&str>) -> WebhookHandler {
        let config = StripeConfig {
            secret_key: None,
            webhook_secret: PLATFORM_SECRET.to_string(),
            connect_webhook_secret: connect_secret.map(str::to_string),
            webhook_tolerance: Duration::from_secs(300),
            days_until_due: 7,
        };
        WebhookHandler::new(StripeClient::new(config), store)
    }

    fn body(event_id: &str, event_type: &str, account: Option<&str>, invoice_id: &str) -> Vec<u8> {
        let mut event = serde_json::json!({
            "id": event_id,
            "object": "event",
            "type": event_type,
            "created": EVENT_CREATED,
            "livemode": false,
            "data": { "object": {
                "id": invoice_id,
                "object": "invoice",
                "status": "paid",
                "paid": true,
                "hosted_invoice_url": format!("https://invoice.stripe.com/i/{}", invoice_id)
            } }
        });
        if let Some(account) = account {
            event["account"] = serde_json::json!(account);
        }
        event.to_string().into_bytes()
    }

    fn signed(secret: &str, payload: &[u8]) -> String {
        sign_header(secret, OffsetDateTime::now_utc().unix_timestamp(), payload).unwrap()
    }

    async fn deliver(
        handler: &WebhookHandler,
        secret: &str,
        payload: &[u8],
    ) -> Result<WebhookOutcome, BillingError> {
        let event = handler.verify_event(payload, &signed(secret, payload))?;
        handler.handle_event(&event).await
    }

    async fn pending_platform(store: &BillingStore, invoice_id: &str) {
        store
            .insert_platform_invoice(&NewPlatformInvoice {
                stripe_invoice_id: invoice_id.to_string(),
                stripe_subscription_id: None,
                amount_cents: 9_900,
                currency: "USD".to_string(),
                hosted_invoice_url: None,
                invoice_pdf_url: None,
            })
            .await
            .unwrap();
    }

    async fn pending_connected(store: &BillingStore, account: &str, invoice_id: &str) {
        let record = store
            .create_connected_invoice(&NewConnectedInvoice {
                connected_account: account.to_string(),
                customer_email: "payer@example.com".to_string(),
                amount_cents: 12_000,
                currency: "USD".to_string(),
                description: Some("Design work".to_string()),
            })
            .await
            .unwrap();
        store
            .mark_connected_issued(record.id, invoice_id, None, None)
            .await
            .unwrap();
    }

    // =========================================================================
    // A delivery signed with the Connect secret verifies after the platform
    // secret fails
    // =========================================================================
    #[tokio::test]
    async fn test_connect_secret_fallback_verifies() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), Some(CONNECT_SECRET));
        pending_connected(&store, "acct_1", "in_c1").await;

        let payload = body("evt_1", "invoice.paid", Some("acct_1"), "in_c1");
        let outcome = deliver(&handler, CONNECT_SECRET, &payload).await.unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Processed(RouteOutcome::Invoice(ReconcileOutcome::Reconciled(
                InvoiceStatus::Paid
            )))
        );
    }

    // =========================================================================
    // Without a Connect secret configured, a Connect-signed delivery fails
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_secret_rejected_without_side_effects() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), None);
        pending_connected(&store, "acct_1", "in_c1").await;

        let payload = body("evt_1", "invoice.paid", Some("acct_1"), "in_c1");
        let result = deliver(&handler, CONNECT_SECRET, &payload).await;

        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
        let row = store.connected_invoice("acct_1", "in_c1").await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert!(store.webhook_event("evt_1").await.unwrap().is_none());
    }

    // =========================================================================
    // Connected invoice.paid on a pending connected invoice
    // =========================================================================
    #[tokio::test]
    async fn test_connected_invoice_paid_sets_paid_at() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), Some(CONNECT_SECRET));
        pending_connected(&store, "acct_1", "in_c1").await;

        let payload = body("evt_1", "invoice.paid", Some("acct_1"), "in_c1");
        deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap();

        let row = store.connected_invoice("acct_1", "in_c1").await.unwrap().unwrap();
        assert_eq!(row.status, "paid");
        assert_eq!(row.paid_at.unwrap().unix_timestamp(), EVENT_CREATED);
        assert_eq!(
            row.hosted_invoice_url.as_deref(),
            Some("https://invoice.stripe.com/i/in_c1")
        );
    }

    // =========================================================================
    // Platform invoice.payment_failed leaves paid_at unset
    // =========================================================================
    #[tokio::test]
    async fn test_platform_payment_failed() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), None);
        pending_platform(&store, "in_p1").await;

        let payload = body("evt_1", "invoice.payment_failed", None, "in_p1");
        deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap();

        let row = store.platform_invoice("in_p1").await.unwrap().unwrap();
        assert_eq!(row.status, "payment_failed");
        assert!(row.paid_at.is_none());
    }

    // =========================================================================
    // Unknown invoice id is acknowledged and nothing is created
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_invoice_acknowledged() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), Some(CONNECT_SECRET));

        for (event_id, account) in [("evt_p", None), ("evt_c", Some("acct_1"))] {
            let payload = body(event_id, "invoice.paid", account, "in_missing");
            let outcome = deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap();
            assert_eq!(
                outcome,
                WebhookOutcome::Processed(RouteOutcome::Invoice(ReconcileOutcome::NotFound))
            );
        }

        let memory = store.as_memory().unwrap();
        assert_eq!(memory.platform_invoice_count().await, 0);
        assert_eq!(memory.connected_invoice_count().await, 0);
    }

    // =========================================================================
    // Unknown event types are acknowledged as no-ops
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_event_type_ignored() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), None);
        pending_platform(&store, "in_p1").await;

        let payload = body("evt_1", "charge.refunded", None, "in_p1");
        let outcome = deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed(RouteOutcome::Ignored));
        assert_eq!(
            store.platform_invoice("in_p1").await.unwrap().unwrap().status,
            "pending"
        );
    }

    // =========================================================================
    // Replaying invoice.paid equals processing it once
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), None);
        pending_platform(&store, "in_p1").await;

        let payload = body("evt_1", "invoice.paid", None, "in_p1");
        deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap();
        let after_first = store.platform_invoice("in_p1").await.unwrap().unwrap();

        let second = deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap();
        assert_eq!(
            second,
            WebhookOutcome::Duplicate(Some(processing_result::SUCCESS.to_string()))
        );

        // Same invoice, new event id: the status guard still holds
        let other = body("evt_2", "invoice.payment_succeeded", None, "in_p1");
        let third = deliver(&handler, PLATFORM_SECRET, &other).await.unwrap();
        assert_eq!(
            third,
            WebhookOutcome::Processed(RouteOutcome::Invoice(ReconcileOutcome::AlreadySettled(
                InvoiceStatus::Paid
            )))
        );

        let after_all = store.platform_invoice("in_p1").await.unwrap().unwrap();
        assert_eq!(after_all.status, "paid");
        assert_eq!(after_all.paid_at, after_first.paid_at);
    }

    // =========================================================================
    // Concurrent deliveries of one event: exactly one processes it, the rest
    // are acknowledged duplicates or told to come back
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_deliveries_process_once() {
        let store = BillingStore::new_in_memory();
        let handler = Arc::new(handler(store.clone(), None));
        pending_platform(&store, "in_p1").await;

        let payload = Arc::new(body("evt_1", "invoice.paid", None, "in_p1"));
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for _ in 0..10 {
            let handler = Arc::clone(&handler);
            let payload = Arc::clone(&payload);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                deliver(&handler, PLATFORM_SECRET, &payload).await
            }));
        }

        let mut processed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(WebhookOutcome::Processed(_)) => processed += 1,
                Ok(WebhookOutcome::Duplicate(existing)) => {
                    assert_eq!(existing.as_deref(), Some(processing_result::SUCCESS));
                }
                Err(e) => {
                    assert!(matches!(e, BillingError::EventInFlight(_)), "unexpected: {e}");
                    assert!(e.is_retryable());
                }
            }
        }

        assert_eq!(processed, 1, "Exactly one delivery should process the event");
        assert_eq!(
            store.platform_invoice("in_p1").await.unwrap().unwrap().status,
            "paid"
        );
    }

    // =========================================================================
    // Distinct events settling the same invoice at once: the pending-only
    // update lets exactly one of them win
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_settlements_of_one_invoice_apply_once() {
        let store = BillingStore::new_in_memory();
        let handler = Arc::new(handler(store.clone(), None));
        pending_platform(&store, "in_p1").await;

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for i in 0..10i64 {
            let event_type = if i % 2 == 0 {
                "invoice.paid"
            } else {
                "invoice.payment_succeeded"
            };
            let mut event: serde_json::Value =
                serde_json::from_slice(&body(&format!("evt_c{}", i), event_type, None, "in_p1"))
                    .unwrap();
            event["created"] = serde_json::json!(EVENT_CREATED + i);
            let payload = event.to_string().into_bytes();

            let handler = Arc::clone(&handler);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                (i, deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap())
            }));
        }

        let mut winners = vec![];
        for handle in handles {
            let (i, outcome) = handle.await.unwrap();
            match outcome {
                WebhookOutcome::Processed(RouteOutcome::Invoice(
                    ReconcileOutcome::Reconciled(InvoiceStatus::Paid),
                )) => winners.push(i),
                WebhookOutcome::Processed(RouteOutcome::Invoice(
                    ReconcileOutcome::AlreadySettled(InvoiceStatus::Paid),
                )) => {}
                other => panic!("unexpected outcome for evt_c{}: {:?}", i, other),
            }
        }

        assert_eq!(winners.len(), 1, "Exactly one settlement should apply");

        // paid_at comes from the single event that won
        let invoice = store.platform_invoice("in_p1").await.unwrap().unwrap();
        assert_eq!(invoice.status, "paid");
        assert_eq!(
            invoice.paid_at,
            Some(OffsetDateTime::from_unix_timestamp(EVENT_CREATED + winners[0]).unwrap())
        );
    }

    // =========================================================================
    // An event held by an unfinished attempt is not acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_of_event_in_flight_asks_for_retry() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), None);
        pending_platform(&store, "in_p1").await;

        // Earlier attempt claimed the event and never recorded a result
        let claimed = store
            .claim_event(&EventClaim {
                stripe_event_id: "evt_1",
                event_type: "invoice.paid",
                connected_account: None,
                event_timestamp: OffsetDateTime::now_utc(),
                stale_after: Duration::from_secs(30 * 60),
            })
            .await
            .unwrap();
        assert_eq!(claimed, ClaimResult::Claimed);

        let payload = body("evt_1", "invoice.paid", None, "in_p1");
        let err = deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap_err();
        assert!(matches!(err, BillingError::EventInFlight(_)));
        assert!(err.is_retryable());
        assert_eq!(
            store.platform_invoice("in_p1").await.unwrap().unwrap().status,
            "pending"
        );

        // Once the stuck attempt is recorded as failed, the redelivery applies
        store
            .finish_event("evt_1", processing_result::ERROR, Some("connection reset"))
            .await
            .unwrap();
        let outcome = deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Processed(RouteOutcome::Invoice(ReconcileOutcome::Reconciled(
                InvoiceStatus::Paid
            )))
        );
    }

    // =========================================================================
    // Database failure surfaces as a retryable error; the redelivery succeeds
    // =========================================================================
    #[tokio::test]
    async fn test_database_failure_is_retryable() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), None);
        pending_platform(&store, "in_p1").await;
        let memory = store.as_memory().unwrap().clone();

        let payload = body("evt_1", "invoice.paid", None, "in_p1");
        memory.set_fail_writes(true);
        let err = deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
        assert!(err.is_retryable());

        memory.set_fail_writes(false);
        deliver(&handler, PLATFORM_SECRET, &payload).await.unwrap();
        assert_eq!(
            store.platform_invoice("in_p1").await.unwrap().unwrap().status,
            "paid"
        );
    }

    // =========================================================================
    // An event whose processing failed is processed again on redelivery
    // =========================================================================
    #[tokio::test]
    async fn test_failed_event_is_reclaimed() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), None);

        // Signed and well formed, but the invoice object has no id
        let payload = serde_json::json!({
            "id": "evt_bad",
            "type": "invoice.paid",
            "created": EVENT_CREATED,
            "data": { "object": { "object": "invoice" } }
        })
        .to_string()
        .into_bytes();

        let first = deliver(&handler, PLATFORM_SECRET, &payload).await;
        assert!(matches!(first, Err(BillingError::WebhookPayloadInvalid(_))));

        let record = store.webhook_event("evt_bad").await.unwrap().unwrap();
        assert_eq!(record.processing_result, processing_result::ERROR);
        assert!(record.error_message.is_some());

        // Not short-circuited as a duplicate
        let second = deliver(&handler, PLATFORM_SECRET, &payload).await;
        assert!(matches!(second, Err(BillingError::WebhookPayloadInvalid(_))));
    }

    // =========================================================================
    // Ledger listing filters by result; replay needs a recorded event
    // =========================================================================
    #[tokio::test]
    async fn test_ledger_listing_and_replay_preconditions() {
        let store = BillingStore::new_in_memory();
        let handler = handler(store.clone(), None);
        pending_platform(&store, "in_p1").await;

        deliver(&handler, PLATFORM_SECRET, &body("evt_1", "invoice.paid", None, "in_p1"))
            .await
            .unwrap();
        deliver(&handler, PLATFORM_SECRET, &body("evt_2", "charge.refunded", None, "in_p1"))
            .await
            .unwrap();

        let all = handler.list_webhooks(None, 50, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        let failed = handler
            .list_webhooks(Some(processing_result::ERROR), 50, 0)
            .await
            .unwrap();
        assert!(failed.is_empty());

        assert!(matches!(
            handler.replay_webhook("evt_missing").await,
            Err(BillingError::NotFound(_))
        ));
        // Recorded, but no API key to fetch it with
        assert!(matches!(
            handler.replay_webhook("evt_1").await,
            Err(BillingError::NotConfigured(_))
        ));
    }
}
