//! In-memory backend
//!
//! Mirrors the conditional updates of the Postgres backend under a single
//! async mutex, so every operation is atomic with respect to the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    processing_result, ClaimResult, ConnectedInvoiceRecord, EventClaim, InvoiceKey,
    InvoiceStatus, NewConnectedInvoice, NewPlatformInvoice, PlatformInvoiceRecord,
    StatusTransition, SubscriptionRecord, SubscriptionUpdate, TransitionResult,
    WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Default)]
struct MemoryState {
    platform_invoices: Vec<PlatformInvoiceRecord>,
    connected_invoices: Vec<ConnectedInvoiceRecord>,
    subscriptions: Vec<SubscriptionRecord>,
    webhook_events: HashMap<String, WebhookEventRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Make every subsequent write fail with a database error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> BillingResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "in-memory store is rejecting writes".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn transition_invoice(
        &self,
        key: &InvoiceKey,
        transition: &StatusTransition,
    ) -> BillingResult<TransitionResult> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        let (status, paid_at, hosted, pdf, updated_at) = match key {
            InvoiceKey::Platform { stripe_invoice_id } => {
                let Some(row) = state
                    .platform_invoices
                    .iter_mut()
                    .find(|row| &row.stripe_invoice_id == stripe_invoice_id)
                else {
                    return Ok(TransitionResult::NotFound);
                };
                (
                    &mut row.status,
                    &mut row.paid_at,
                    &mut row.hosted_invoice_url,
                    &mut row.invoice_pdf_url,
                    &mut row.updated_at,
                )
            }
            InvoiceKey::Connected {
                account,
                stripe_invoice_id,
            } => {
                let Some(row) = state.connected_invoices.iter_mut().find(|row| {
                    &row.connected_account == account
                        && row.stripe_invoice_id.as_deref() == Some(stripe_invoice_id.as_str())
                }) else {
                    return Ok(TransitionResult::NotFound);
                };
                (
                    &mut row.status,
                    &mut row.paid_at,
                    &mut row.hosted_invoice_url,
                    &mut row.invoice_pdf_url,
                    &mut row.updated_at,
                )
            }
        };

        let current: InvoiceStatus = status.parse()?;
        if !current.can_transition_to(transition.to) {
            return Ok(TransitionResult::Unchanged(current));
        }

        *status = transition.to.as_str().to_string();
        if transition.paid_at.is_some() {
            *paid_at = transition.paid_at;
        }
        if hosted.is_none() {
            hosted.clone_from(&transition.hosted_invoice_url);
        }
        if pdf.is_none() {
            pdf.clone_from(&transition.invoice_pdf_url);
        }
        *updated_at = now;

        Ok(TransitionResult::Applied)
    }

    pub async fn insert_platform_invoice(&self, new: &NewPlatformInvoice) -> BillingResult<bool> {
        self.check_writable()?;
        let mut state = self.state.lock().await;

        if state
            .platform_invoices
            .iter()
            .any(|row| row.stripe_invoice_id == new.stripe_invoice_id)
        {
            return Ok(false);
        }

        let now = OffsetDateTime::now_utc();
        state.platform_invoices.push(PlatformInvoiceRecord {
            id: Uuid::new_v4(),
            stripe_invoice_id: new.stripe_invoice_id.clone(),
            stripe_subscription_id: new.stripe_subscription_id.clone(),
            amount_cents: new.amount_cents,
            currency: new.currency.clone(),
            status: InvoiceStatus::Pending.as_str().to_string(),
            paid_at: None,
            hosted_invoice_url: new.hosted_invoice_url.clone(),
            invoice_pdf_url: new.invoice_pdf_url.clone(),
            created_at: now,
            updated_at: now,
        });
        Ok(true)
    }

    pub async fn platform_invoice(&self, stripe_invoice_id: &str) -> Option<PlatformInvoiceRecord> {
        let state = self.state.lock().await;
        state
            .platform_invoices
            .iter()
            .find(|row| row.stripe_invoice_id == stripe_invoice_id)
            .cloned()
    }

    pub async fn platform_invoice_count(&self) -> usize {
        self.state.lock().await.platform_invoices.len()
    }

    pub async fn create_connected_invoice(
        &self,
        new: &NewConnectedInvoice,
    ) -> BillingResult<ConnectedInvoiceRecord> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        let record = ConnectedInvoiceRecord {
            id: Uuid::new_v4(),
            connected_account: new.connected_account.clone(),
            customer_email: new.customer_email.clone(),
            stripe_invoice_id: None,
            amount_cents: new.amount_cents,
            currency: new.currency.clone(),
            description: new.description.clone(),
            status: InvoiceStatus::Pending.as_str().to_string(),
            paid_at: None,
            hosted_invoice_url: None,
            invoice_pdf_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        state.connected_invoices.push(record.clone());
        Ok(record)
    }

    pub async fn mark_connected_issued(
        &self,
        id: Uuid,
        stripe_invoice_id: &str,
        hosted_invoice_url: Option<&str>,
        invoice_pdf_url: Option<&str>,
    ) -> BillingResult<ConnectedInvoiceRecord> {
        self.check_writable()?;
        let mut state = self.state.lock().await;

        let row = state
            .connected_invoices
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| BillingError::NotFound(format!("connected invoice {}", id)))?;

        row.stripe_invoice_id = Some(stripe_invoice_id.to_string());
        row.hosted_invoice_url = hosted_invoice_url.map(str::to_string);
        row.invoice_pdf_url = invoice_pdf_url.map(str::to_string);
        row.updated_at = OffsetDateTime::now_utc();
        Ok(row.clone())
    }

    pub async fn mark_connected_error(&self, id: Uuid, message: &str) -> BillingResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;

        if let Some(row) = state
            .connected_invoices
            .iter_mut()
            .find(|row| row.id == id && row.status == InvoiceStatus::Pending.as_str())
        {
            row.status = InvoiceStatus::Error.as_str().to_string();
            row.error_message = Some(message.to_string());
            row.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    pub async fn connected_invoice(
        &self,
        account: &str,
        stripe_invoice_id: &str,
    ) -> Option<ConnectedInvoiceRecord> {
        let state = self.state.lock().await;
        state
            .connected_invoices
            .iter()
            .find(|row| {
                row.connected_account == account
                    && row.stripe_invoice_id.as_deref() == Some(stripe_invoice_id)
            })
            .cloned()
    }

    pub async fn list_connected_invoices(
        &self,
        account: &str,
        limit: i64,
        offset: i64,
    ) -> Vec<ConnectedInvoiceRecord> {
        let state = self.state.lock().await;
        // Later pushes are newer; walk backwards for newest first
        state
            .connected_invoices
            .iter()
            .rev()
            .filter(|row| row.connected_account == account)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect()
    }

    pub async fn subscription(&self, stripe_subscription_id: &str) -> Option<SubscriptionRecord> {
        let state = self.state.lock().await;
        state
            .subscriptions
            .iter()
            .find(|row| row.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .cloned()
    }

    pub async fn insert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        if record.stripe_subscription_id.is_some()
            && state
                .subscriptions
                .iter()
                .any(|row| row.stripe_subscription_id == record.stripe_subscription_id)
        {
            return Err(BillingError::Database(
                "duplicate key value violates unique constraint on stripe_subscription_id"
                    .to_string(),
            ));
        }
        state.subscriptions.push(record.clone());
        Ok(())
    }

    pub async fn update_subscription(&self, update: &SubscriptionUpdate) -> BillingResult<bool> {
        self.check_writable()?;
        let mut state = self.state.lock().await;

        let Some(row) = state.subscriptions.iter_mut().find(|row| {
            row.stripe_subscription_id.as_deref() == Some(update.stripe_subscription_id.as_str())
        }) else {
            return Ok(false);
        };

        row.status.clone_from(&update.status);
        if update.current_period_start.is_some() {
            row.current_period_start = update.current_period_start;
        }
        if update.current_period_end.is_some() {
            row.current_period_end = update.current_period_end;
        }
        row.cancel_at_period_end = update.cancel_at_period_end;
        if update.cancelled_at.is_some() {
            row.cancelled_at = update.cancelled_at;
        }
        row.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    pub async fn activate_trialing_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<bool> {
        self.check_writable()?;
        let mut state = self.state.lock().await;

        match state.subscriptions.iter_mut().find(|row| {
            row.stripe_subscription_id.as_deref() == Some(stripe_subscription_id)
                && row.status == "trialing"
        }) {
            Some(row) => {
                row.status = "active".to_string();
                row.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn claim_event(&self, claim: &EventClaim<'_>) -> BillingResult<ClaimResult> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = state.webhook_events.get_mut(claim.stripe_event_id) {
            let stale = existing.processing_result == processing_result::PROCESSING
                && existing
                    .processing_started_at
                    .map_or(true, |started| now - started > claim.stale_after);

            if existing.processing_result == processing_result::ERROR || stale {
                existing.error_message = Some(format!(
                    "Reclaimed from {} at {}",
                    existing.processing_result, now
                ));
                existing.processing_result = processing_result::PROCESSING.to_string();
                existing.processing_started_at = Some(now);
                return Ok(ClaimResult::Claimed);
            }

            return Ok(ClaimResult::Duplicate(Some(
                existing.processing_result.clone(),
            )));
        }

        state.webhook_events.insert(
            claim.stripe_event_id.to_string(),
            WebhookEventRecord {
                id: Uuid::new_v4(),
                stripe_event_id: claim.stripe_event_id.to_string(),
                event_type: claim.event_type.to_string(),
                connected_account: claim.connected_account.map(str::to_string),
                event_timestamp: claim.event_timestamp,
                processing_result: processing_result::PROCESSING.to_string(),
                processing_started_at: Some(now),
                error_message: None,
                created_at: now,
            },
        );
        Ok(ClaimResult::Claimed)
    }

    pub async fn finish_event(
        &self,
        stripe_event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        if let Some(event) = state.webhook_events.get_mut(stripe_event_id) {
            event.processing_result = result.to_string();
            event.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    pub async fn webhook_event(&self, stripe_event_id: &str) -> Option<WebhookEventRecord> {
        self.state
            .lock()
            .await
            .webhook_events
            .get(stripe_event_id)
            .cloned()
    }

    pub async fn list_webhook_events(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Vec<WebhookEventRecord> {
        let state = self.state.lock().await;
        let mut events: Vec<WebhookEventRecord> = state
            .webhook_events
            .values()
            .filter(|event| status.map_or(true, |s| event.processing_result == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.stripe_event_id.cmp(&a.stripe_event_id))
        });
        events
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect()
    }

    pub async fn mark_replaying(&self, stripe_event_id: &str, note: &str) -> BillingResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        if let Some(event) = state.webhook_events.get_mut(stripe_event_id) {
            event.processing_result = processing_result::REPLAYING.to_string();
            event.processing_started_at = Some(OffsetDateTime::now_utc());
            event.error_message = Some(note.to_string());
        }
        Ok(())
    }

    pub async fn connected_invoice_count(&self) -> usize {
        self.state.lock().await.connected_invoices.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pending_platform(id: &str) -> NewPlatformInvoice {
        NewPlatformInvoice {
            stripe_invoice_id: id.to_string(),
            stripe_subscription_id: None,
            amount_cents: 1_000,
            currency: "usd".to_string(),
            hosted_invoice_url: None,
            invoice_pdf_url: None,
        }
    }

    fn paid() -> StatusTransition {
        StatusTransition {
            to: InvoiceStatus::Paid,
            paid_at: Some(OffsetDateTime::now_utc()),
            hosted_invoice_url: Some("https://invoice.example/in_1".to_string()),
            invoice_pdf_url: None,
        }
    }

    #[tokio::test]
    async fn transition_applies_once() {
        let store = MemoryStore::default();
        assert!(store.insert_platform_invoice(&pending_platform("in_1")).await.unwrap());
        assert!(!store.insert_platform_invoice(&pending_platform("in_1")).await.unwrap());

        let key = InvoiceKey::Platform {
            stripe_invoice_id: "in_1".to_string(),
        };
        assert_eq!(
            store.transition_invoice(&key, &paid()).await.unwrap(),
            TransitionResult::Applied
        );
        assert_eq!(
            store.transition_invoice(&key, &paid()).await.unwrap(),
            TransitionResult::Unchanged(InvoiceStatus::Paid)
        );

        let row = store.platform_invoice("in_1").await.unwrap();
        assert_eq!(row.hosted_invoice_url.as_deref(), Some("https://invoice.example/in_1"));
    }

    #[tokio::test]
    async fn connected_transition_is_scoped_to_account() {
        let store = MemoryStore::default();
        let created = store
            .create_connected_invoice(&NewConnectedInvoice {
                connected_account: "acct_a".to_string(),
                customer_email: "a@example.com".to_string(),
                amount_cents: 500,
                currency: "usd".to_string(),
                description: None,
            })
            .await
            .unwrap();
        store
            .mark_connected_issued(created.id, "in_9", None, None)
            .await
            .unwrap();

        let wrong_account = InvoiceKey::Connected {
            account: "acct_b".to_string(),
            stripe_invoice_id: "in_9".to_string(),
        };
        assert_eq!(
            store.transition_invoice(&wrong_account, &paid()).await.unwrap(),
            TransitionResult::NotFound
        );
        assert_eq!(
            store.connected_invoice("acct_a", "in_9").await.unwrap().status,
            "pending"
        );
    }

    #[tokio::test]
    async fn claim_reclaims_errored_events_only() {
        let store = MemoryStore::default();
        let claim = EventClaim {
            stripe_event_id: "evt_1",
            event_type: "invoice.paid",
            connected_account: None,
            event_timestamp: OffsetDateTime::now_utc(),
            stale_after: Duration::from_secs(1800),
        };

        assert_eq!(store.claim_event(&claim).await.unwrap(), ClaimResult::Claimed);
        assert_eq!(
            store.claim_event(&claim).await.unwrap(),
            ClaimResult::Duplicate(Some("processing".to_string()))
        );

        store
            .finish_event("evt_1", processing_result::ERROR, Some("boom"))
            .await
            .unwrap();
        assert_eq!(store.claim_event(&claim).await.unwrap(), ClaimResult::Claimed);

        store
            .finish_event("evt_1", processing_result::SUCCESS, None)
            .await
            .unwrap();
        assert_eq!(
            store.claim_event(&claim).await.unwrap(),
            ClaimResult::Duplicate(Some("success".to_string()))
        );
    }

    #[tokio::test]
    async fn failing_writes_surface_as_database_errors() {
        let store = MemoryStore::default();
        store.set_fail_writes(true);
        assert!(matches!(
            store.insert_platform_invoice(&pending_platform("in_1")).await,
            Err(BillingError::Database(_))
        ));
        store.set_fail_writes(false);
        assert!(store.insert_platform_invoice(&pending_platform("in_1")).await.unwrap());
    }
}
