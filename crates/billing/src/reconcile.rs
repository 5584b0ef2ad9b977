//! Invoice status reconciliation
//!
//! Applies the status implied by a settlement event to the matching local
//! invoice. The write only succeeds while the invoice is still `pending`, so
//! duplicate and concurrent deliveries settle it exactly once.

use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, InvoicePayload, Origin};
use crate::store::{
    BillingStore, InvoiceKey, InvoiceStatus, StatusTransition, TransitionResult,
};

/// What reconciling one event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Reconciled(InvoiceStatus),
    /// Invoice already left `pending`; nothing written
    AlreadySettled(InvoiceStatus),
    NotFound,
}

/// Local status a settlement event moves an invoice to
pub fn target_status(kind: &EventKind) -> Option<InvoiceStatus> {
    match kind {
        EventKind::InvoicePaid | EventKind::InvoicePaymentSucceeded => Some(InvoiceStatus::Paid),
        EventKind::InvoicePaymentFailed => Some(InvoiceStatus::PaymentFailed),
        EventKind::InvoiceVoided => Some(InvoiceStatus::Void),
        _ => None,
    }
}

#[derive(Clone)]
pub struct StatusReconciler {
    store: BillingStore,
}

impl StatusReconciler {
    pub fn new(store: BillingStore) -> Self {
        Self { store }
    }

    /// Reconcile one invoice against the table selected by `origin`.
    ///
    /// `event_time` becomes `paid_at` on the move to `paid`; when Stripe sent
    /// no creation time the processing time is used instead.
    pub async fn reconcile(
        &self,
        origin: &Origin,
        kind: &EventKind,
        invoice: &InvoicePayload,
        event_time: Option<OffsetDateTime>,
    ) -> BillingResult<ReconcileOutcome> {
        let to = target_status(kind).ok_or_else(|| {
            BillingError::WebhookEventNotSupported(format!("{} is not an invoice settlement", kind))
        })?;

        let key = match origin {
            Origin::Platform => InvoiceKey::Platform {
                stripe_invoice_id: invoice.id.clone(),
            },
            Origin::Connected(account) => InvoiceKey::Connected {
                account: account.clone(),
                stripe_invoice_id: invoice.id.clone(),
            },
        };

        let paid_at = match to {
            InvoiceStatus::Paid => Some(event_time.unwrap_or_else(OffsetDateTime::now_utc)),
            _ => None,
        };

        let transition = StatusTransition {
            to,
            paid_at,
            hosted_invoice_url: invoice.hosted_invoice_url.clone(),
            invoice_pdf_url: invoice.invoice_pdf.clone(),
        };

        let result = self
            .store
            .transition_invoice(&key, &transition)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    invoice_id = key.stripe_invoice_id(),
                    table = key.table(),
                    error = %e,
                    "Failed to update invoice status"
                );
            })?;

        let outcome = match result {
            TransitionResult::Applied => {
                tracing::info!(
                    invoice_id = key.stripe_invoice_id(),
                    table = key.table(),
                    account = origin.account().unwrap_or("-"),
                    status = %to,
                    "Invoice status reconciled"
                );
                ReconcileOutcome::Reconciled(to)
            }
            TransitionResult::Unchanged(current) => {
                tracing::info!(
                    invoice_id = key.stripe_invoice_id(),
                    table = key.table(),
                    current = %current,
                    requested = %to,
                    "Invoice already settled, skipping"
                );
                ReconcileOutcome::AlreadySettled(current)
            }
            TransitionResult::NotFound => {
                tracing::warn!(
                    invoice_id = key.stripe_invoice_id(),
                    table = key.table(),
                    account = origin.account().unwrap_or("-"),
                    "No local invoice for Stripe invoice"
                );
                ReconcileOutcome::NotFound
            }
        };

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewPlatformInvoice;

    fn invoice(id: &str) -> InvoicePayload {
        InvoicePayload {
            id: id.to_string(),
            ..Default::default()
        }
    }

    async fn store_with_pending(id: &str) -> BillingStore {
        let store = BillingStore::new_in_memory();
        store
            .insert_platform_invoice(&NewPlatformInvoice {
                stripe_invoice_id: id.to_string(),
                stripe_subscription_id: None,
                amount_cents: 2_500,
                currency: "usd".to_string(),
                hosted_invoice_url: None,
                invoice_pdf_url: None,
            })
            .await
            .unwrap();
        store
    }

    #[test]
    fn only_settlement_kinds_have_targets() {
        assert_eq!(target_status(&EventKind::InvoicePaid), Some(InvoiceStatus::Paid));
        assert_eq!(
            target_status(&EventKind::InvoicePaymentSucceeded),
            Some(InvoiceStatus::Paid)
        );
        assert_eq!(target_status(&EventKind::InvoiceCreated), None);
        assert_eq!(target_status(&EventKind::Other("x".into())), None);
    }

    #[tokio::test]
    async fn paid_at_uses_event_time() {
        let store = store_with_pending("in_1").await;
        let reconciler = StatusReconciler::new(store.clone());
        let event_time = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();

        let outcome = reconciler
            .reconcile(&Origin::Platform, &EventKind::InvoicePaid, &invoice("in_1"), Some(event_time))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Reconciled(InvoiceStatus::Paid));

        let row = store.platform_invoice("in_1").await.unwrap().unwrap();
        assert_eq!(row.paid_at, Some(event_time));
    }

    #[tokio::test]
    async fn paid_at_falls_back_to_now() {
        let store = store_with_pending("in_1").await;
        let reconciler = StatusReconciler::new(store.clone());
        let before = OffsetDateTime::now_utc();

        reconciler
            .reconcile(&Origin::Platform, &EventKind::InvoicePaymentSucceeded, &invoice("in_1"), None)
            .await
            .unwrap();

        let paid_at = store.platform_invoice("in_1").await.unwrap().unwrap().paid_at.unwrap();
        assert!(paid_at >= before);
    }

    #[tokio::test]
    async fn failed_payment_is_terminal() {
        let store = store_with_pending("in_1").await;
        let reconciler = StatusReconciler::new(store.clone());

        let first = reconciler
            .reconcile(&Origin::Platform, &EventKind::InvoicePaymentFailed, &invoice("in_1"), None)
            .await
            .unwrap();
        assert_eq!(first, ReconcileOutcome::Reconciled(InvoiceStatus::PaymentFailed));

        let second = reconciler
            .reconcile(&Origin::Platform, &EventKind::InvoicePaid, &invoice("in_1"), None)
            .await
            .unwrap();
        assert_eq!(second, ReconcileOutcome::AlreadySettled(InvoiceStatus::PaymentFailed));

        let row = store.platform_invoice("in_1").await.unwrap().unwrap();
        assert_eq!(row.status, "payment_failed");
        assert!(row.paid_at.is_none());
    }

    #[tokio::test]
    async fn non_settlement_kind_is_rejected() {
        let reconciler = StatusReconciler::new(BillingStore::new_in_memory());
        let result = reconciler
            .reconcile(&Origin::Platform, &EventKind::InvoiceCreated, &invoice("in_1"), None)
            .await;
        assert!(matches!(result, Err(BillingError::WebhookEventNotSupported(_))));
    }
}
