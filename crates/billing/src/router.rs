//! Event routing
//!
//! Classifies a verified event by type and originating account and hands it
//! to the reconciler or the subscription sync. Connected-account events only
//! ever touch the connected-account invoice table.

use crate::error::BillingResult;
use crate::events::{EventKind, Origin, VerifiedEvent};
use crate::reconcile::{ReconcileOutcome, StatusReconciler};
use crate::store::{BillingStore, InvoiceStatus, NewPlatformInvoice};
use crate::subscriptions::{SubscriptionService, SubscriptionSyncOutcome};

/// What routing one event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// An invoice settlement was applied or found already settled
    Invoice(ReconcileOutcome),
    /// Platform `invoice.created`; `created` is false when the invoice was
    /// already recorded
    InvoiceRecorded { created: bool },
    Subscription(SubscriptionSyncOutcome),
    /// Recognised but nothing to do (e.g. `payment_succeeded` while unpaid)
    Skipped(&'static str),
    /// Event type not handled for this origin
    Ignored,
}

#[derive(Clone)]
pub struct EventRouter {
    store: BillingStore,
    reconciler: StatusReconciler,
    subscriptions: SubscriptionService,
}

impl EventRouter {
    pub fn new(store: BillingStore) -> Self {
        Self {
            reconciler: StatusReconciler::new(store.clone()),
            subscriptions: SubscriptionService::new(store.clone()),
            store,
        }
    }

    pub async fn route(&self, event: &VerifiedEvent) -> BillingResult<RouteOutcome> {
        let kind = event.kind();
        let origin = event.origin();

        match &origin {
            Origin::Connected(account) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %kind,
                    account = %account,
                    "Stripe Connect webhook"
                );
            }
            Origin::Platform => {
                tracing::info!(event_id = %event.id, event_type = %kind, "Stripe webhook");
            }
        }

        if kind.is_invoice_settlement() {
            return self.route_settlement(event, &origin, &kind).await;
        }

        match (&origin, &kind) {
            (Origin::Platform, EventKind::InvoiceCreated) => self.record_platform_invoice(event).await,
            (Origin::Platform, EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated) => {
                let subscription = event.subscription()?;
                Ok(RouteOutcome::Subscription(
                    self.subscriptions.sync_subscription(&subscription).await?,
                ))
            }
            (Origin::Platform, EventKind::SubscriptionDeleted) => {
                let subscription = event.subscription()?;
                Ok(RouteOutcome::Subscription(
                    self.subscriptions.cancel_subscription(&subscription).await?,
                ))
            }
            _ => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %kind,
                    connected = origin.account().is_some(),
                    "Unhandled event type"
                );
                Ok(RouteOutcome::Ignored)
            }
        }
    }

    async fn route_settlement(
        &self,
        event: &VerifiedEvent,
        origin: &Origin,
        kind: &EventKind,
    ) -> BillingResult<RouteOutcome> {
        let invoice = event.invoice()?;

        // payment_succeeded can arrive for an invoice Stripe still reports unpaid
        if *kind == EventKind::InvoicePaymentSucceeded && invoice.paid == Some(false) {
            tracing::info!(
                event_id = %event.id,
                invoice_id = %invoice.id,
                "payment_succeeded for an unpaid invoice, skipping"
            );
            return Ok(RouteOutcome::Skipped("invoice not paid"));
        }

        let outcome = self
            .reconciler
            .reconcile(origin, kind, &invoice, event.created_at())
            .await?;

        if let (Origin::Platform, ReconcileOutcome::Reconciled(InvoiceStatus::Paid)) =
            (origin, outcome)
        {
            let subscription_id = match invoice.subscription_id() {
                Some(id) => Some(id),
                None => self
                    .store
                    .platform_invoice(&invoice.id)
                    .await?
                    .and_then(|row| row.stripe_subscription_id),
            };
            if let Some(subscription_id) = subscription_id {
                self.subscriptions
                    .activate_if_trialing(&subscription_id)
                    .await?;
            }
        }

        Ok(RouteOutcome::Invoice(outcome))
    }

    async fn record_platform_invoice(&self, event: &VerifiedEvent) -> BillingResult<RouteOutcome> {
        let invoice = event.invoice()?;

        let created = self
            .store
            .insert_platform_invoice(&NewPlatformInvoice {
                stripe_invoice_id: invoice.id.clone(),
                stripe_subscription_id: invoice.subscription_id(),
                amount_cents: invoice.amount_cents(),
                currency: invoice
                    .currency
                    .as_deref()
                    .unwrap_or_default()
                    .to_uppercase(),
                hosted_invoice_url: invoice.hosted_invoice_url.clone(),
                invoice_pdf_url: invoice.document_url().map(str::to_string),
            })
            .await?;

        if created {
            tracing::info!(
                invoice_id = %invoice.id,
                amount_cents = invoice.amount_cents(),
                subscription_id = invoice.subscription_id().as_deref().unwrap_or("-"),
                "Created pending platform invoice"
            );
        } else {
            tracing::debug!(invoice_id = %invoice.id, "Platform invoice already recorded, skipping");
        }

        Ok(RouteOutcome::InvoiceRecorded { created })
    }
}
