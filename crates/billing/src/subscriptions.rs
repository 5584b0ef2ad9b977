//! Subscription status sync
//!
//! Keeps `user_subscriptions` in step with `customer.subscription.*` events
//! and activates trialing subscriptions once their invoice is paid.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::SubscriptionPayload;
use crate::store::{BillingStore, SubscriptionRecord, SubscriptionUpdate};

/// Status stored for a subscription Stripe reports without one
const UNKNOWN_STATUS: &str = "incomplete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionSyncOutcome {
    Created,
    Updated,
    /// Deletion for a subscription we never stored
    Unknown,
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: BillingStore,
}

impl SubscriptionService {
    pub fn new(store: BillingStore) -> Self {
        Self { store }
    }

    /// Update the local row for a created/updated subscription, creating it
    /// when Stripe knows a subscription we do not.
    pub async fn sync_subscription(
        &self,
        subscription: &SubscriptionPayload,
    ) -> BillingResult<SubscriptionSyncOutcome> {
        let (current_period_start, current_period_end) = subscription.period();
        let status = subscription
            .status
            .clone()
            .unwrap_or_else(|| UNKNOWN_STATUS.to_string());
        let cancel_at_period_end = subscription.cancel_at_period_end.unwrap_or(false);

        let update = SubscriptionUpdate {
            stripe_subscription_id: subscription.id.clone(),
            status: status.clone(),
            current_period_start,
            current_period_end,
            cancel_at_period_end,
            cancelled_at: subscription.canceled_at(),
        };

        if self.store.update_subscription(&update).await? {
            tracing::info!(
                subscription_id = %subscription.id,
                status = %status,
                cancel_at_period_end = cancel_at_period_end,
                "Subscription updated"
            );
            return Ok(SubscriptionSyncOutcome::Updated);
        }

        let now = OffsetDateTime::now_utc();
        self.store
            .insert_subscription(&SubscriptionRecord {
                id: Uuid::new_v4(),
                user_id: None,
                stripe_customer_id: subscription.customer.clone(),
                stripe_subscription_id: Some(subscription.id.clone()),
                status: status.clone(),
                current_period_start,
                current_period_end,
                cancel_at_period_end,
                cancelled_at: subscription.canceled_at(),
                created_at: now,
                updated_at: now,
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = subscription.customer.as_deref().unwrap_or("-"),
            status = %status,
            "Subscription created"
        );
        Ok(SubscriptionSyncOutcome::Created)
    }

    /// Mark a subscription canceled. Unknown subscriptions are only logged.
    pub async fn cancel_subscription(
        &self,
        subscription: &SubscriptionPayload,
    ) -> BillingResult<SubscriptionSyncOutcome> {
        let (current_period_start, current_period_end) = subscription.period();
        let update = SubscriptionUpdate {
            stripe_subscription_id: subscription.id.clone(),
            status: "canceled".to_string(),
            current_period_start,
            current_period_end,
            cancel_at_period_end: false,
            cancelled_at: Some(
                subscription
                    .canceled_at()
                    .unwrap_or_else(OffsetDateTime::now_utc),
            ),
        };

        if self.store.update_subscription(&update).await? {
            tracing::info!(subscription_id = %subscription.id, "Subscription cancelled");
            Ok(SubscriptionSyncOutcome::Updated)
        } else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Could not find subscription for deletion"
            );
            Ok(SubscriptionSyncOutcome::Unknown)
        }
    }

    /// `trialing` -> `active` after a successful payment
    pub async fn activate_if_trialing(&self, stripe_subscription_id: &str) -> BillingResult<bool> {
        let activated = self
            .store
            .activate_trialing_subscription(stripe_subscription_id)
            .await?;
        if activated {
            tracing::info!(
                subscription_id = %stripe_subscription_id,
                "Activated subscription after payment succeeded"
            );
        }
        Ok(activated)
    }
}
