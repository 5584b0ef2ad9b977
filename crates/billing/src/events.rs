//! Verified Stripe event envelope and typed payload views
//!
//! Only the fields reconciliation needs are modelled; everything else in
//! `data.object` stays as raw JSON so new Stripe API versions don't break
//! parsing.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Event types this service acts on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    InvoiceCreated,
    InvoicePaid,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    InvoiceVoided,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    /// Anything else; acknowledged and ignored
    Other(String),
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "invoice.created" => Self::InvoiceCreated,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "invoice.voided" => Self::InvoiceVoided,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            other => Self::Other(other.to_string()),
        })
    }
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvoiceCreated => "invoice.created",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::InvoiceVoided => "invoice.voided",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::Other(s) => s,
        }
    }

    /// Invoice payment outcomes that drive a status transition
    pub fn is_invoice_settlement(&self) -> bool {
        matches!(
            self,
            Self::InvoicePaid
                | Self::InvoicePaymentSucceeded
                | Self::InvoicePaymentFailed
                | Self::InvoiceVoided
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which Stripe account an event originated from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Platform,
    Connected(String),
}

impl Origin {
    pub fn account(&self) -> Option<&str> {
        match self {
            Origin::Platform => None,
            Origin::Connected(account) => Some(account),
        }
    }
}

/// An event whose signature has been checked. Lives for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedEvent {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: String,

    /// Connected account the event belongs to; absent for platform events
    #[serde(default)]
    pub account: Option<String>,

    /// Unix timestamp of event creation
    #[serde(default)]
    pub created: Option<i64>,

    #[serde(default)]
    pub livemode: bool,

    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl VerifiedEvent {
    pub fn from_bytes(bytes: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))
    }

    pub fn kind(&self) -> EventKind {
        match EventKind::from_str(&self.event_type) {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }

    /// Connected only when `account` is present and non-empty
    pub fn origin(&self) -> Origin {
        match self.account.as_deref().map(str::trim) {
            Some(account) if !account.is_empty() => Origin::Connected(account.to_string()),
            _ => Origin::Platform,
        }
    }

    pub fn created_at(&self) -> Option<OffsetDateTime> {
        self.created
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }

    pub fn invoice(&self) -> BillingResult<InvoicePayload> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayloadInvalid(format!(
                "event {} ({}) does not carry an invoice: {}",
                self.id, self.event_type, e
            ))
        })
    }

    pub fn subscription(&self) -> BillingResult<SubscriptionPayload> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayloadInvalid(format!(
                "event {} ({}) does not carry a subscription: {}",
                self.id, self.event_type, e
            ))
        })
    }
}

/// The slice of a Stripe invoice object used for reconciliation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoicePayload {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub paid: Option<bool>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub invoice_pdf: Option<String>,
    #[serde(default)]
    pub lines: Option<InvoiceLines>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

impl InvoicePayload {
    /// Subscription id, falling back to the first line item's parent details
    /// (newer API versions no longer put it at the top level)
    pub fn subscription_id(&self) -> Option<String> {
        if let Some(id) = &self.subscription {
            return Some(id.clone());
        }
        self.lines
            .as_ref()?
            .data
            .first()?
            .pointer("/parent/subscription_item_details/subscription")?
            .as_str()
            .map(str::to_string)
    }

    /// Amount in minor units, preferring the amount due
    pub fn amount_cents(&self) -> i64 {
        self.amount_due.or(self.amount_paid).unwrap_or(0)
    }

    pub fn document_url(&self) -> Option<&str> {
        self.invoice_pdf
            .as_deref()
            .or(self.hosted_invoice_url.as_deref())
    }
}

/// The slice of a Stripe subscription object used for status sync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub items: Option<InvoiceLines>,
}

impl SubscriptionPayload {
    /// Period bounds, taken from the first subscription item when the
    /// top-level fields are absent
    pub fn period(&self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        let first_item = self.items.as_ref().and_then(|items| items.data.first());
        let item_ts = |field: &str| {
            first_item
                .and_then(|item| item.get(field))
                .and_then(serde_json::Value::as_i64)
        };

        let start = self
            .current_period_start
            .or_else(|| item_ts("current_period_start"));
        let end = self
            .current_period_end
            .or_else(|| item_ts("current_period_end"));

        (unix_to_datetime(start), unix_to_datetime(end))
    }

    pub fn canceled_at(&self) -> Option<OffsetDateTime> {
        unix_to_datetime(self.canceled_at)
    }
}

pub(crate) fn unix_to_datetime(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

/// Stripe sends related objects either as an id string or, when expanded,
/// as an object with an `id` field.
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(id)) => Some(id),
        Some(serde_json::Value::Object(obj)) => obj
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(value: serde_json::Value) -> VerifiedEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn origin_requires_non_empty_account() {
        let base = serde_json::json!({
            "id": "evt_1", "type": "invoice.paid", "data": { "object": {} }
        });
        assert_eq!(event(base.clone()).origin(), Origin::Platform);

        let mut blank = base.clone();
        blank["account"] = serde_json::json!("  ");
        assert_eq!(event(blank).origin(), Origin::Platform);

        let mut null = base.clone();
        null["account"] = serde_json::Value::Null;
        assert_eq!(event(null).origin(), Origin::Platform);

        let mut connected = base;
        connected["account"] = serde_json::json!("acct_123");
        assert_eq!(
            event(connected).origin(),
            Origin::Connected("acct_123".to_string())
        );
    }

    #[test]
    fn unknown_types_round_trip_as_other() {
        let kind: EventKind = "charge.refunded".parse().unwrap();
        assert_eq!(kind, EventKind::Other("charge.refunded".to_string()));
        assert_eq!(kind.as_str(), "charge.refunded");
        assert!(!kind.is_invoice_settlement());
        assert!(EventKind::InvoicePaymentFailed.is_invoice_settlement());
    }

    #[test]
    fn invoice_subscription_falls_back_to_line_parent() {
        let ev = event(serde_json::json!({
            "id": "evt_1",
            "type": "invoice.payment_succeeded",
            "data": { "object": {
                "id": "in_1",
                "subscription": null,
                "customer": { "id": "cus_9", "object": "customer" },
                "lines": { "data": [
                    { "parent": { "subscription_item_details": { "subscription": "sub_42" } } }
                ] }
            } }
        }));

        let invoice = ev.invoice().unwrap();
        assert_eq!(invoice.customer.as_deref(), Some("cus_9"));
        assert_eq!(invoice.subscription_id().as_deref(), Some("sub_42"));
    }

    #[test]
    fn invoice_without_id_is_a_payload_error() {
        let ev = event(serde_json::json!({
            "id": "evt_1", "type": "invoice.paid", "data": { "object": { "status": "paid" } }
        }));
        assert!(matches!(
            ev.invoice(),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
    }

    #[test]
    fn subscription_period_reads_first_item() {
        let ev = event(serde_json::json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "data": { "object": {
                "id": "sub_1",
                "status": "active",
                "items": { "data": [
                    { "current_period_start": 1_700_000_000, "current_period_end": 1_702_592_000 }
                ] }
            } }
        }));

        let (start, end) = ev.subscription().unwrap().period();
        assert_eq!(start.unwrap().unix_timestamp(), 1_700_000_000);
        assert_eq!(end.unwrap().unix_timestamp(), 1_702_592_000);
    }
}
