//! Persistence for invoices, subscriptions and the webhook event ledger
//!
//! `BillingStore` is either backed by Postgres or held in memory. Both
//! backends implement the same conditional-update semantics so the in-memory
//! one can stand in for the database in tests and local runs.

mod memory;
mod postgres;

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub use memory::MemoryStore;

/// Local invoice status. Closed set; stored as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    PaymentFailed,
    Void,
    /// Issuance through Stripe failed; never reached the customer
    Error,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::PaymentFailed => "payment_failed",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Error => "error",
        }
    }

    /// Transitions are only ever applied out of `pending`
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        *self == InvoiceStatus::Pending
            && matches!(
                next,
                InvoiceStatus::Paid | InvoiceStatus::PaymentFailed | InvoiceStatus::Void
            )
    }
}

impl FromStr for InvoiceStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvoiceStatus::Pending),
            "paid" => Ok(InvoiceStatus::Paid),
            "payment_failed" => Ok(InvoiceStatus::PaymentFailed),
            "void" => Ok(InvoiceStatus::Void),
            "error" => Ok(InvoiceStatus::Error),
            other => Err(BillingError::Internal(format!(
                "Unknown invoice status in store: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which invoice table a lookup targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceKey {
    Platform {
        stripe_invoice_id: String,
    },
    Connected {
        account: String,
        stripe_invoice_id: String,
    },
}

impl InvoiceKey {
    pub fn stripe_invoice_id(&self) -> &str {
        match self {
            InvoiceKey::Platform { stripe_invoice_id }
            | InvoiceKey::Connected {
                stripe_invoice_id, ..
            } => stripe_invoice_id,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            InvoiceKey::Platform { .. } => "platform_invoices",
            InvoiceKey::Connected { .. } => "connected_account_invoices",
        }
    }
}

/// A status change to apply only if the invoice is still `pending`
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub to: InvoiceStatus,
    pub paid_at: Option<OffsetDateTime>,
    /// Filled in only where the record has no URL yet
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
}

/// Result of a conditional status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    Applied,
    /// Record exists but was no longer `pending`
    Unchanged(InvoiceStatus),
    NotFound,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlatformInvoiceRecord {
    pub id: Uuid,
    pub stripe_invoice_id: String,
    pub stripe_subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ConnectedInvoiceRecord {
    pub id: Uuid,
    pub connected_account: String,
    pub customer_email: String,
    pub stripe_invoice_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub description: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewPlatformInvoice {
    pub stripe_invoice_id: String,
    pub stripe_subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewConnectedInvoice {
    pub connected_account: String,
    pub customer_email: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub stripe_subscription_id: String,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<OffsetDateTime>,
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub connected_account: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Event being claimed in the ledger
#[derive(Debug, Clone)]
pub struct EventClaim<'a> {
    pub stripe_event_id: &'a str,
    pub event_type: &'a str,
    pub connected_account: Option<&'a str>,
    pub event_timestamp: OffsetDateTime,
    /// A `processing` claim older than this may be taken over
    pub stale_after: Duration,
}

/// Outcome of trying to claim an event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed,
    /// Someone else holds or finished it; carries the existing result
    Duplicate(Option<String>),
}

/// Ledger processing results
pub mod processing_result {
    pub const PROCESSING: &str = "processing";
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const REPLAYING: &str = "replaying";
}

#[derive(Clone)]
pub enum BillingStore {
    Postgres(PgPool),
    InMemory(MemoryStore),
}

impl BillingStore {
    pub fn postgres(pool: PgPool) -> Self {
        BillingStore::Postgres(pool)
    }

    pub fn new_in_memory() -> Self {
        BillingStore::InMemory(MemoryStore::default())
    }

    pub fn as_memory(&self) -> Option<&MemoryStore> {
        match self {
            BillingStore::InMemory(mem) => Some(mem),
            BillingStore::Postgres(_) => None,
        }
    }

    // -- invoices ------------------------------------------------------------

    pub async fn transition_invoice(
        &self,
        key: &InvoiceKey,
        transition: &StatusTransition,
    ) -> BillingResult<TransitionResult> {
        match self {
            BillingStore::Postgres(pool) => postgres::transition_invoice(pool, key, transition).await,
            BillingStore::InMemory(mem) => mem.transition_invoice(key, transition).await,
        }
    }

    /// Insert a `pending` platform invoice unless one already exists.
    /// Returns whether a row was created.
    pub async fn insert_platform_invoice(&self, new: &NewPlatformInvoice) -> BillingResult<bool> {
        match self {
            BillingStore::Postgres(pool) => postgres::insert_platform_invoice(pool, new).await,
            BillingStore::InMemory(mem) => mem.insert_platform_invoice(new).await,
        }
    }

    pub async fn platform_invoice(
        &self,
        stripe_invoice_id: &str,
    ) -> BillingResult<Option<PlatformInvoiceRecord>> {
        match self {
            BillingStore::Postgres(pool) => postgres::platform_invoice(pool, stripe_invoice_id).await,
            BillingStore::InMemory(mem) => Ok(mem.platform_invoice(stripe_invoice_id).await),
        }
    }

    pub async fn create_connected_invoice(
        &self,
        new: &NewConnectedInvoice,
    ) -> BillingResult<ConnectedInvoiceRecord> {
        match self {
            BillingStore::Postgres(pool) => postgres::create_connected_invoice(pool, new).await,
            BillingStore::InMemory(mem) => mem.create_connected_invoice(new).await,
        }
    }

    /// Record the Stripe side of a freshly issued Connect invoice
    pub async fn mark_connected_issued(
        &self,
        id: Uuid,
        stripe_invoice_id: &str,
        hosted_invoice_url: Option<&str>,
        invoice_pdf_url: Option<&str>,
    ) -> BillingResult<ConnectedInvoiceRecord> {
        match self {
            BillingStore::Postgres(pool) => {
                postgres::mark_connected_issued(
                    pool,
                    id,
                    stripe_invoice_id,
                    hosted_invoice_url,
                    invoice_pdf_url,
                )
                .await
            }
            BillingStore::InMemory(mem) => {
                mem.mark_connected_issued(id, stripe_invoice_id, hosted_invoice_url, invoice_pdf_url)
                    .await
            }
        }
    }

    /// Move a Connect invoice whose issuance failed to `error`
    pub async fn mark_connected_error(&self, id: Uuid, message: &str) -> BillingResult<()> {
        match self {
            BillingStore::Postgres(pool) => postgres::mark_connected_error(pool, id, message).await,
            BillingStore::InMemory(mem) => mem.mark_connected_error(id, message).await,
        }
    }

    pub async fn connected_invoice(
        &self,
        account: &str,
        stripe_invoice_id: &str,
    ) -> BillingResult<Option<ConnectedInvoiceRecord>> {
        match self {
            BillingStore::Postgres(pool) => {
                postgres::connected_invoice(pool, account, stripe_invoice_id).await
            }
            BillingStore::InMemory(mem) => Ok(mem.connected_invoice(account, stripe_invoice_id).await),
        }
    }

    /// Newest first
    pub async fn list_connected_invoices(
        &self,
        account: &str,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ConnectedInvoiceRecord>> {
        match self {
            BillingStore::Postgres(pool) => {
                postgres::list_connected_invoices(pool, account, limit, offset).await
            }
            BillingStore::InMemory(mem) => {
                Ok(mem.list_connected_invoices(account, limit, offset).await)
            }
        }
    }

    // -- subscriptions -------------------------------------------------------

    pub async fn subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        match self {
            BillingStore::Postgres(pool) => postgres::subscription(pool, stripe_subscription_id).await,
            BillingStore::InMemory(mem) => Ok(mem.subscription(stripe_subscription_id).await),
        }
    }

    pub async fn insert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        match self {
            BillingStore::Postgres(pool) => postgres::insert_subscription(pool, record).await,
            BillingStore::InMemory(mem) => mem.insert_subscription(record).await,
        }
    }

    /// Returns false when no local subscription has this Stripe id
    pub async fn update_subscription(&self, update: &SubscriptionUpdate) -> BillingResult<bool> {
        match self {
            BillingStore::Postgres(pool) => postgres::update_subscription(pool, update).await,
            BillingStore::InMemory(mem) => mem.update_subscription(update).await,
        }
    }

    /// `trialing` -> `active`; returns whether a row changed
    pub async fn activate_trialing_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<bool> {
        match self {
            BillingStore::Postgres(pool) => {
                postgres::activate_trialing_subscription(pool, stripe_subscription_id).await
            }
            BillingStore::InMemory(mem) => {
                mem.activate_trialing_subscription(stripe_subscription_id)
                    .await
            }
        }
    }

    // -- webhook ledger ------------------------------------------------------

    pub async fn claim_event(&self, claim: &EventClaim<'_>) -> BillingResult<ClaimResult> {
        match self {
            BillingStore::Postgres(pool) => postgres::claim_event(pool, claim).await,
            BillingStore::InMemory(mem) => mem.claim_event(claim).await,
        }
    }

    pub async fn finish_event(
        &self,
        stripe_event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        match self {
            BillingStore::Postgres(pool) => {
                postgres::finish_event(pool, stripe_event_id, result, error_message).await
            }
            BillingStore::InMemory(mem) => {
                mem.finish_event(stripe_event_id, result, error_message)
                    .await
            }
        }
    }

    pub async fn webhook_event(
        &self,
        stripe_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        match self {
            BillingStore::Postgres(pool) => postgres::webhook_event(pool, stripe_event_id).await,
            BillingStore::InMemory(mem) => Ok(mem.webhook_event(stripe_event_id).await),
        }
    }

    /// Newest first, optionally filtered by processing result
    pub async fn list_webhook_events(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        match self {
            BillingStore::Postgres(pool) => {
                postgres::list_webhook_events(pool, status, limit, offset).await
            }
            BillingStore::InMemory(mem) => Ok(mem.list_webhook_events(status, limit, offset).await),
        }
    }

    pub async fn mark_replaying(&self, stripe_event_id: &str, note: &str) -> BillingResult<()> {
        match self {
            BillingStore::Postgres(pool) => {
                postgres::mark_replaying(pool, stripe_event_id, note).await
            }
            BillingStore::InMemory(mem) => mem.mark_replaying(stripe_event_id, note).await,
        }
    }
}
