// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries Stripe and database messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Paysync Billing Module
//!
//! Keeps local invoice and subscription records in step with Stripe.
//!
//! ## Features
//!
//! - **Webhooks**: Verify deliveries against the platform and Connect signing secrets
//! - **Reconciliation**: Move pending invoices to paid, payment_failed or void exactly once
//! - **Connect Invoicing**: Issue invoices on behalf of connected accounts
//! - **Subscriptions**: Sync subscription status, periods and cancellation
//! - **Ledger**: Record every delivered event; list and replay them

pub mod client;
pub mod connect;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod router;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{StripeClient, StripeConfig};

// Connect
pub use connect::{ConnectInvoiceRequest, ConnectInvoiceService, CONNECT_INVOICE_PAGE_SIZE};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, Origin, VerifiedEvent};

// Reconcile
pub use reconcile::{ReconcileOutcome, StatusReconciler};

// Router
pub use router::{EventRouter, RouteOutcome};

// Signature
pub use signature::{SignatureVerifier, WebhookSecret};

// Store
pub use store::{
    BillingStore, ConnectedInvoiceRecord, InvoiceStatus, MemoryStore, PlatformInvoiceRecord,
    SubscriptionRecord, WebhookEventRecord,
};

// Subscriptions
pub use subscriptions::{SubscriptionService, SubscriptionSyncOutcome};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome, WebhookReplayResult};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: BillingStore,
    pub connect: ConnectInvoiceService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, BillingStore::postgres(pool)))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, store: BillingStore) -> Self {
        let stripe = StripeClient::new(config);

        if !stripe.is_api_enabled() {
            tracing::warn!("STRIPE_SECRET_KEY not set; Connect issuance and webhook replay are disabled");
        }

        Self {
            connect: ConnectInvoiceService::new(stripe.clone(), store.clone()),
            subscriptions: SubscriptionService::new(store.clone()),
            webhooks: WebhookHandler::new(stripe, store.clone()),
            store,
        }
    }
}
