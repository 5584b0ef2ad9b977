//! Stripe configuration and API client

use std::time::Duration;

use stripe::{AccountId, Client};

use crate::error::{BillingError, BillingResult};
use crate::signature::WebhookSecret;

/// Default window within which a signed webhook timestamp is accepted
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

/// Default `days_until_due` for invoices issued on behalf of connected accounts
pub const DEFAULT_DAYS_UNTIL_DUE: u32 = 7;

/// Stripe settings, resolved once at startup and passed down explicitly
#[derive(Clone)]
pub struct StripeConfig {
    /// API secret key. Only needed for outbound calls (issuance, replay).
    pub secret_key: Option<String>,
    /// Signing secret of the platform webhook endpoint (mandatory)
    pub webhook_secret: String,
    /// Signing secret of the Connect webhook endpoint, if it differs
    pub connect_webhook_secret: Option<String>,
    pub webhook_tolerance: Duration,
    pub days_until_due: u32,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("webhook_secret", &"<redacted>")
            .field(
                "connect_webhook_secret",
                &self.connect_webhook_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("webhook_tolerance", &self.webhook_tolerance)
            .field("days_until_due", &self.days_until_due)
            .finish()
    }
}

impl StripeConfig {
    /// Load from `STRIPE_*` environment variables
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = non_empty_var("STRIPE_WEBHOOK_SECRET").ok_or_else(|| {
            BillingError::NotConfigured("STRIPE_WEBHOOK_SECRET must be set".to_string())
        })?;

        let webhook_tolerance = match non_empty_var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                BillingError::NotConfigured(format!(
                    "STRIPE_WEBHOOK_TOLERANCE_SECS is not a number: {}",
                    raw
                ))
            })?,
            None => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        let days_until_due = match non_empty_var("CONNECT_INVOICE_DAYS_UNTIL_DUE") {
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                BillingError::NotConfigured(format!(
                    "CONNECT_INVOICE_DAYS_UNTIL_DUE is not a number: {}",
                    raw
                ))
            })?,
            None => DEFAULT_DAYS_UNTIL_DUE,
        };

        Ok(Self {
            secret_key: non_empty_var("STRIPE_SECRET_KEY"),
            webhook_secret,
            connect_webhook_secret: non_empty_var("STRIPE_CONNECT_WEBHOOK_SECRET"),
            webhook_tolerance: Duration::from_secs(webhook_tolerance),
            days_until_due,
        })
    }

    /// Signing secrets in the order they are tried: platform first, then
    /// Connect. A Connect secret identical to the platform one is skipped.
    pub fn webhook_secrets(&self) -> Vec<WebhookSecret> {
        let mut secrets = vec![WebhookSecret::new("platform", &self.webhook_secret)];

        if let Some(connect) = &self.connect_webhook_secret {
            if connect != &self.webhook_secret {
                secrets.push(WebhookSecret::new("connect", connect));
            }
        }

        secrets
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Thin wrapper over the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: Option<Client>,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = config.secret_key.as_ref().map(Client::new);
        Self { inner, config }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Whether outbound API calls are possible
    pub fn is_api_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Platform-scoped API client
    pub fn inner(&self) -> BillingResult<&Client> {
        self.inner.as_ref().ok_or_else(|| {
            BillingError::NotConfigured("STRIPE_SECRET_KEY is not set".to_string())
        })
    }

    /// API client that sends `Stripe-Account: <account>` on every request
    pub fn for_account(&self, account: &str) -> BillingResult<Client> {
        let account_id = account.parse::<AccountId>().map_err(|e| {
            BillingError::InvalidInput(format!("Invalid connected account id {}: {}", account, e))
        })?;
        Ok(self.inner()?.clone().with_stripe_account(account_id))
    }
}
