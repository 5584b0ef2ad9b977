//! Application state

use std::sync::Arc;

use paysync_billing::{BillingService, BillingStore, StripeConfig};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Billing service; `None` when disabled by config or Stripe is not configured
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(pool) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING_API=false)");
            None
        };

        if config.admin_api_token.is_none() {
            tracing::warn!("ADMIN_API_TOKEN not set - admin routes will reject every request");
        }

        Self { config, billing }
    }

    /// State over an explicit store and Stripe config
    pub fn with_store(config: Config, stripe: StripeConfig, store: BillingStore) -> Self {
        Self {
            config,
            billing: Some(Arc::new(BillingService::new(stripe, store))),
        }
    }

    /// Get billing service reference
    pub fn billing_service(&self) -> Option<&Arc<BillingService>> {
        self.billing.as_ref()
    }
}
