//! Server configuration loaded from environment variables

use crate::error::{ApiError, ApiResult};

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8000";

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// When false the webhook and admin billing routes answer 503
    pub enable_billing: bool,
    /// Bearer token for `/admin/*`; admin routes are disabled without it
    pub admin_api_token: Option<String>,
    pub run_migrations: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"<redacted>")
            .field("bind_address", &self.bind_address)
            .field("enable_billing", &self.enable_billing)
            .field("admin_api_token", &self.admin_api_token.as_ref().map(|_| "<redacted>"))
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> ApiResult<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL").ok_or_else(|| {
                ApiError::Config("DATABASE_URL environment variable is required".to_string())
            })?,
            bind_address: env_var("BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            enable_billing: env_flag("ENABLE_BILLING_API", true)?,
            admin_api_token: env_var("ADMIN_API_TOKEN"),
            run_migrations: env_flag("RUN_MIGRATIONS", true)?,
        })
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str, default: bool) -> ApiResult<bool> {
    match env_var(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ApiError::Config(format!("Invalid {}: {}", key, other))),
    }
}
