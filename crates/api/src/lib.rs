// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries upstream messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Paysync API Library
//!
//! HTTP surface of Paysync: the Stripe webhook endpoint, admin routes for
//! Connect invoicing and the webhook ledger, and a health check.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
