//! HTTP routes

pub mod admin;
pub mod health;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/connect/invoices",
            post(admin::create_connect_invoice).get(admin::list_connect_invoices),
        )
        .route("/webhooks", get(admin::list_webhooks))
        .route("/webhooks/{event_id}/replay", post(admin::replay_webhook))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::require_admin,
        ));

    Router::new()
        .route("/health", get(health::health))
        // Stripe is configured with the trailing slash; accept both
        .route("/stripe/webhook/", post(webhooks::stripe_webhook))
        .route("/stripe/webhook", post(webhooks::stripe_webhook))
        .nest("/admin", admin_routes)
        .with_state(state)
}
