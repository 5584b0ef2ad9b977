//! Admin routes: Connect invoicing and the webhook ledger
//!
//! All routes are mounted behind [`require_admin`].

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use paysync_billing::{
    BillingService, ConnectInvoiceRequest, ConnectedInvoiceRecord, WebhookEventRecord,
    WebhookReplayResult, CONNECT_INVOICE_PAGE_SIZE,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_LEDGER_LIMIT: i64 = 50;

/// Reject requests that do not carry `Authorization: Bearer <ADMIN_API_TOKEN>`.
/// With no token configured every request is rejected.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.admin_api_token.as_deref() else {
        tracing::warn!("Admin request rejected: ADMIN_API_TOKEN not configured");
        return Err(ApiError::Unauthorized);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!("Admin request rejected: invalid token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

fn billing(state: &AppState) -> ApiResult<&Arc<BillingService>> {
    state.billing_service().ok_or(ApiError::ServiceUnavailable)
}

/// Issue an invoice on behalf of a connected account
pub async fn create_connect_invoice(
    State(state): State<AppState>,
    Json(request): Json<ConnectInvoiceRequest>,
) -> ApiResult<(StatusCode, Json<ConnectedInvoiceRecord>)> {
    let record = billing(&state)?.connect.issue(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
pub struct ConnectInvoiceListQuery {
    pub account: String,
    #[serde(default)]
    pub page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ConnectInvoiceListResponse {
    pub account: String,
    pub page: u32,
    pub page_size: i64,
    pub invoices: Vec<ConnectedInvoiceRecord>,
}

pub async fn list_connect_invoices(
    State(state): State<AppState>,
    Query(query): Query<ConnectInvoiceListQuery>,
) -> ApiResult<Json<ConnectInvoiceListResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let invoices = billing(&state)?.connect.list(&query.account, page).await?;

    Ok(Json(ConnectInvoiceListResponse {
        account: query.account,
        page,
        page_size: CONNECT_INVOICE_PAGE_SIZE,
        invoices,
    }))
}

#[derive(Debug, Deserialize)]
pub struct WebhookListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookListResponse {
    pub events: Vec<WebhookEventRecord>,
    pub limit: i64,
    pub offset: i64,
}

/// List ledger entries, newest first
pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<WebhookListQuery>,
) -> ApiResult<Json<WebhookListResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_LEDGER_LIMIT).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let status = query.status.as_deref().filter(|s| !s.is_empty());

    let events = billing(&state)?
        .webhooks
        .list_webhooks(status, limit, offset)
        .await?;

    Ok(Json(WebhookListResponse {
        events,
        limit,
        offset,
    }))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    let result = billing(&state)?.webhooks.replay_webhook(&event_id).await?;
    Ok(Json(result))
}
