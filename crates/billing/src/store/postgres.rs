//! Postgres backend

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    processing_result, ClaimResult, ConnectedInvoiceRecord, EventClaim, InvoiceKey,
    NewConnectedInvoice, NewPlatformInvoice, PlatformInvoiceRecord,
    StatusTransition, SubscriptionRecord, SubscriptionUpdate, TransitionResult,
    WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};

const PLATFORM_COLUMNS: &str = "id, stripe_invoice_id, stripe_subscription_id, amount_cents, \
     currency, status, paid_at, hosted_invoice_url, invoice_pdf_url, created_at, updated_at";

const CONNECTED_COLUMNS: &str = "id, connected_account, customer_email, stripe_invoice_id, \
     amount_cents, currency, description, status, paid_at, hosted_invoice_url, invoice_pdf_url, \
     error_message, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, stripe_customer_id, stripe_subscription_id, \
     status, current_period_start, current_period_end, cancel_at_period_end, cancelled_at, \
     created_at, updated_at";

const EVENT_COLUMNS: &str = "id, stripe_event_id, event_type, connected_account, event_timestamp, \
     processing_result, processing_started_at, error_message, created_at";

pub(super) async fn transition_invoice(
    pool: &PgPool,
    key: &InvoiceKey,
    transition: &StatusTransition,
) -> BillingResult<TransitionResult> {
    // Compare-and-swap on status: only a pending invoice moves. A duplicate or
    // concurrent delivery of the same event matches zero rows.
    let result = match key {
        InvoiceKey::Platform { stripe_invoice_id } => {
            sqlx::query(
                r#"
                UPDATE platform_invoices
                SET status = $2,
                    paid_at = COALESCE($3, paid_at),
                    hosted_invoice_url = COALESCE(hosted_invoice_url, $4),
                    invoice_pdf_url = COALESCE(invoice_pdf_url, $5),
                    updated_at = NOW()
                WHERE stripe_invoice_id = $1
                  AND status = 'pending'
                "#,
            )
            .bind(stripe_invoice_id)
            .bind(transition.to.as_str())
            .bind(transition.paid_at)
            .bind(transition.hosted_invoice_url.as_deref())
            .bind(transition.invoice_pdf_url.as_deref())
            .execute(pool)
            .await?
        }
        InvoiceKey::Connected {
            account,
            stripe_invoice_id,
        } => {
            sqlx::query(
                r#"
                UPDATE connected_account_invoices
                SET status = $3,
                    paid_at = COALESCE($4, paid_at),
                    hosted_invoice_url = COALESCE(hosted_invoice_url, $5),
                    invoice_pdf_url = COALESCE(invoice_pdf_url, $6),
                    updated_at = NOW()
                WHERE stripe_invoice_id = $1
                  AND connected_account = $2
                  AND status = 'pending'
                "#,
            )
            .bind(stripe_invoice_id)
            .bind(account)
            .bind(transition.to.as_str())
            .bind(transition.paid_at)
            .bind(transition.hosted_invoice_url.as_deref())
            .bind(transition.invoice_pdf_url.as_deref())
            .execute(pool)
            .await?
        }
    };

    if result.rows_affected() > 0 {
        return Ok(TransitionResult::Applied);
    }

    let current: Option<(String,)> = match key {
        InvoiceKey::Platform { stripe_invoice_id } => {
            sqlx::query_as("SELECT status FROM platform_invoices WHERE stripe_invoice_id = $1")
                .bind(stripe_invoice_id)
                .fetch_optional(pool)
                .await?
        }
        InvoiceKey::Connected {
            account,
            stripe_invoice_id,
        } => {
            sqlx::query_as(
                "SELECT status FROM connected_account_invoices \
                 WHERE stripe_invoice_id = $1 AND connected_account = $2",
            )
            .bind(stripe_invoice_id)
            .bind(account)
            .fetch_optional(pool)
            .await?
        }
    };

    match current {
        Some((status,)) => Ok(TransitionResult::Unchanged(status.parse()?)),
        None => Ok(TransitionResult::NotFound),
    }
}

pub(super) async fn insert_platform_invoice(
    pool: &PgPool,
    new: &NewPlatformInvoice,
) -> BillingResult<bool> {
    let inserted: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO platform_invoices (
            id, stripe_invoice_id, stripe_subscription_id, amount_cents, currency,
            status, hosted_invoice_url, invoice_pdf_url, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, NOW(), NOW())
        ON CONFLICT (stripe_invoice_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&new.stripe_invoice_id)
    .bind(new.stripe_subscription_id.as_deref())
    .bind(new.amount_cents)
    .bind(&new.currency)
    .bind(new.hosted_invoice_url.as_deref())
    .bind(new.invoice_pdf_url.as_deref())
    .fetch_optional(pool)
    .await?;

    Ok(inserted.is_some())
}

pub(super) async fn platform_invoice(
    pool: &PgPool,
    stripe_invoice_id: &str,
) -> BillingResult<Option<PlatformInvoiceRecord>> {
    let sql = format!(
        "SELECT {} FROM platform_invoices WHERE stripe_invoice_id = $1",
        PLATFORM_COLUMNS
    );
    Ok(sqlx::query_as::<_, PlatformInvoiceRecord>(&sql)
        .bind(stripe_invoice_id)
        .fetch_optional(pool)
        .await?)
}

pub(super) async fn create_connected_invoice(
    pool: &PgPool,
    new: &NewConnectedInvoice,
) -> BillingResult<ConnectedInvoiceRecord> {
    let sql = format!(
        r#"
        INSERT INTO connected_account_invoices (
            id, connected_account, customer_email, amount_cents, currency, description,
            status, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', NOW(), NOW())
        RETURNING {}
        "#,
        CONNECTED_COLUMNS
    );

    Ok(sqlx::query_as::<_, ConnectedInvoiceRecord>(&sql)
        .bind(Uuid::new_v4())
        .bind(&new.connected_account)
        .bind(&new.customer_email)
        .bind(new.amount_cents)
        .bind(&new.currency)
        .bind(new.description.as_deref())
        .fetch_one(pool)
        .await?)
}

pub(super) async fn mark_connected_issued(
    pool: &PgPool,
    id: Uuid,
    stripe_invoice_id: &str,
    hosted_invoice_url: Option<&str>,
    invoice_pdf_url: Option<&str>,
) -> BillingResult<ConnectedInvoiceRecord> {
    let sql = format!(
        r#"
        UPDATE connected_account_invoices
        SET stripe_invoice_id = $2,
            hosted_invoice_url = $3,
            invoice_pdf_url = $4,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        CONNECTED_COLUMNS
    );

    sqlx::query_as::<_, ConnectedInvoiceRecord>(&sql)
        .bind(id)
        .bind(stripe_invoice_id)
        .bind(hosted_invoice_url)
        .bind(invoice_pdf_url)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("connected invoice {}", id)))
}

pub(super) async fn mark_connected_error(
    pool: &PgPool,
    id: Uuid,
    message: &str,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE connected_account_invoices
        SET status = 'error', error_message = $2, updated_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}

pub(super) async fn connected_invoice(
    pool: &PgPool,
    account: &str,
    stripe_invoice_id: &str,
) -> BillingResult<Option<ConnectedInvoiceRecord>> {
    let sql = format!(
        "SELECT {} FROM connected_account_invoices \
         WHERE connected_account = $1 AND stripe_invoice_id = $2",
        CONNECTED_COLUMNS
    );
    Ok(sqlx::query_as::<_, ConnectedInvoiceRecord>(&sql)
        .bind(account)
        .bind(stripe_invoice_id)
        .fetch_optional(pool)
        .await?)
}

pub(super) async fn list_connected_invoices(
    pool: &PgPool,
    account: &str,
    limit: i64,
    offset: i64,
) -> BillingResult<Vec<ConnectedInvoiceRecord>> {
    let sql = format!(
        "SELECT {} FROM connected_account_invoices \
         WHERE connected_account = $1 \
         ORDER BY created_at DESC \
         LIMIT $2 OFFSET $3",
        CONNECTED_COLUMNS
    );
    Ok(sqlx::query_as::<_, ConnectedInvoiceRecord>(&sql)
        .bind(account)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?)
}

pub(super) async fn subscription(
    pool: &PgPool,
    stripe_subscription_id: &str,
) -> BillingResult<Option<SubscriptionRecord>> {
    let sql = format!(
        "SELECT {} FROM user_subscriptions WHERE stripe_subscription_id = $1",
        SUBSCRIPTION_COLUMNS
    );
    Ok(sqlx::query_as::<_, SubscriptionRecord>(&sql)
        .bind(stripe_subscription_id)
        .fetch_optional(pool)
        .await?)
}

pub(super) async fn insert_subscription(
    pool: &PgPool,
    record: &SubscriptionRecord,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO user_subscriptions (
            id, user_id, stripe_customer_id, stripe_subscription_id, status,
            current_period_start, current_period_end, cancel_at_period_end, cancelled_at,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(record.id)
    .bind(record.user_id)
    .bind(record.stripe_customer_id.as_deref())
    .bind(record.stripe_subscription_id.as_deref())
    .bind(&record.status)
    .bind(record.current_period_start)
    .bind(record.current_period_end)
    .bind(record.cancel_at_period_end)
    .bind(record.cancelled_at)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(super) async fn update_subscription(
    pool: &PgPool,
    update: &SubscriptionUpdate,
) -> BillingResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE user_subscriptions
        SET status = $2,
            current_period_start = COALESCE($3, current_period_start),
            current_period_end = COALESCE($4, current_period_end),
            cancel_at_period_end = $5,
            cancelled_at = COALESCE($6, cancelled_at),
            updated_at = NOW()
        WHERE stripe_subscription_id = $1
        "#,
    )
    .bind(&update.stripe_subscription_id)
    .bind(&update.status)
    .bind(update.current_period_start)
    .bind(update.current_period_end)
    .bind(update.cancel_at_period_end)
    .bind(update.cancelled_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub(super) async fn activate_trialing_subscription(
    pool: &PgPool,
    stripe_subscription_id: &str,
) -> BillingResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE user_subscriptions
        SET status = 'active', updated_at = NOW()
        WHERE stripe_subscription_id = $1 AND status = 'trialing'
        "#,
    )
    .bind(stripe_subscription_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub(super) async fn claim_event(pool: &PgPool, claim: &EventClaim<'_>) -> BillingResult<ClaimResult> {
    // INSERT...ON CONFLICT...RETURNING hands exclusive processing rights to
    // exactly one caller. A previous attempt that ended in error, or a claim
    // stuck in processing past the timeout, can be taken over.
    let claimed: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO stripe_webhook_events
            (stripe_event_id, event_type, connected_account, event_timestamp,
             processing_result, processing_started_at)
        VALUES ($1, $2, $3, $4, 'processing', NOW())
        ON CONFLICT (stripe_event_id) DO UPDATE SET
            processing_result = 'processing',
            processing_started_at = NOW(),
            error_message = CONCAT('Reclaimed from ', stripe_webhook_events.processing_result,
                                   ' at ', NOW()::TEXT)
        WHERE stripe_webhook_events.processing_result = 'error'
           OR (stripe_webhook_events.processing_result = 'processing'
               AND stripe_webhook_events.processing_started_at
                   < NOW() - make_interval(secs => $5))
        RETURNING id
        "#,
    )
    .bind(claim.stripe_event_id)
    .bind(claim.event_type)
    .bind(claim.connected_account)
    .bind(claim.event_timestamp)
    .bind(claim.stale_after.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    if claimed.is_some() {
        return Ok(ClaimResult::Claimed);
    }

    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
    )
    .bind(claim.stripe_event_id)
    .fetch_optional(pool)
    .await?;

    Ok(ClaimResult::Duplicate(existing.map(|(status,)| status)))
}

pub(super) async fn finish_event(
    pool: &PgPool,
    stripe_event_id: &str,
    result: &str,
    error_message: Option<&str>,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE stripe_webhook_events
        SET processing_result = $1, error_message = $2
        WHERE stripe_event_id = $3
        "#,
    )
    .bind(result)
    .bind(error_message)
    .bind(stripe_event_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub(super) async fn webhook_event(
    pool: &PgPool,
    stripe_event_id: &str,
) -> BillingResult<Option<WebhookEventRecord>> {
    let sql = format!(
        "SELECT {} FROM stripe_webhook_events WHERE stripe_event_id = $1",
        EVENT_COLUMNS
    );
    Ok(sqlx::query_as::<_, WebhookEventRecord>(&sql)
        .bind(stripe_event_id)
        .fetch_optional(pool)
        .await?)
}

pub(super) async fn list_webhook_events(
    pool: &PgPool,
    status: Option<&str>,
    limit: i64,
    offset: i64,
) -> BillingResult<Vec<WebhookEventRecord>> {
    let records = match status {
        Some(status) => {
            let sql = format!(
                "SELECT {} FROM stripe_webhook_events \
                 WHERE processing_result = $1 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                EVENT_COLUMNS
            );
            sqlx::query_as::<_, WebhookEventRecord>(&sql)
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!(
                "SELECT {} FROM stripe_webhook_events \
                 ORDER BY created_at DESC LIMIT $1 OFFSET $2",
                EVENT_COLUMNS
            );
            sqlx::query_as::<_, WebhookEventRecord>(&sql)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
        }
    };

    Ok(records)
}

pub(super) async fn mark_replaying(
    pool: &PgPool,
    stripe_event_id: &str,
    note: &str,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE stripe_webhook_events
        SET processing_result = $2,
            processing_started_at = $3,
            error_message = $4
        WHERE stripe_event_id = $1
        "#,
    )
    .bind(stripe_event_id)
    .bind(processing_result::REPLAYING)
    .bind(OffsetDateTime::now_utc())
    .bind(note)
    .execute(pool)
    .await?;
    Ok(())
}

