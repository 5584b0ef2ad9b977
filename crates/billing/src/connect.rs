//! Invoices issued on behalf of Connect accounts
//!
//! The local record is written first as `pending`. The Stripe side is then
//! built on the connected account: customer, draft invoice, invoice item,
//! finalize. If any Stripe call fails the record moves to `error` and keeps
//! the message.

use serde::Deserialize;
use stripe::{
    CollectionMethod, CreateCustomer, CreateInvoice, CreateInvoiceItem, Currency, Customer,
    FinalizeInvoiceParams, Invoice, InvoiceItem,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, ConnectedInvoiceRecord, NewConnectedInvoice};

/// Invoices per page when listing an account's invoices
pub const CONNECT_INVOICE_PAGE_SIZE: i64 = 5;

const DEFAULT_CURRENCY: &str = "usd";
const DEFAULT_DESCRIPTION: &str = "Invoice from platform";

/// Request to bill a customer on behalf of a connected account
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectInvoiceRequest {
    pub connected_account: String,
    pub customer_email: String,
    /// Minor units (cents)
    pub amount_cents: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ConnectInvoiceRequest {
    fn validate(&self) -> BillingResult<NewConnectedInvoice> {
        let account = self.connected_account.trim();
        if !account.starts_with("acct_") || account.len() <= "acct_".len() {
            return Err(BillingError::InvalidInput(format!(
                "Invalid connected account id: {}",
                self.connected_account
            )));
        }

        let email = self.customer_email.trim();
        let valid_email = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid_email {
            return Err(BillingError::InvalidInput(format!(
                "Invalid customer email: {}",
                self.customer_email
            )));
        }

        if self.amount_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "Amount must be greater than zero".to_string(),
            ));
        }

        let currency = self
            .currency
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CURRENCY);
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::InvalidInput(format!(
                "Invalid currency: {}",
                currency
            )));
        }

        let description = self
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DESCRIPTION);

        Ok(NewConnectedInvoice {
            connected_account: account.to_string(),
            customer_email: email.to_string(),
            amount_cents: self.amount_cents,
            currency: currency.to_uppercase(),
            description: Some(description.to_string()),
        })
    }
}

/// Stripe-side identifiers of a finalized invoice
struct IssuedInvoice {
    stripe_invoice_id: String,
    hosted_invoice_url: Option<String>,
    invoice_pdf_url: Option<String>,
}

#[derive(Clone)]
pub struct ConnectInvoiceService {
    stripe: StripeClient,
    store: BillingStore,
}

impl ConnectInvoiceService {
    pub fn new(stripe: StripeClient, store: BillingStore) -> Self {
        Self { stripe, store }
    }

    /// Issue an invoice on the connected account.
    ///
    /// Validation failures create nothing. Once the local record exists, a
    /// Stripe failure leaves it in `error` and is returned to the caller.
    pub async fn issue(&self, request: ConnectInvoiceRequest) -> BillingResult<ConnectedInvoiceRecord> {
        let new = request.validate()?;
        let record = self.store.create_connected_invoice(&new).await?;

        tracing::info!(
            record_id = %record.id,
            account = %record.connected_account,
            amount_cents = record.amount_cents,
            currency = %record.currency,
            "Issuing Connect invoice"
        );

        match self.create_on_stripe(&new).await {
            Ok(issued) => {
                let record = self
                    .store
                    .mark_connected_issued(
                        record.id,
                        &issued.stripe_invoice_id,
                        issued.hosted_invoice_url.as_deref(),
                        issued.invoice_pdf_url.as_deref(),
                    )
                    .await?;

                if record.hosted_invoice_url.is_none() {
                    tracing::warn!(
                        record_id = %record.id,
                        invoice_id = %issued.stripe_invoice_id,
                        "Invoice finalized but no payment link was generated"
                    );
                }
                tracing::info!(
                    record_id = %record.id,
                    invoice_id = %issued.stripe_invoice_id,
                    account = %record.connected_account,
                    "Connect invoice issued"
                );
                Ok(record)
            }
            Err(e) => {
                tracing::error!(
                    record_id = %record.id,
                    account = %record.connected_account,
                    error = %e,
                    "Failed to issue Connect invoice"
                );
                self.store
                    .mark_connected_error(record.id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    async fn create_on_stripe(&self, new: &NewConnectedInvoice) -> BillingResult<IssuedInvoice> {
        let client = self.stripe.for_account(&new.connected_account)?;

        let currency = new
            .currency
            .to_lowercase()
            .parse::<Currency>()
            .map_err(|_| BillingError::InvalidInput(format!("Unsupported currency: {}", new.currency)))?;

        let customer = Customer::create(
            &client,
            CreateCustomer {
                email: Some(new.customer_email.as_str()),
                name: Some(new.customer_email.as_str()),
                ..Default::default()
            },
        )
        .await?;

        let mut invoice_params = CreateInvoice::new();
        invoice_params.customer = Some(customer.id.clone());
        invoice_params.collection_method = Some(CollectionMethod::SendInvoice);
        invoice_params.days_until_due = Some(self.stripe.config().days_until_due);
        invoice_params.auto_advance = Some(false);
        let draft = Invoice::create(&client, invoice_params).await?;

        let mut item_params = CreateInvoiceItem::new(customer.id.clone());
        item_params.invoice = Some(draft.id.clone());
        item_params.amount = Some(new.amount_cents);
        item_params.currency = Some(currency);
        item_params.description = new.description.as_deref();
        InvoiceItem::create(&client, item_params).await?;

        let finalized = Invoice::finalize(
            &client,
            &draft.id,
            FinalizeInvoiceParams {
                auto_advance: Some(false),
            },
        )
        .await?;

        Ok(IssuedInvoice {
            stripe_invoice_id: finalized.id.to_string(),
            hosted_invoice_url: finalized.hosted_invoice_url,
            invoice_pdf_url: finalized.invoice_pdf,
        })
    }

    /// One page (1-based) of an account's invoices, newest first
    pub async fn list(&self, account: &str, page: u32) -> BillingResult<Vec<ConnectedInvoiceRecord>> {
        let page = i64::from(page.max(1));
        self.store
            .list_connected_invoices(
                account,
                CONNECT_INVOICE_PAGE_SIZE,
                (page - 1) * CONNECT_INVOICE_PAGE_SIZE,
            )
            .await
    }
}
