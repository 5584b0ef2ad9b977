//! Stripe webhook signature verification
//!
//! Stripe signs every delivery with HMAC-SHA256 over `"<timestamp>.<raw body>"`
//! and sends the result in the `Stripe-Signature` header:
//!
//! ```text
//! Stripe-Signature: t=1700000000,v1=5257a869...,v0=6ffbb59b...
//! ```
//!
//! An endpoint may be configured with several signing secrets (the platform
//! endpoint and the Connect endpoint). They are tried in order and the first
//! one that verifies wins.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::events::VerifiedEvent;

type HmacSha256 = Hmac<Sha256>;

/// A named signing secret. Only the name is ever logged.
#[derive(Clone)]
pub struct WebhookSecret {
    name: String,
    secret: String,
}

impl WebhookSecret {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSecret")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Parsed `Stripe-Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// All `v1` signatures, hex encoded. Stripe sends more than one while a
    /// secret is being rolled.
    pub v1: Vec<String>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> Option<Self> {
        let mut timestamp: Option<i64> = None;
        let mut v1 = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => v1.push(value.to_string()),
                _ => {}
            }
        }

        match timestamp {
            Some(timestamp) if !v1.is_empty() => Some(Self { timestamp, v1 }),
            _ => None,
        }
    }
}

/// Why a single secret did not verify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mismatch {
    InvalidKey,
    Signature,
}

/// Verifies webhook deliveries against an ordered list of signing secrets
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secrets: Vec<WebhookSecret>,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secrets: Vec<WebhookSecret>, tolerance: Duration) -> Self {
        Self { secrets, tolerance }
    }

    pub fn secret_names(&self) -> Vec<&str> {
        self.secrets.iter().map(WebhookSecret::name).collect()
    }

    /// Verify against the current wall clock
    pub fn verify(&self, payload: &[u8], header: &str) -> BillingResult<VerifiedEvent> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.verify_at(payload, header, now)
    }

    /// Verify as if the current time were `now` (unix seconds)
    pub fn verify_at(
        &self,
        payload: &[u8],
        header: &str,
        now: i64,
    ) -> BillingResult<VerifiedEvent> {
        if self.secrets.is_empty() {
            tracing::error!("No webhook signing secrets configured - rejecting delivery");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let parsed = SignatureHeader::parse(header).ok_or_else(|| {
            tracing::warn!(
                header_len = header.len(),
                "Malformed Stripe-Signature header (missing t= or v1=)"
            );
            BillingError::WebhookSignatureInvalid
        })?;

        // `t` is unauthenticated; abs_diff cannot overflow
        let age = now.abs_diff(parsed.timestamp);
        if age > self.tolerance.as_secs() {
            tracing::warn!(
                timestamp = parsed.timestamp,
                now = now,
                diff = age,
                tolerance_secs = self.tolerance.as_secs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let verified_with = self.secrets.iter().find(|candidate| {
            match check_secret(candidate, payload, &parsed) {
                Ok(()) => true,
                Err(mismatch) => {
                    tracing::debug!(
                        secret = candidate.name(),
                        reason = ?mismatch,
                        "Signature verification failed with secret"
                    );
                    false
                }
            }
        });

        let Some(secret) = verified_with else {
            tracing::error!(
                secrets_tried = self.secrets.len(),
                "Failed to verify webhook signature with any configured secret"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        };

        tracing::debug!(secret = secret.name(), "Webhook signature verified");

        VerifiedEvent::from_bytes(payload).inspect_err(|e| {
            tracing::error!(error = %e, "Signed webhook payload is not a valid event");
        })
    }
}

fn check_secret(
    candidate: &WebhookSecret,
    payload: &[u8],
    header: &SignatureHeader,
) -> Result<(), Mismatch> {
    let expected = compute_signature(&candidate.secret, header.timestamp, payload)
        .ok_or(Mismatch::InvalidKey)?;

    let matched = header
        .v1
        .iter()
        .any(|received| bool::from(received.as_bytes().ct_eq(expected.as_bytes())));

    if matched {
        Ok(())
    } else {
        Err(Mismatch::Signature)
    }
}

/// Hex-encoded HMAC-SHA256 of `"<timestamp>.<payload>"` keyed with the full
/// `whsec_...` secret string.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Build a `Stripe-Signature` header value, as Stripe would send it
pub fn sign_header(secret: &str, timestamp: i64, payload: &[u8]) -> Option<String> {
    compute_signature(secret, timestamp, payload).map(|sig| format!("t={},v1={}", timestamp, sig))
}
