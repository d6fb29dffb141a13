//! Webhook signature verification.
//!
//! Signatures are HMAC-SHA256 over `"{timestamp}.{body}"`, sent as a
//! `t=<unix>,v1=<hex>` header. Timestamps outside the tolerance window are
//! rejected to stop replays.

use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::error::BillingError;
use super::event::{BillingEvent, WebhookEnvelope};
use crate::entitlements::PlanCatalog;

type HmacSha256 = Hmac<Sha256>;

/// Default replay window.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies and parses provider webhooks.
pub struct WebhookVerifier {
    secret: SecretString,
    tolerance_secs: i64,
    catalog: PlanCatalog,
}

impl WebhookVerifier {
    /// The secret is stored securely and won't be exposed in debug output.
    pub fn new(secret: impl Into<SecretString>, catalog: PlanCatalog) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
            catalog,
        }
    }

    #[must_use]
    pub fn with_tolerance_secs(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Check the signature and timestamp, then parse the payload.
    pub fn verify_and_parse(&self, payload: &[u8], signature_header: &str) -> Result<BillingEvent, BillingError> {
        self.verify_at(payload, signature_header, Utc::now().timestamp())?;

        let envelope: WebhookEnvelope = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "tierwise::billing::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            BillingError::invalid_payload("malformed JSON payload")
        })?;

        let event = BillingEvent::from_envelope(envelope, &self.catalog)?;
        tracing::debug!(
            target: "tierwise::billing::webhook",
            event_id = %event.provider_event_id,
            event_type = %event.event_type,
            "Webhook verified"
        );
        Ok(event)
    }

    fn verify_at(&self, payload: &[u8], signature_header: &str, now: i64) -> Result<(), BillingError> {
        let parts = parse_signature_header(signature_header)?;

        let age = now - parts.timestamp;
        if age.abs() > self.tolerance_secs {
            tracing::warn!(
                target: "tierwise::billing::webhook",
                age_seconds = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookTimestampExpired { age_seconds: age });
        }

        let expected = compute_signature(self.secret.expose_secret(), parts.timestamp, payload);
        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| expected.ct_eq(&provided).unwrap_u8() == 1)
                .unwrap_or(false)
        });
        if !matched {
            tracing::warn!(target: "tierwise::billing::webhook", "Webhook signature mismatch");
            return Err(BillingError::SignatureInvalid);
        }
        Ok(())
    }
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

struct SignatureParts {
    timestamp: i64,
    /// Every `v1` entry; the provider sends several while rotating secrets.
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> Result<SignatureParts, BillingError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part.split_once('=').ok_or(BillingError::SignatureInvalid)?;
        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
    if signatures.is_empty() {
        return Err(BillingError::SignatureInvalid);
    }
    Ok(SignatureParts {
        timestamp,
        signatures,
    })
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Build a `t=...,v1=...` header for a payload. Used by tests and local tooling.
#[must_use]
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(compute_signature(secret, timestamp, payload))
    )
}
