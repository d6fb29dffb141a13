//! Billing provider integration.
//!
//! - [`WebhookVerifier`] checks webhook signatures and normalizes payloads
//!   into [`BillingEvent`]s.
//! - [`Reconciler`] applies those events to the entitlement ledger, once per
//!   provider event id.
//! - [`SubscriptionManager`] runs the user-initiated flows: checkout, the
//!   billing portal and cancellation.
//!
//! The provider is reached only through the [`BillingProvider`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use tierwise::billing::{Reconciler, WebhookVerifier};
//!
//! let verifier = WebhookVerifier::new(secret, catalog.clone());
//! let event = verifier.verify_and_parse(&body, signature_header)?;
//! let outcome = reconciler.apply(&event).await?;
//! ```

mod checkout;
mod client;
mod error;
mod event;
mod reconciler;
pub mod webhook;

pub use checkout::{RedirectUrls, SubscriptionManager};
pub use client::{
    BillingProvider, CheckoutSession, CreateCheckoutSession, PortalSession, ProviderCustomer,
    ProviderSubscription, SubscriptionUpdate,
};
pub use error::BillingError;
pub use event::{BillingEvent, BillingEventType};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use webhook::{sign_payload, WebhookVerifier, DEFAULT_TOLERANCE_SECS};

#[cfg(any(test, feature = "test-billing"))]
pub use client::test::MockBillingProvider;
