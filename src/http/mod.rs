//! Axum adapter.
//!
//! [`router`] exposes the webhook, status and billing routes.
//! [`authenticate`] and [`enforce_entitlement`] can be layered onto an
//! application's own routes to gate them.

pub mod middleware;
mod routes;

pub use middleware::{
    authenticate, bearer_token, enforce_entitlement, AuthenticatedUser, EntitlementGuard,
    UPGRADE_PROMPT_HEADER,
};
pub use routes::{router, CancelResponse, CheckoutRequest, WebhookAck, SIGNATURE_HEADER};
