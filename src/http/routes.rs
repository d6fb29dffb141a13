use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::middleware::{authenticate, AuthenticatedUser};
use crate::billing::{BillingError, CheckoutSession, PortalSession, ReconcileOutcome};
use crate::engine::EntitlementEngine;
use crate::error::Result;
use crate::gate::EntitlementStatus;
use crate::ledger::LedgerStore;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

type Engine<S> = Arc<EntitlementEngine<S>>;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub cancel_at_period_end: bool,
}

/// Entitlement and billing routes.
///
/// - `POST /billing/webhook` (signature-authenticated)
/// - `GET /entitlements/me`
/// - `POST /billing/checkout`
/// - `POST /billing/portal`
/// - `POST /billing/cancel`
///
/// Everything except the webhook requires a bearer token.
pub fn router<S>(engine: Engine<S>) -> Router
where
    S: LedgerStore + Clone + 'static,
{
    let protected = Router::new()
        .route("/entitlements/me", get(entitlement_status::<S>))
        .route("/billing/checkout", post(start_checkout::<S>))
        .route("/billing/portal", post(open_portal::<S>))
        .route("/billing/cancel", post(cancel_subscription::<S>))
        .route_layer(middleware::from_fn_with_state(
            engine.clone(),
            authenticate::<S>,
        ));

    Router::new()
        .route("/billing/webhook", post(billing_webhook::<S>))
        .merge(protected)
        .with_state(engine)
}

async fn billing_webhook<S>(
    State(engine): State<Engine<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>>
where
    S: LedgerStore + Clone + 'static,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(BillingError::SignatureInvalid)?;

    // Unknown users are acknowledged so the provider stops retrying
    let outcome = engine.apply_billing_event(&body, signature).await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome: match outcome {
            ReconcileOutcome::Applied { .. } => "applied",
            ReconcileOutcome::Ignored => "ignored",
            ReconcileOutcome::UserNotFound => "user_not_found",
            ReconcileOutcome::AlreadyProcessed => "already_processed",
        },
    }))
}

async fn entitlement_status<S>(
    State(engine): State<Engine<S>>,
    user: AuthenticatedUser,
) -> Result<Json<EntitlementStatus>>
where
    S: LedgerStore + Clone + 'static,
{
    Ok(Json(engine.entitlement_status(user.user_id()).await?))
}

async fn start_checkout<S>(
    State(engine): State<Engine<S>>,
    user: AuthenticatedUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutSession>>
where
    S: LedgerStore + Clone + 'static,
{
    Ok(Json(engine.start_checkout(user.user_id(), &request.plan).await?))
}

async fn open_portal<S>(
    State(engine): State<Engine<S>>,
    user: AuthenticatedUser,
) -> Result<Json<PortalSession>>
where
    S: LedgerStore + Clone + 'static,
{
    Ok(Json(engine.open_billing_portal(user.user_id()).await?))
}

async fn cancel_subscription<S>(
    State(engine): State<Engine<S>>,
    user: AuthenticatedUser,
) -> Result<Json<CancelResponse>>
where
    S: LedgerStore + Clone + 'static,
{
    engine.cancel_subscription(user.user_id()).await?;
    Ok(Json(CancelResponse {
        cancel_at_period_end: true,
    }))
}
