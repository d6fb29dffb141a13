use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::engine::EntitlementEngine;
use crate::entitlements::{Action, EntitlementError};
use crate::error::TierwiseError;
use crate::gate::GateOutcome;
use crate::ledger::LedgerStore;

/// Set on allowed responses when the user is close to the free limit.
pub const UPGRADE_PROMPT_HEADER: &str = "x-upgrade-prompt";

/// The caller's resolved identity.
///
/// Inserted by [`authenticate`]; extracting it on a route without that
/// middleware fails with 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

impl AuthenticatedUser {
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.0
    }
}

impl<St> FromRequestParts<St> for AuthenticatedUser
where
    St: Send + Sync,
{
    type Rejection = TierwiseError;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &St,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        Box::pin(async move {
            parts
                .extensions
                .get::<AuthenticatedUser>()
                .cloned()
                .ok_or_else(|| EntitlementError::Unauthenticated.into())
        })
    }
}

/// Extract the bearer token from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Result<String, TierwiseError> {
    let header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .ok_or(EntitlementError::Unauthenticated)?;

    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(EntitlementError::Unauthenticated)?;

    Ok(token.to_string())
}

/// Middleware that resolves the bearer token to a user id.
///
/// # Example
///
/// ```rust,ignore
/// let protected = Router::new()
///     .route("/entitlements/me", get(status))
///     .route_layer(middleware::from_fn_with_state(engine.clone(), authenticate::<FileLedgerStore>));
/// ```
pub async fn authenticate<S>(
    State(engine): State<Arc<EntitlementEngine<S>>>,
    mut request: Request,
    next: Next,
) -> Result<Response, TierwiseError>
where
    S: LedgerStore + Clone + 'static,
{
    let token = bearer_token(request.headers())?;
    let user_id = engine.resolve_identity(&token).await?;
    request.extensions_mut().insert(AuthenticatedUser(user_id));
    Ok(next.run(request).await)
}

/// Gate configuration for [`enforce_entitlement`].
pub struct EntitlementGuard<S: LedgerStore> {
    engine: Arc<EntitlementEngine<S>>,
    action: Action,
    feature: Option<String>,
}

impl<S: LedgerStore> EntitlementGuard<S> {
    pub fn new(engine: Arc<EntitlementEngine<S>>, action: Action) -> Self {
        Self {
            engine,
            action,
            feature: None,
        }
    }

    #[must_use]
    pub fn require_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }
}

impl<S: LedgerStore> Clone for EntitlementGuard<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            action: self.action.clone(),
            feature: self.feature.clone(),
        }
    }
}

/// Middleware that checks the guard's action before the handler runs and
/// counts it after a successful response.
///
/// Denials short-circuit with a 403 JSON body. The allowed [`Decision`] is
/// available to handlers as a request extension.
///
/// Must run after [`authenticate`].
///
/// [`Decision`]: crate::entitlements::Decision
pub async fn enforce_entitlement<S>(
    State(guard): State<EntitlementGuard<S>>,
    mut request: Request,
    next: Next,
) -> Result<Response, TierwiseError>
where
    S: LedgerStore + Clone + 'static,
{
    let user = request
        .extensions()
        .get::<AuthenticatedUser>()
        .cloned()
        .ok_or(EntitlementError::Unauthenticated)?;

    let outcome = guard
        .engine
        .check_and_maybe_deny(user.user_id(), &guard.action, guard.feature.as_deref())
        .await?;

    let (decision, soft_wall) = match outcome {
        GateOutcome::Denied(denial) => return Ok(denial.into_response()),
        GateOutcome::Allowed {
            decision,
            soft_wall,
        } => (decision, soft_wall),
    };

    request.extensions_mut().insert(decision);
    let mut response = next.run(request).await;

    if response.status().is_success() {
        // Once queued the consumption is owned by the worker
        if let Err(e) = guard
            .engine
            .record_completed_action(user.user_id(), &guard.action, 1)
        {
            tracing::error!(
                target: "tierwise::http",
                user_id = %user.user_id(),
                action = %guard.action,
                error = %e,
                "Failed to queue consumption"
            );
        }
        if soft_wall {
            response
                .headers_mut()
                .insert(UPGRADE_PROMPT_HEADER, HeaderValue::from_static("true"));
        }
    }
    Ok(response)
}
