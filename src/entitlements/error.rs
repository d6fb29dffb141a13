//! Entitlement error types.

use std::fmt;

/// Errors raised while resolving plans and evaluating entitlements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitlementError {
    /// No verified identity, or no entitlement record for it.
    Unauthenticated,
    /// A stored subscription type does not resolve to a known plan.
    UnknownPlan { plan_id: String },
    /// The metered quota for the current period is used up.
    QuotaExceeded { limit: u32, used: u32 },
    /// The plan does not include the requested feature.
    FeatureBlocked { feature: String, plan_id: String },
    /// No record exists for the user.
    UserNotFound { user_id: String },
}

impl fmt::Display for EntitlementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "Authentication required"),
            Self::UnknownPlan { plan_id } => {
                write!(f, "Unknown subscription plan '{}'", plan_id)
            }
            Self::QuotaExceeded { limit, used } => {
                write!(f, "Monthly quota exceeded ({} of {} used)", used, limit)
            }
            Self::FeatureBlocked { feature, plan_id } => {
                write!(f, "Feature '{}' is not included in plan '{}'", feature, plan_id)
            }
            Self::UserNotFound { user_id } => {
                write!(f, "No entitlement record for '{}'", user_id)
            }
        }
    }
}

impl std::error::Error for EntitlementError {}

impl EntitlementError {
    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::UnknownPlan { .. })
    }

    /// Entitlement errors never go away on their own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }
}
