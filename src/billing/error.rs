//! Billing-specific error types.

use std::fmt;

/// Errors from webhook verification, reconciliation and the billing provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Webhook errors
    /// Webhook signature is missing, malformed or does not match.
    SignatureInvalid,
    /// Webhook timestamp is outside the tolerance window (replay protection).
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },

    // Reconciliation
    /// No entitlement record matches the event. Logged and dropped.
    UserNotFoundForBillingEvent { event_type: String, lookup: String },

    // User-initiated operations
    /// The plan cannot be bought (free, or no price configured).
    PlanNotPurchasable { plan_id: String },
    /// The user already has this plan.
    AlreadySubscribed { plan_id: String },
    /// No billing customer exists for the user yet.
    NoCustomer { user_id: String },
    /// The user has no subscription to cancel.
    NoSubscription { user_id: String },

    // Provider errors
    /// The billing provider returned an error.
    ProviderError {
        operation: String,
        message: String,
        http_status: Option<u16>,
    },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignatureInvalid => write!(f, "Invalid webhook signature"),
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::UserNotFoundForBillingEvent { event_type, lookup } => {
                write!(f, "No user matches {} event ({})", event_type, lookup)
            }
            Self::PlanNotPurchasable { plan_id } => {
                write!(f, "Plan '{}' cannot be purchased", plan_id)
            }
            Self::AlreadySubscribed { plan_id } => {
                write!(f, "Already subscribed to '{}'", plan_id)
            }
            Self::NoCustomer { user_id } => {
                write!(f, "No billing customer found for '{}'", user_id)
            }
            Self::NoSubscription { user_id } => {
                write!(f, "No subscription found for '{}'", user_id)
            }
            Self::ProviderError {
                operation,
                message,
                http_status,
            } => {
                write!(f, "Billing provider error during '{}': {}", operation, message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl BillingError {
    pub(crate) fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidWebhookPayload {
            message: message.into(),
        }
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::SignatureInvalid
            | Self::WebhookTimestampExpired { .. }
            | Self::InvalidWebhookPayload { .. }
            | Self::UserNotFoundForBillingEvent { .. }
            | Self::PlanNotPurchasable { .. }
            | Self::AlreadySubscribed { .. }
            | Self::NoCustomer { .. }
            | Self::NoSubscription { .. } => true,
            Self::ProviderError { http_status, .. } => matches!(http_status, Some(400..=499)),
        }
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            // Rate limit (429) and server errors (5xx) are retryable
            Self::ProviderError { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599) | None)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BillingError::WebhookTimestampExpired { age_seconds: 301 };
        assert_eq!(err.to_string(), "Webhook timestamp expired (301 seconds old)");

        let err = BillingError::ProviderError {
            operation: "create_checkout_session".to_string(),
            message: "card declined".to_string(),
            http_status: Some(402),
        };
        assert_eq!(
            err.to_string(),
            "Billing provider error during 'create_checkout_session': card declined [HTTP 402]"
        );
    }

    #[test]
    fn test_error_classification() {
        let err = BillingError::SignatureInvalid;
        assert!(err.is_client_error());
        assert!(!err.is_retryable());

        let err = BillingError::ProviderError {
            operation: "retrieve_customer".to_string(),
            message: "rate limited".to_string(),
            http_status: Some(429),
        };
        assert!(err.is_client_error());
        assert!(err.is_retryable());

        let err = BillingError::ProviderError {
            operation: "retrieve_customer".to_string(),
            message: "connection reset".to_string(),
            http_status: None,
        };
        assert!(err.is_server_error());
        assert!(err.is_retryable());
    }
}
