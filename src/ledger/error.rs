//! Ledger error types.

use std::fmt;

/// Errors raised by ledger stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A snapshot could not be written, even after a retry.
    ///
    /// The in-memory state already holds the change.
    PersistenceWriteFailure { path: String, message: String },
    /// A snapshot exists but could not be read or parsed.
    PersistenceReadFailure { path: String, message: String },
    /// Another record already holds this billing subscription.
    SubscriptionConflict { subscription_id: String, held_by: String },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PersistenceWriteFailure { path, message } => {
                write!(f, "Failed to write snapshot '{}': {}", path, message)
            }
            Self::PersistenceReadFailure { path, message } => {
                write!(f, "Failed to read snapshot '{}': {}", path, message)
            }
            Self::SubscriptionConflict {
                subscription_id,
                held_by,
            } => {
                write!(
                    f,
                    "Subscription '{}' already belongs to '{}'",
                    subscription_id, held_by
                )
            }
        }
    }
}

impl std::error::Error for LedgerError {}

impl LedgerError {
    /// Nothing here is worth retrying from above the store.
    ///
    /// Snapshot writes are already retried once, and a failed write leaves
    /// the change in memory, so re-running the mutation would apply it twice.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LedgerError::SubscriptionConflict {
            subscription_id: "sub_1".to_string(),
            held_by: "user_a".to_string(),
        };
        assert_eq!(err.to_string(), "Subscription 'sub_1' already belongs to 'user_a'");
        assert!(!err.is_retryable());

        let err = LedgerError::PersistenceWriteFailure {
            path: "data/entitlements.json".to_string(),
            message: "disk full".to_string(),
        };
        assert!(!err.is_retryable());
    }
}
