//! Storage trait for entitlement records.
//!
//! Implement [`LedgerStore`] to keep records somewhere other than the bundled
//! JSON snapshot. An in-memory implementation is provided for testing.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::LedgerError;
use crate::entitlements::EntitlementRecord;
use crate::error::Result;

/// Keyed store of entitlement records plus the processed webhook event ids.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get the record for a user.
    async fn get(&self, user_id: &str) -> Result<Option<EntitlementRecord>>;

    /// Insert or replace a record.
    ///
    /// If the record is accepted but cannot be persisted, the store keeps it
    /// in memory and returns [`LedgerError::PersistenceWriteFailure`].
    /// Must reject a record whose billing subscription id is already held by
    /// another user with [`LedgerError::SubscriptionConflict`].
    async fn put(&self, record: &EntitlementRecord) -> Result<()>;

    /// All records.
    async fn list(&self) -> Result<Vec<EntitlementRecord>>;

    /// Find a record by billing email (case-insensitive).
    async fn find_by_email(&self, email: &str) -> Result<Option<EntitlementRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.email.eq_ignore_ascii_case(email)))
    }

    async fn find_by_billing_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<EntitlementRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.billing_customer_id.as_deref() == Some(customer_id)))
    }

    async fn find_by_billing_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<EntitlementRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.billing_subscription_id.as_deref() == Some(subscription_id)))
    }

    // Webhook idempotency

    /// Check if a provider event has already been applied.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Remember a provider event as applied.
    ///
    /// Same write-failure contract as [`LedgerStore::put`].
    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;

    /// Forget processed events older than the given age (default: no-op).
    async fn cleanup_old_events(&self, _older_than_days: u32) -> Result<usize> {
        Ok(0)
    }
}

/// Everything a ledger holds. Also the on-disk snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LedgerState {
    #[serde(default)]
    pub records: BTreeMap<String, EntitlementRecord>,
    /// Provider event id to the unix time it was processed.
    #[serde(default)]
    pub processed_events: BTreeMap<String, i64>,
}

impl LedgerState {
    pub fn put(&mut self, record: &EntitlementRecord) -> std::result::Result<(), LedgerError> {
        if let Some(subscription_id) = record.billing_subscription_id.as_deref() {
            let holder = self.records.values().find(|other| {
                other.external_identity != record.external_identity
                    && other.billing_subscription_id.as_deref() == Some(subscription_id)
            });
            if let Some(holder) = holder {
                return Err(LedgerError::SubscriptionConflict {
                    subscription_id: subscription_id.to_string(),
                    held_by: holder.external_identity.clone(),
                });
            }
        }
        self.records
            .insert(record.external_identity.clone(), record.clone());
        Ok(())
    }

    pub fn find(&self, pred: impl Fn(&EntitlementRecord) -> bool) -> Option<EntitlementRecord> {
        self.records.values().find(|r| pred(r)).cloned()
    }

    pub fn mark_processed(&mut self, event_id: &str) {
        self.processed_events
            .insert(event_id.to_string(), Utc::now().timestamp());
    }

    pub fn cleanup_processed(&mut self, older_than_days: u32) -> usize {
        let cutoff = Utc::now().timestamp() - i64::from(older_than_days) * 86_400;
        let initial_len = self.processed_events.len();
        self.processed_events.retain(|_, processed_at| *processed_at >= cutoff);
        initial_len - self.processed_events.len()
    }
}

/// In-memory ledger store for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// In-memory ledger store.
    ///
    /// Wraps data in Arc for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemoryLedgerStore {
        inner: Arc<RwLock<LedgerState>>,
    }

    impl InMemoryLedgerStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Get all processed event ids (for testing).
        pub async fn processed_events(&self) -> Vec<String> {
            self.inner
                .read()
                .await
                .processed_events
                .keys()
                .cloned()
                .collect()
        }

        /// Backdate a processed event (for testing cleanup).
        pub async fn set_processed_at(&self, event_id: &str, unix_secs: i64) {
            self.inner
                .write()
                .await
                .processed_events
                .insert(event_id.to_string(), unix_secs);
        }
    }

    #[async_trait]
    impl LedgerStore for InMemoryLedgerStore {
        async fn get(&self, user_id: &str) -> Result<Option<EntitlementRecord>> {
            Ok(self.inner.read().await.records.get(user_id).cloned())
        }

        async fn put(&self, record: &EntitlementRecord) -> Result<()> {
            self.inner.write().await.put(record)?;
            Ok(())
        }

        async fn list(&self) -> Result<Vec<EntitlementRecord>> {
            Ok(self.inner.read().await.records.values().cloned().collect())
        }

        async fn find_by_email(&self, email: &str) -> Result<Option<EntitlementRecord>> {
            Ok(self
                .inner
                .read()
                .await
                .find(|r| r.email.eq_ignore_ascii_case(email)))
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self
                .inner
                .read()
                .await
                .processed_events
                .contains_key(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner.write().await.mark_processed(event_id);
            Ok(())
        }

        async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
            Ok(self.inner.write().await.cleanup_processed(older_than_days))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::InMemoryLedgerStore;
    use super::*;
    use crate::error::TierwiseError;

    fn record(user: &str, email: &str) -> EntitlementRecord {
        EntitlementRecord::new(user, email, None, Utc::now())
    }

    #[tokio::test]
    async fn test_put_get_list() {
        let store = InMemoryLedgerStore::new();
        assert!(store.get("user_a").await.unwrap().is_none());

        store.put(&record("user_a", "a@example.com")).await.unwrap();
        store.put(&record("user_b", "b@example.com")).await.unwrap();

        let a = store.get("user_a").await.unwrap().unwrap();
        assert_eq!(a.email, "a@example.com");
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_find_by_email_is_case_insensitive() {
        let store = InMemoryLedgerStore::new();
        store.put(&record("user_a", "Alice@Example.com")).await.unwrap();

        let found = store.find_by_email("alice@example.com").await.unwrap();
        assert_eq!(found.unwrap().external_identity, "user_a");
        assert!(store.find_by_email("bob@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_billing_ids() {
        let store = InMemoryLedgerStore::new();
        let mut rec = record("user_a", "a@example.com");
        rec.billing_customer_id = Some("cus_1".to_string());
        rec.billing_subscription_id = Some("sub_1".to_string());
        store.put(&rec).await.unwrap();

        let by_customer = store.find_by_billing_customer_id("cus_1").await.unwrap();
        assert_eq!(by_customer.unwrap().external_identity, "user_a");
        let by_sub = store.find_by_billing_subscription_id("sub_1").await.unwrap();
        assert_eq!(by_sub.unwrap().external_identity, "user_a");
        assert!(store.find_by_billing_customer_id("cus_2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscription_id_is_unique() {
        let store = InMemoryLedgerStore::new();
        let mut a = record("user_a", "a@example.com");
        a.billing_subscription_id = Some("sub_1".to_string());
        store.put(&a).await.unwrap();

        // Rewriting the holder is fine
        store.put(&a).await.unwrap();

        let mut b = record("user_b", "b@example.com");
        b.billing_subscription_id = Some("sub_1".to_string());
        let err = store.put(&b).await.unwrap_err();
        assert!(matches!(
            err,
            TierwiseError::Ledger(LedgerError::SubscriptionConflict { ref held_by, .. }) if held_by == "user_a"
        ));
        assert!(store.get("user_b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_event_idempotency() {
        let store = InMemoryLedgerStore::new();

        assert!(!store.is_event_processed("evt_123").await.unwrap());
        store.mark_event_processed("evt_123").await.unwrap();
        assert!(store.is_event_processed("evt_123").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_old_events() {
        let store = InMemoryLedgerStore::new();
        store.mark_event_processed("evt_new").await.unwrap();
        store
            .set_processed_at("evt_old", Utc::now().timestamp() - 40 * 86_400)
            .await;

        let removed = store.cleanup_old_events(30).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.processed_events().await, vec!["evt_new".to_string()]);
    }
}
