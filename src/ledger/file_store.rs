//! JSON-file ledger store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::snapshot::SnapshotFile;
use super::storage::{LedgerState, LedgerStore};
use crate::entitlements::EntitlementRecord;
use crate::error::Result;

/// Ledger store backed by a single JSON snapshot.
///
/// The whole ledger (records and processed event ids) is loaded at open and
/// rewritten on every mutation. If a write fails the in-memory state keeps the
/// change and the next successful write catches the file up.
#[derive(Clone)]
pub struct FileLedgerStore {
    inner: Arc<FileLedgerStoreInner>,
}

struct FileLedgerStoreInner {
    state: RwLock<LedgerState>,
    file: SnapshotFile,
}

impl FileLedgerStore {
    /// Open the snapshot at `path`, starting empty if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let file = SnapshotFile::new(path);
        let state: LedgerState = file.load().await?;
        tracing::info!(
            target: "tierwise::ledger",
            path = %file.path().display(),
            records = state.records.len(),
            processed_events = state.processed_events.len(),
            "Ledger loaded"
        );
        Ok(Self {
            inner: Arc::new(FileLedgerStoreInner {
                state: RwLock::new(state),
                file,
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.file.path()
    }

    async fn persist(&self) -> Result<()> {
        self.inner.file.write(&self.inner.state).await
    }
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn get(&self, user_id: &str) -> Result<Option<EntitlementRecord>> {
        Ok(self.inner.state.read().await.records.get(user_id).cloned())
    }

    async fn put(&self, record: &EntitlementRecord) -> Result<()> {
        self.inner.state.write().await.put(record)?;
        self.persist().await
    }

    async fn list(&self) -> Result<Vec<EntitlementRecord>> {
        Ok(self.inner.state.read().await.records.values().cloned().collect())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<EntitlementRecord>> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .find(|r| r.email.eq_ignore_ascii_case(email)))
    }

    async fn find_by_billing_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<EntitlementRecord>> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .find(|r| r.billing_customer_id.as_deref() == Some(customer_id)))
    }

    async fn find_by_billing_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<EntitlementRecord>> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .find(|r| r.billing_subscription_id.as_deref() == Some(subscription_id)))
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .processed_events
            .contains_key(event_id))
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        self.inner.state.write().await.mark_processed(event_id);
        self.persist().await
    }

    async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
        let removed = self
            .inner
            .state
            .write()
            .await
            .cleanup_processed(older_than_days);
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TierwiseError;
    use crate::ledger::LedgerError;
    use chrono::Utc;

    #[tokio::test]
    async fn test_reopen_preserves_records_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entitlements.json");

        let mut record = EntitlementRecord::new("user_a", "a@example.com", None, Utc::now());
        record.subscription_type = "premium".to_string();
        record.billing_subscription_id = Some("sub_1".to_string());

        {
            let store = FileLedgerStore::open(&path).await.unwrap();
            store.put(&record).await.unwrap();
            store.mark_event_processed("evt_1").await.unwrap();
        }

        let reopened = FileLedgerStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("user_a").await.unwrap(), Some(record));
        assert!(reopened.is_event_processed("evt_1").await.unwrap());
        assert!(!reopened.is_event_processed("evt_2").await.unwrap());
    }

    #[tokio::test]
    async fn test_conflicting_put_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLedgerStore::open(dir.path().join("ledger.json")).await.unwrap();

        let mut a = EntitlementRecord::new("user_a", "a@example.com", None, Utc::now());
        a.billing_subscription_id = Some("sub_1".to_string());
        store.put(&a).await.unwrap();

        let mut b = EntitlementRecord::new("user_b", "b@example.com", None, Utc::now());
        b.billing_subscription_id = Some("sub_1".to_string());
        assert!(store.put(&b).await.is_err());

        let reopened = FileLedgerStore::open(store.path()).await.unwrap();
        assert!(reopened.get("user_b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_failure_keeps_memory_ahead_of_disk() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let store = FileLedgerStore::open(sub.join("ledger.json")).await.unwrap();
        // A regular file where the snapshot directory should be
        std::fs::write(&sub, b"").unwrap();

        let record = EntitlementRecord::new("user_a", "a@example.com", None, Utc::now());

        let err = store.put(&record).await.unwrap_err();
        assert!(matches!(
            err,
            TierwiseError::Ledger(LedgerError::PersistenceWriteFailure { .. })
        ));
        assert!(store.get("user_a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_puts_all_land_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let store = FileLedgerStore::open(&path).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let record = EntitlementRecord::new(
                    format!("user_{i}"),
                    format!("u{i}@example.com"),
                    None,
                    Utc::now(),
                );
                store.put(&record).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let reopened = FileLedgerStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 20);
    }
}
