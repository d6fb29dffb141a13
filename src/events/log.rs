//! Bounded event log with optional JSON persistence.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{EventSink, LedgerEvent};
use crate::error::Result;
use crate::ledger::snapshot::SnapshotFile;

/// Keeps the most recent `capacity` events, oldest dropped first.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

struct EventLogInner {
    events: RwLock<VecDeque<LedgerEvent>>,
    capacity: usize,
    file: Option<SnapshotFile>,
}

impl EventLog {
    /// A log that lives only in memory.
    #[must_use]
    pub fn in_memory(capacity: usize) -> Self {
        Self::from_parts(VecDeque::new(), capacity, None)
    }

    /// Open a persisted log, trimming it to `capacity` if the file holds more.
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let file = SnapshotFile::new(path);
        let events: VecDeque<LedgerEvent> = file.load().await?;
        tracing::info!(
            target: "tierwise::events",
            path = %file.path().display(),
            events = events.len(),
            "Event log loaded"
        );
        Ok(Self::from_parts(events, capacity, Some(file)))
    }

    fn from_parts(mut events: VecDeque<LedgerEvent>, capacity: usize, file: Option<SnapshotFile>) -> Self {
        let capacity = capacity.max(1);
        while events.len() > capacity {
            events.pop_front();
        }
        Self {
            inner: Arc::new(EventLogInner {
                events: RwLock::new(events),
                capacity,
                file,
            }),
        }
    }

    /// Append an event and persist the log.
    pub async fn append(&self, event: LedgerEvent) -> Result<()> {
        {
            let mut events = self.inner.events.write().await;
            events.push_back(event);
            while events.len() > self.inner.capacity {
                events.pop_front();
            }
        }
        match &self.inner.file {
            Some(file) => file.write(&self.inner.events).await,
            None => Ok(()),
        }
    }

    /// The newest `limit` events, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<LedgerEvent> {
        let events = self.inner.events.read().await;
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    /// All retained events for one user, oldest first.
    pub async fn for_user(&self, user_id: &str) -> Vec<LedgerEvent> {
        self.inner
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.events.read().await.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

#[async_trait]
impl EventSink for EventLog {
    async fn record(&self, event: LedgerEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.append(event).await {
            tracing::error!(
                target: "tierwise::events",
                event_type = %event_type,
                error = %e,
                "Failed to persist ledger event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LedgerEventType;
    use chrono::Utc;
    use serde_json::json;

    fn event(n: u32) -> LedgerEvent {
        LedgerEvent::new(
            LedgerEventType::UsageConsumed,
            format!("user_{}", n % 2),
            json!({ "n": n }),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_log_is_bounded_and_keeps_newest() {
        let log = EventLog::in_memory(5);
        for n in 0..12 {
            log.append(event(n)).await.unwrap();
        }

        assert_eq!(log.len().await, 5);
        let kept: Vec<u64> = log
            .recent(10)
            .await
            .iter()
            .map(|e| e.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(kept, vec![7, 8, 9, 10, 11]);

        let newest_two = log.recent(2).await;
        assert_eq!(newest_two[1].payload["n"], 11);
    }

    #[tokio::test]
    async fn test_for_user() {
        let log = EventLog::in_memory(10);
        for n in 0..4 {
            log.record(event(n)).await;
        }
        assert_eq!(log.for_user("user_1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_persisted_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");

        {
            let log = EventLog::open(&path, 3).await.unwrap();
            for n in 0..5 {
                log.append(event(n)).await.unwrap();
            }
        }

        let reopened = EventLog::open(&path, 3).await.unwrap();
        let kept: Vec<u64> = reopened
            .recent(3)
            .await
            .iter()
            .map(|e| e.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(kept, vec![2, 3, 4]);

        // A smaller capacity trims on open
        let smaller = EventLog::open(&path, 1).await.unwrap();
        assert_eq!(smaller.len().await, 1);
        assert_eq!(smaller.capacity(), 1);
    }
}
