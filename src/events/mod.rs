//! Append-only ledger events.
//!
//! Events describe what happened to a user's entitlements. They are written
//! for analytics and auditing and are never read back to make decisions.

mod log;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use log::EventLog;

/// Kinds of ledger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    UserSignedUp,
    UsageConsumed,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCancelled,
    PaymentSucceeded,
    PaymentFailed,
}

impl LedgerEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserSignedUp => "user_signed_up",
            Self::UsageConsumed => "usage_consumed",
            Self::SubscriptionCreated => "subscription_created",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SubscriptionCancelled => "subscription_cancelled",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
        }
    }
}

impl fmt::Display for LedgerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: LedgerEventType,
    pub user_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn new(
        event_type: LedgerEventType,
        user_id: impl Into<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            user_id: user_id.into(),
            payload,
            timestamp,
        }
    }
}

/// Destination for ledger events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record an event.
    ///
    /// Implementations handle their own failures; recording an event must
    /// never fail the operation that produced it.
    async fn record(&self, event: LedgerEvent);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn record(&self, _event: LedgerEvent) {}
}

/// Sink that writes each event as a structured `tracing` line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(&self, event: LedgerEvent) {
        tracing::info!(
            target: "tierwise::events",
            event_id = %event.id,
            event_type = %event.event_type,
            user_id = %event.user_id,
            payload = %event.payload,
            "Ledger event"
        );
    }
}


#[cfg(test)]
mod tests {
    use super::test::RecordingSink;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_and_tracing_sinks() {
        let event = LedgerEvent::new(
            LedgerEventType::UserSignedUp,
            "user_a",
            json!({"email": "a@example.com"}),
            Utc::now(),
        );
        NoOpEventSink.record(event.clone()).await;
        TracingEventSink.record(event).await;
    }

    #[tokio::test]
    async fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.record(LedgerEvent::new(
            LedgerEventType::UsageConsumed,
            "user_a",
            json!({"action": "conversation", "amount": 1}),
            Utc::now(),
        ))
        .await;
        assert_eq!(sink.types().await, vec![LedgerEventType::UsageConsumed]);
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = LedgerEvent::new(
            LedgerEventType::PaymentFailed,
            "user_a",
            json!({"attempt_count": 2}),
            Utc::now(),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "payment_failed");
        assert_eq!(json["payload"]["attempt_count"], 2);
    }
}
