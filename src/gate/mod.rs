//! Access gate: allow or deny an action before it runs, count it after.

pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, NaiveDate};
use serde::Serialize;
use serde_json::json;

use crate::entitlements::{
    Action, Decision, DenyReason, EntitlementError, EntitlementRecord, PolicyEngine,
    SubscriptionStatus,
};
use crate::error::Result;
use crate::events::{EventSink, LedgerEvent, LedgerEventType};
use crate::ledger::{Ledger, LedgerStore};

pub use worker::{ConsumptionHandler, ConsumptionJob, ConsumptionWorker, WorkerOptions};

/// Result of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Allowed {
        decision: Decision,
        /// The client should show an upgrade prompt.
        soft_wall: bool,
    },
    Denied(Denial),
}

impl GateOutcome {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// A refused action, rendered as `403` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Denial {
    pub reason: DenyReason,
    pub message: String,
    pub plan: String,
    pub limit: i64,
    pub used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    pub upgrade_required: bool,
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        (StatusCode::FORBIDDEN, Json(self)).into_response()
    }
}

/// Snapshot of what a user can do right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementStatus {
    pub user_id: String,
    pub plan: String,
    pub status: SubscriptionStatus,
    pub used: u32,
    pub limit: i64,
    pub remaining: i64,
    pub features: Vec<String>,
    pub soft_wall: bool,
    pub usage_reset_date: NaiveDate,
    pub current_period_end: Option<DateTime<chrono::Utc>>,
}

/// Applies consumption jobs to the ledger and records `usage_consumed`.
struct UsageRecorder<S: LedgerStore> {
    ledger: Ledger<S>,
    policy: PolicyEngine,
    events: Arc<dyn EventSink>,
}

#[async_trait]
impl<S: LedgerStore + 'static> ConsumptionHandler for UsageRecorder<S> {
    async fn apply(&self, job: &ConsumptionJob) -> Result<()> {
        let today = self.ledger.clock().today();
        let applied = self
            .ledger
            .update_applied(&job.user_id, |record| {
                *record = self.policy.consume(record, &job.action, job.amount, today)?;
                Ok(())
            })
            .await?;

        let Some(applied) = applied else {
            return Err(EntitlementError::UserNotFound {
                user_id: job.user_id.clone(),
            }
            .into());
        };
        // Counted in memory; retrying would count it again
        if let Some(err) = &applied.write_error {
            tracing::warn!(
                target: "tierwise::gate",
                user_id = %job.user_id,
                error = %err,
                "Usage counted but not yet persisted"
            );
        }
        let record = applied.record;

        if job.action.is_metered() {
            self.events
                .record(LedgerEvent::new(
                    LedgerEventType::UsageConsumed,
                    &job.user_id,
                    json!({
                        "action": job.action.as_str(),
                        "amount": job.amount,
                        "usage_count": record.usage_count,
                    }),
                    self.ledger.clock().now(),
                ))
                .await;
        }
        Ok(())
    }
}

/// Checks actions against the policy and defers their consumption.
pub struct AccessGate<S: LedgerStore> {
    ledger: Ledger<S>,
    policy: PolicyEngine,
    worker: ConsumptionWorker,
}

impl<S: LedgerStore + Clone + 'static> AccessGate<S> {
    /// Build the gate and start its consumption worker.
    pub fn new(
        ledger: Ledger<S>,
        policy: PolicyEngine,
        events: Arc<dyn EventSink>,
        options: WorkerOptions,
    ) -> Self {
        let recorder = UsageRecorder {
            ledger: ledger.clone(),
            policy: policy.clone(),
            events,
        };
        let worker = ConsumptionWorker::spawn(Arc::new(recorder), options);
        Self {
            ledger,
            policy,
            worker,
        }
    }

    #[must_use]
    pub fn worker(&self) -> &ConsumptionWorker {
        &self.worker
    }

    /// Load the record with the monthly reset applied and persisted.
    async fn current_record(&self, user_id: &str) -> Result<EntitlementRecord> {
        let record = self
            .ledger
            .get(user_id)
            .await?
            .ok_or(EntitlementError::Unauthenticated)?;

        let today = self.ledger.clock().today();
        if !record.needs_usage_reset(today) {
            return Ok(record);
        }

        let (record, rolled) = self
            .ledger
            .update(user_id, |r| Ok(r.roll_usage_period(today)))
            .await?
            .ok_or(EntitlementError::Unauthenticated)?;
        if rolled {
            tracing::debug!(
                target: "tierwise::gate",
                user_id = %user_id,
                reset_date = %record.usage_reset_date,
                "Monthly usage reset"
            );
        }
        Ok(record)
    }

    /// Decide whether `user_id` may perform `action`, optionally requiring a feature.
    pub async fn check_and_maybe_deny(
        &self,
        user_id: &str,
        action: &Action,
        required_feature: Option<&str>,
    ) -> Result<GateOutcome> {
        let record = self.current_record(user_id).await?;
        let today = self.ledger.clock().today();
        let decision = self.policy.evaluate(&record, action, today)?;

        if !decision.allowed {
            tracing::info!(
                target: "tierwise::gate",
                user_id = %user_id,
                action = %action,
                plan = %record.subscription_type,
                used = decision.used,
                limit = decision.limit,
                "Quota exceeded"
            );
            return Ok(GateOutcome::Denied(Denial {
                reason: DenyReason::QuotaExceeded,
                message: format!(
                    "You have used all {} {} conversations this month",
                    decision.limit, record.subscription_type
                ),
                plan: record.subscription_type,
                limit: decision.limit,
                used: decision.used,
                feature: None,
                upgrade_required: true,
            }));
        }

        if let Some(feature) = required_feature {
            if !self.policy.has_feature(&record, feature)? {
                tracing::info!(
                    target: "tierwise::gate",
                    user_id = %user_id,
                    feature = %feature,
                    plan = %record.subscription_type,
                    "Feature blocked"
                );
                return Ok(GateOutcome::Denied(Denial {
                    reason: DenyReason::FeatureBlocked,
                    message: format!("'{}' is not included in your plan", feature),
                    plan: record.subscription_type,
                    limit: decision.limit,
                    used: decision.used,
                    feature: Some(feature.to_string()),
                    upgrade_required: true,
                }));
            }
        }

        let soft_wall = self.policy.should_prompt_upgrade(&record, today)?;
        Ok(GateOutcome::Allowed {
            decision,
            soft_wall,
        })
    }

    /// Count a completed action. Returns as soon as the job is queued.
    pub fn record_completed_action(&self, user_id: &str, action: &Action, amount: u32) -> Result<()> {
        self.worker.enqueue(ConsumptionJob {
            user_id: user_id.to_string(),
            action: action.clone(),
            amount,
            enqueued_at: self.ledger.clock().now(),
        })
    }

    pub async fn status(&self, user_id: &str) -> Result<EntitlementStatus> {
        let record = self.current_record(user_id).await?;
        let today = self.ledger.clock().today();
        let plan = self.policy.plan_of(&record)?;
        let decision = self.policy.evaluate(&record, &Action::Conversation, today)?;
        let soft_wall = self.policy.should_prompt_upgrade(&record, today)?;

        let mut features: Vec<String> = plan.features.iter().cloned().collect();
        features.sort_unstable();

        Ok(EntitlementStatus {
            user_id: record.external_identity,
            plan: record.subscription_type,
            status: record.subscription_status,
            used: decision.used,
            limit: decision.limit,
            remaining: decision.remaining,
            features,
            soft_wall,
            usage_reset_date: record.usage_reset_date,
            current_period_end: record.current_period_end,
        })
    }

    /// Drain pending consumptions and stop the worker.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
    }
}
