//! Quota and feature policy.
//!
//! Pure functions over an [`EntitlementRecord`] and the [`PlanCatalog`]. The
//! current date is always passed in, so nothing here touches a clock or a store.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::error::EntitlementError;
use super::plans::{PlanCatalog, PlanDefinition, Quota};
use super::record::EntitlementRecord;

/// Something a user does that the gate has an opinion about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// One chat conversation. The only metered action.
    Conversation,
    /// Any other named action. Never counted against quota.
    Other(String),
}

impl Action {
    pub fn parse(name: &str) -> Self {
        match name {
            "conversation" => Self::Conversation,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Conversation => "conversation",
            Self::Other(name) => name,
        }
    }

    #[must_use]
    pub fn is_metered(&self) -> bool {
        matches!(self, Self::Conversation)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an action was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    QuotaExceeded,
    FeatureBlocked,
}

/// Outcome of evaluating an action against a record.
///
/// `remaining` and `limit` are `-1` when the action is not limited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub remaining: i64,
    pub limit: i64,
    pub used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl Decision {
    fn unlimited(used: u32) -> Self {
        Self {
            allowed: true,
            remaining: -1,
            limit: -1,
            used,
            reason: None,
        }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.limit < 0
    }

    /// Turn a denial into an error for callers that prefer `?`.
    pub fn require(self) -> Result<Self, EntitlementError> {
        if self.allowed {
            return Ok(self);
        }
        Err(EntitlementError::QuotaExceeded {
            limit: u32::try_from(self.limit).unwrap_or(0),
            used: self.used,
        })
    }
}

/// Evaluates records against the plan catalog.
#[derive(Clone, Debug)]
pub struct PolicyEngine {
    catalog: Arc<PlanCatalog>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(catalog: PlanCatalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// The plan behind a record.
    pub fn plan_of(&self, record: &EntitlementRecord) -> Result<&PlanDefinition, EntitlementError> {
        self.catalog.plan_for(&record.subscription_type)
    }

    /// Decide whether `action` may run now. No side effects.
    pub fn evaluate(
        &self,
        record: &EntitlementRecord,
        action: &Action,
        today: NaiveDate,
    ) -> Result<Decision, EntitlementError> {
        let plan = self.plan_of(record)?;
        let used = record.effective_usage(today);

        if !action.is_metered() {
            return Ok(Decision::unlimited(used));
        }

        match plan.monthly_quota {
            Quota::Unlimited => Ok(Decision::unlimited(used)),
            Quota::Limited(quota) => {
                let allowed = used < quota;
                Ok(Decision {
                    allowed,
                    remaining: i64::from(quota) - i64::from(used),
                    limit: i64::from(quota),
                    used,
                    reason: (!allowed).then_some(DenyReason::QuotaExceeded),
                })
            }
        }
    }

    /// Record `amount` completed uses of `action`, applying the monthly reset first.
    pub fn consume(
        &self,
        record: &EntitlementRecord,
        action: &Action,
        amount: u32,
        today: NaiveDate,
    ) -> Result<EntitlementRecord, EntitlementError> {
        self.plan_of(record)?;

        let mut next = record.clone();
        next.roll_usage_period(today);
        if action.is_metered() {
            next.usage_count = next.usage_count.saturating_add(amount);
        }
        Ok(next)
    }

    /// Plan feature membership. Quota state plays no part.
    pub fn has_feature(
        &self,
        record: &EntitlementRecord,
        feature: &str,
    ) -> Result<bool, EntitlementError> {
        Ok(self.plan_of(record)?.has_feature(feature))
    }

    /// Soft wall: free users who are out of, or down to their last, conversation.
    pub fn should_prompt_upgrade(
        &self,
        record: &EntitlementRecord,
        today: NaiveDate,
    ) -> Result<bool, EntitlementError> {
        let plan = self.plan_of(record)?;
        if !plan.is_free() {
            return Ok(false);
        }
        let decision = self.evaluate(record, &Action::Conversation, today)?;
        Ok(!decision.allowed || matches!(decision.remaining, 0 | 1))
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(PlanCatalog::default_catalog())
    }
}

impl From<Arc<PlanCatalog>> for PolicyEngine {
    fn from(catalog: Arc<PlanCatalog>) -> Self {
        Self { catalog }
    }
}
