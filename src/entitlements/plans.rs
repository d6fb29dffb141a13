//! Plan catalog: quotas, features and the static price table.
//!
//! ```rust
//! use tierwise::entitlements::{PlanCatalog, Quota};
//!
//! let catalog = PlanCatalog::builder()
//!     .plan("free")
//!         .monthly_quota(3)
//!         .features(["chat"])
//!         .done()
//!     .plan("premium")
//!         .unlimited()
//!         .features(["chat", "voice_mode"])
//!         .price("price_premium_monthly")
//!         .done()
//!     .build();
//!
//! assert_eq!(catalog.plan_for("free").unwrap().monthly_quota, Quota::Limited(3));
//! assert_eq!(catalog.plan_for_price("price_premium_monthly").unwrap().id, "premium");
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::error::EntitlementError;
use crate::config::PlansConfig;

pub const FREE: &str = "free";
pub const PREMIUM: &str = "premium";
pub const THERAPY: &str = "therapy";

/// Feature identifiers granted by the default plans.
pub mod features {
    pub const CHAT: &str = "chat";
    pub const CONVERSATION_HISTORY: &str = "conversation_history";
    pub const VOICE_MODE: &str = "voice_mode";
    pub const INSIGHTS: &str = "insights";
    pub const THERAPIST_SESSIONS: &str = "therapist_sessions";
    pub const SESSION_NOTES: &str = "session_notes";
}

/// Monthly allowance for the metered action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quota {
    Limited(u32),
    Unlimited,
}

impl Quota {
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// The numeric ceiling, if any.
    #[must_use]
    pub fn limit(&self) -> Option<u32> {
        match self {
            Self::Limited(n) => Some(*n),
            Self::Unlimited => None,
        }
    }
}

/// A single plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanDefinition {
    /// Plan identifier (e.g., "free", "premium").
    pub id: String,
    /// Display name for the plan.
    pub display_name: Option<String>,
    pub monthly_quota: Quota,
    pub features: HashSet<String>,
    /// Provider price IDs that map to this plan.
    pub price_ids: Vec<String>,
}

impl PlanDefinition {
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.id == FREE
    }

    /// The price used when starting a checkout for this plan.
    #[must_use]
    pub fn checkout_price(&self) -> Option<&str> {
        self.price_ids.first().map(String::as_str)
    }
}

/// The set of known plans.
#[derive(Clone, Debug, Default)]
pub struct PlanCatalog {
    plans: HashMap<String, PlanDefinition>,
}

impl PlanCatalog {
    /// Create a builder for constructing a catalog.
    #[must_use]
    pub fn builder() -> PlanCatalogBuilder {
        PlanCatalogBuilder::default()
    }

    /// The stock free / premium / therapy catalog without price IDs.
    #[must_use]
    pub fn default_catalog() -> Self {
        Self::from_config(&PlansConfig::default())
    }

    /// Build the stock catalog with the configured free quota and price table.
    #[must_use]
    pub fn from_config(config: &PlansConfig) -> Self {
        let premium_features = [
            features::CHAT,
            features::CONVERSATION_HISTORY,
            features::VOICE_MODE,
            features::INSIGHTS,
        ];

        Self::builder()
            .plan(FREE)
            .display_name("Free")
            .monthly_quota(config.free_monthly_quota)
            .features([features::CHAT])
            .done()
            .plan(PREMIUM)
            .display_name("Premium")
            .unlimited()
            .features(premium_features)
            .prices(config.premium_price_ids.iter().cloned())
            .done()
            .plan(THERAPY)
            .display_name("Therapy")
            .unlimited()
            .features(premium_features)
            .features([features::THERAPIST_SESSIONS, features::SESSION_NOTES])
            .prices(config.therapy_price_ids.iter().cloned())
            .done()
            .build()
    }

    /// Resolve a stored subscription type.
    ///
    /// Unknown types are an error, never an implicit deny.
    pub fn plan_for(&self, plan_id: &str) -> Result<&PlanDefinition, EntitlementError> {
        self.plans
            .get(plan_id)
            .ok_or_else(|| EntitlementError::UnknownPlan {
                plan_id: plan_id.to_string(),
            })
    }

    #[must_use]
    pub fn get(&self, plan_id: &str) -> Option<&PlanDefinition> {
        self.plans.get(plan_id)
    }

    #[must_use]
    pub fn contains(&self, plan_id: &str) -> bool {
        self.plans.contains_key(plan_id)
    }

    /// Find the plan a provider price belongs to.
    #[must_use]
    pub fn plan_for_price(&self, price_id: &str) -> Option<&PlanDefinition> {
        self.plans
            .values()
            .find(|p| p.price_ids.iter().any(|id| id == price_id))
    }

    #[must_use]
    pub fn plan_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.plans.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanDefinition> {
        self.plans.values()
    }
}

/// Builder for a [`PlanCatalog`].
#[derive(Debug, Default)]
pub struct PlanCatalogBuilder {
    plans: HashMap<String, PlanDefinition>,
}

impl PlanCatalogBuilder {
    /// Start defining a new plan.
    #[must_use]
    pub fn plan(self, id: &str) -> PlanBuilder {
        PlanBuilder {
            parent: self,
            plan: PlanDefinition {
                id: id.to_string(),
                display_name: None,
                monthly_quota: Quota::Unlimited,
                features: HashSet::new(),
                price_ids: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn build(self) -> PlanCatalog {
        PlanCatalog { plans: self.plans }
    }
}

/// Builder for a single plan.
#[derive(Debug)]
pub struct PlanBuilder {
    parent: PlanCatalogBuilder,
    plan: PlanDefinition,
}

impl PlanBuilder {
    #[must_use]
    pub fn display_name(mut self, name: &str) -> Self {
        self.plan.display_name = Some(name.to_string());
        self
    }

    /// Limit the metered action to `n` uses per calendar month.
    #[must_use]
    pub fn monthly_quota(mut self, n: u32) -> Self {
        self.plan.monthly_quota = Quota::Limited(n);
        self
    }

    #[must_use]
    pub fn unlimited(mut self) -> Self {
        self.plan.monthly_quota = Quota::Unlimited;
        self
    }

    /// Add features to this plan.
    #[must_use]
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan.features.extend(features.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn price(mut self, price_id: &str) -> Self {
        self.plan.price_ids.push(price_id.to_string());
        self
    }

    #[must_use]
    pub fn prices<I, S>(mut self, price_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan.price_ids.extend(price_ids.into_iter().map(Into::into));
        self
    }

    /// Finish this plan and return to the catalog builder.
    #[must_use]
    pub fn done(self) -> PlanCatalogBuilder {
        let mut parent = self.parent;
        parent.plans.insert(self.plan.id.clone(), self.plan);
        parent
    }
}
