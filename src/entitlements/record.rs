//! Per-user entitlement record.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plans::FREE;

/// Subscription state as tracked locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    Cancelled,
    PastDue,
    Unpaid,
}

impl SubscriptionStatus {
    /// Map a provider subscription status onto the local states.
    ///
    /// Anything not recognized counts as cancelled.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" | "trialing" => Self::Active,
            "past_due" | "incomplete" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            _ => Self::Cancelled,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First day of the month containing `date`.
#[must_use]
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Authoritative entitlement state for one user, keyed by external identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub id: Uuid,
    pub external_identity: String,
    pub email: String,
    pub display_name: Option<String>,
    /// Plan id. Kept as a string so corrupted values surface as unknown plans.
    pub subscription_type: String,
    pub subscription_status: SubscriptionStatus,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub usage_count: u32,
    /// First day of the month the counter was last reset.
    pub usage_reset_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
}

impl EntitlementRecord {
    /// A fresh free-plan record, as created on first sign-in.
    pub fn new(
        external_identity: impl Into<String>,
        email: impl Into<String>,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_identity: external_identity.into(),
            email: email.into(),
            display_name,
            subscription_type: FREE.to_string(),
            subscription_status: SubscriptionStatus::Active,
            billing_customer_id: None,
            billing_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
            usage_count: 0,
            usage_reset_date: month_start(now.date_naive()),
            created_at: now,
            updated_at: now,
            last_login_at: now,
        }
    }

    /// The key this record is stored under.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.external_identity
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.subscription_type == FREE
    }

    /// True if `today` falls in a later calendar month than the last reset.
    #[must_use]
    pub fn needs_usage_reset(&self, today: NaiveDate) -> bool {
        month_start(today) > month_start(self.usage_reset_date)
    }

    /// Usage as it would read after the lazy monthly reset.
    #[must_use]
    pub fn effective_usage(&self, today: NaiveDate) -> u32 {
        if self.needs_usage_reset(today) {
            0
        } else {
            self.usage_count
        }
    }

    /// Apply the lazy monthly reset. Returns true if anything changed.
    pub fn roll_usage_period(&mut self, today: NaiveDate) -> bool {
        if !self.needs_usage_reset(today) {
            return false;
        }
        self.usage_count = 0;
        self.usage_reset_date = month_start(today);
        true
    }

    /// Zero usage for the current month, as done when moving onto a paid plan.
    pub fn reset_usage(&mut self, today: NaiveDate) {
        self.usage_count = 0;
        self.usage_reset_date = month_start(today);
    }

    /// Drop back to the free plan after a subscription ends.
    pub fn downgrade_to_free(&mut self) {
        self.subscription_type = FREE.to_string();
        self.subscription_status = SubscriptionStatus::Cancelled;
        self.billing_subscription_id = None;
        self.current_period_start = None;
        self.current_period_end = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record_at(y: i32, m: u32, d: u32) -> EntitlementRecord {
        let now = Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap();
        EntitlementRecord::new("auth0|abc", "a@example.com", None, now)
    }

    #[test]
    fn test_new_record_is_free() {
        let record = record_at(2024, 3, 17);
        assert!(record.is_free());
        assert_eq!(record.subscription_status, SubscriptionStatus::Active);
        assert_eq!(record.usage_count, 0);
        assert_eq!(record.usage_reset_date, date(2024, 3, 1));
        assert_eq!(record.user_id(), "auth0|abc");
        assert!(record.billing_subscription_id.is_none());
    }

    #[test]
    fn test_roll_usage_period() {
        let mut record = record_at(2024, 3, 17);
        record.usage_count = 3;

        assert!(!record.roll_usage_period(date(2024, 3, 31)));
        assert_eq!(record.usage_count, 3);

        assert_eq!(record.effective_usage(date(2024, 4, 1)), 0);
        assert_eq!(record.usage_count, 3);

        assert!(record.roll_usage_period(date(2024, 4, 1)));
        assert_eq!(record.usage_count, 0);
        assert_eq!(record.usage_reset_date, date(2024, 4, 1));
    }

    #[test]
    fn test_reset_across_year_boundary() {
        let mut record = record_at(2023, 12, 20);
        record.usage_count = 2;
        assert!(record.needs_usage_reset(date(2024, 1, 2)));
        // A clock that runs backwards never resets
        assert!(!record.needs_usage_reset(date(2023, 11, 2)));
    }

    #[test]
    fn test_downgrade_to_free() {
        let mut record = record_at(2024, 3, 17);
        record.subscription_type = "premium".to_string();
        record.billing_customer_id = Some("cus_1".to_string());
        record.billing_subscription_id = Some("sub_1".to_string());
        record.current_period_end = Some(Utc::now());

        record.downgrade_to_free();
        assert!(record.is_free());
        assert_eq!(record.subscription_status, SubscriptionStatus::Cancelled);
        assert!(record.billing_subscription_id.is_none());
        assert!(record.current_period_end.is_none());
        // The customer survives so the user can resubscribe
        assert_eq!(record.billing_customer_id.as_deref(), Some("cus_1"));
    }

    #[test]
    fn test_status_from_provider() {
        assert_eq!(SubscriptionStatus::from_provider("trialing"), SubscriptionStatus::Active);
        assert_eq!(SubscriptionStatus::from_provider("incomplete"), SubscriptionStatus::PastDue);
        assert_eq!(SubscriptionStatus::from_provider("unpaid"), SubscriptionStatus::Unpaid);
        assert_eq!(SubscriptionStatus::from_provider("paused"), SubscriptionStatus::Cancelled);
        assert_eq!(SubscriptionStatus::from_provider("canceled"), SubscriptionStatus::Cancelled);
    }

    #[test]
    fn test_serde_round_trip_uses_snake_case_status() {
        let mut record = record_at(2024, 3, 17);
        record.subscription_status = SubscriptionStatus::PastDue;
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["subscription_status"], "past_due");
        let back: EntitlementRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
