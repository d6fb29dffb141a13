//! Applies verified billing events to the entitlement ledger.
//!
//! Each provider event id is applied at most once. Duplicate deliveries that
//! race each other are serialized on the event id, and the processed-id set
//! lives in the ledger store so it survives restarts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use serde_json::json;

use super::client::{BillingProvider, ProviderSubscription};
use super::error::BillingError;
use super::event::{BillingEvent, BillingEventType};
use crate::entitlements::{EntitlementRecord, PlanCatalog, SubscriptionStatus};
use crate::error::{Result, TierwiseError};
use crate::events::{EventSink, LedgerEvent, LedgerEventType};
use crate::ledger::{Applied, KeyedLocks, Ledger, LedgerError, LedgerStore};

/// What happened to a billing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The event changed (or was recorded against) this user's entitlements.
    Applied { user_id: String },
    /// Not relevant: unsupported type, non-subscription checkout, stale delete.
    Ignored,
    /// No record matches. The event is not marked processed.
    UserNotFound,
    /// This event id was seen before.
    AlreadyProcessed,
}

/// Billing event reconciler.
pub struct Reconciler<S: LedgerStore> {
    ledger: Ledger<S>,
    catalog: Arc<PlanCatalog>,
    provider: Arc<dyn BillingProvider>,
    events: Arc<dyn EventSink>,
    deliveries: KeyedLocks,
}

impl<S: LedgerStore> Reconciler<S> {
    pub fn new(
        ledger: Ledger<S>,
        catalog: Arc<PlanCatalog>,
        provider: Arc<dyn BillingProvider>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            provider,
            events,
            deliveries: KeyedLocks::new(),
        }
    }

    /// Apply an event, skipping ids that were already processed.
    pub async fn apply(&self, event: &BillingEvent) -> Result<ReconcileOutcome> {
        let _delivery = self.deliveries.lock(&event.provider_event_id).await;
        let store = self.ledger.store();

        if store.is_event_processed(&event.provider_event_id).await? {
            tracing::debug!(
                target: "tierwise::billing::reconciler",
                event_id = %event.provider_event_id,
                "Billing event already processed"
            );
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        let Handled {
            outcome,
            mut write_error,
        } = match &event.event_type {
            BillingEventType::CheckoutCompleted => self.checkout_completed(event).await?,
            BillingEventType::SubscriptionUpdated => self.subscription_updated(event).await?,
            BillingEventType::SubscriptionDeleted => self.subscription_deleted(event).await?,
            BillingEventType::PaymentSucceeded => self.payment_succeeded(event).await?,
            BillingEventType::PaymentFailed => self.payment_failed(event).await?,
            BillingEventType::Other(name) => {
                tracing::debug!(
                    target: "tierwise::billing::reconciler",
                    event_id = %event.provider_event_id,
                    event_type = %name,
                    "Ignoring unhandled billing event"
                );
                ReconcileOutcome::Ignored.into()
            }
        };

        if outcome == ReconcileOutcome::UserNotFound {
            let err = BillingError::UserNotFoundForBillingEvent {
                event_type: event.event_type.to_string(),
                lookup: lookup_description(event),
            };
            tracing::warn!(
                target: "tierwise::billing::reconciler",
                event_id = %event.provider_event_id,
                error = %err,
                "Dropping billing event"
            );
        } else {
            // A change held only in memory still counts: the id is marked so a
            // redelivery cannot apply it a second time
            match store.mark_event_processed(&event.provider_event_id).await {
                Ok(()) => {}
                Err(TierwiseError::Ledger(err @ LedgerError::PersistenceWriteFailure { .. })) => {
                    write_error.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            target: "tierwise::billing::reconciler",
            event_id = %event.provider_event_id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Billing event reconciled"
        );
        if let Some(err) = write_error {
            tracing::error!(
                target: "tierwise::billing::reconciler",
                event_id = %event.provider_event_id,
                error = %err,
                "Billing event applied but not persisted"
            );
            return Err(err.into());
        }
        Ok(outcome)
    }

    /// Forget processed event ids older than `older_than_days`.
    pub async fn cleanup_processed_events(&self, older_than_days: u32) -> Result<usize> {
        let removed = self.ledger.store().cleanup_old_events(older_than_days).await?;
        if removed > 0 {
            tracing::info!(
                target: "tierwise::billing::reconciler",
                removed,
                older_than_days,
                "Cleaned up processed billing events"
            );
        }
        Ok(removed)
    }

    async fn checkout_completed(&self, event: &BillingEvent) -> Result<Handled> {
        if let Some(mode) = event.checkout_mode.as_deref() {
            if mode != "subscription" {
                return Ok(ReconcileOutcome::Ignored.into());
            }
        }
        let Some(subscription_id) = event.subscription_id.clone() else {
            tracing::warn!(
                target: "tierwise::billing::reconciler",
                event_id = %event.provider_event_id,
                "Checkout completed without a subscription"
            );
            return Ok(ReconcileOutcome::Ignored.into());
        };

        let email = self.customer_email(event).await;
        let mut record = match email.as_deref() {
            Some(email) => self.ledger.store().find_by_email(email).await?,
            None => None,
        };
        if record.is_none() {
            if let Some(customer_id) = event.customer_id.as_deref() {
                record = self
                    .ledger
                    .store()
                    .find_by_billing_customer_id(customer_id)
                    .await?;
            }
        }
        let Some(record) = record else {
            return Ok(ReconcileOutcome::UserNotFound.into());
        };

        let needs_subscription = event.plan_hint.is_none()
            || event.period_start.is_none()
            || event.period_end.is_none();
        let fetched = if needs_subscription {
            self.fetch_subscription(&subscription_id).await
        } else {
            None
        };

        let Some(plan_id) = self.paid_plan(event.plan_hint.as_deref()).or_else(|| {
            fetched
                .as_ref()
                .and_then(|s| s.price_id.as_deref())
                .and_then(|price| self.catalog.plan_for_price(price))
                .filter(|plan| !plan.is_free())
                .map(|plan| plan.id.clone())
        }) else {
            tracing::warn!(
                target: "tierwise::billing::reconciler",
                event_id = %event.provider_event_id,
                plan_hint = ?event.plan_hint,
                "Checkout names no purchasable plan"
            );
            return Ok(ReconcileOutcome::Ignored.into());
        };

        let now = self.ledger.clock().now();
        let today = self.ledger.clock().today();
        let (period_start, period_end) = match (event.period_start, event.period_end) {
            (Some(start), Some(end)) => (start, end),
            _ => fetched
                .as_ref()
                .and_then(|s| s.current_period_start.zip(s.current_period_end))
                .unwrap_or_else(|| default_period(now)),
        };

        let customer_id = event.customer_id.clone();
        let plan = plan_id.clone();
        let sub_id = subscription_id.clone();
        let updated = self
            .ledger
            .update_applied(record.user_id(), move |r| {
                r.subscription_type = plan;
                r.subscription_status = SubscriptionStatus::Active;
                if customer_id.is_some() {
                    r.billing_customer_id = customer_id;
                }
                r.billing_subscription_id = Some(sub_id);
                r.current_period_start = Some(period_start);
                r.current_period_end = Some(period_end);
                r.reset_usage(today);
                Ok(())
            })
            .await?;
        let Some(Applied {
            record,
            write_error,
            ..
        }) = updated
        else {
            return Ok(ReconcileOutcome::UserNotFound.into());
        };

        self.emit(
            LedgerEventType::SubscriptionCreated,
            &record,
            json!({
                "plan": plan_id,
                "subscription_id": subscription_id,
                "amount": event.amount,
                "currency": event.currency,
            }),
        )
        .await;
        Ok(Handled::applied(&record, write_error))
    }

    async fn subscription_updated(&self, event: &BillingEvent) -> Result<Handled> {
        let Some(record) = self.find_by_customer_then_subscription(event).await? else {
            return Ok(ReconcileOutcome::UserNotFound.into());
        };

        let hinted = self.paid_plan(event.plan_hint.as_deref());
        if hinted.is_none() {
            tracing::warn!(
                target: "tierwise::billing::reconciler",
                event_id = %event.provider_event_id,
                price_id = ?event.price_id,
                user_id = %record.user_id(),
                "Subscription price maps to no paid plan; keeping current plan"
            );
            if record.is_free() {
                return Ok(ReconcileOutcome::Ignored.into());
            }
        }

        let now = self.ledger.clock().now();
        let today = self.ledger.clock().today();
        let status = event.status.as_deref().map(SubscriptionStatus::from_provider);
        let subscription_id = event.subscription_id.clone();
        let customer_id = event.customer_id.clone();
        let period = event.period_start.zip(event.period_end);

        let updated = self
            .ledger
            .update_applied(record.user_id(), move |r| {
                if let (Some(tracked), Some(incoming)) = (&r.billing_subscription_id, &subscription_id) {
                    if tracked != incoming {
                        return Ok(None);
                    }
                }
                let previous_plan = r.subscription_type.clone();
                if let Some(plan) = hinted {
                    if r.is_free() {
                        r.reset_usage(today);
                    }
                    r.subscription_type = plan;
                }
                if let Some(status) = status {
                    r.subscription_status = status;
                }
                if subscription_id.is_some() {
                    r.billing_subscription_id = subscription_id;
                }
                if r.billing_customer_id.is_none() {
                    r.billing_customer_id = customer_id;
                }
                match period {
                    Some((start, end)) => {
                        r.current_period_start = Some(start);
                        r.current_period_end = Some(end);
                    }
                    None if r.current_period_end.is_none() => {
                        let (start, end) = default_period(now);
                        r.current_period_start = Some(start);
                        r.current_period_end = Some(end);
                    }
                    None => {}
                }
                Ok(Some(previous_plan))
            })
            .await?;
        let (record, previous_plan, write_error) = match updated {
            None => return Ok(ReconcileOutcome::UserNotFound.into()),
            Some(Applied {
                record,
                value: None,
                ..
            }) => {
                tracing::info!(
                    target: "tierwise::billing::reconciler",
                    event_id = %event.provider_event_id,
                    user_id = %record.user_id(),
                    subscription_id = ?event.subscription_id,
                    tracked = ?record.billing_subscription_id,
                    "Ignoring update for a subscription the user no longer holds"
                );
                return Ok(ReconcileOutcome::Ignored.into());
            }
            Some(Applied {
                record,
                value: Some(previous_plan),
                write_error,
            }) => (record, previous_plan, write_error),
        };

        self.emit(
            LedgerEventType::SubscriptionUpdated,
            &record,
            json!({
                "plan": record.subscription_type,
                "previous_plan": previous_plan,
                "status": record.subscription_status,
                "subscription_id": record.billing_subscription_id,
            }),
        )
        .await;
        Ok(Handled::applied(&record, write_error))
    }

    async fn subscription_deleted(&self, event: &BillingEvent) -> Result<Handled> {
        let Some(record) = self.find_by_subscription_then_customer(event).await? else {
            return Ok(ReconcileOutcome::UserNotFound.into());
        };

        let subscription_id = event.subscription_id.clone();
        let updated = self
            .ledger
            .update_applied(record.user_id(), move |r| {
                let stale = match (&r.billing_subscription_id, &subscription_id) {
                    (Some(tracked), Some(deleted)) => tracked != deleted,
                    (None, _) => r.is_free(),
                    (Some(_), None) => false,
                };
                if stale {
                    return Ok(None);
                }
                let previous_plan = r.subscription_type.clone();
                r.downgrade_to_free();
                Ok(Some(previous_plan))
            })
            .await?;

        match updated {
            None => Ok(ReconcileOutcome::UserNotFound.into()),
            Some(Applied {
                record,
                value: None,
                ..
            }) => {
                tracing::info!(
                    target: "tierwise::billing::reconciler",
                    event_id = %event.provider_event_id,
                    user_id = %record.user_id(),
                    "Ignoring deletion of a subscription the user no longer holds"
                );
                Ok(ReconcileOutcome::Ignored.into())
            }
            Some(Applied {
                record,
                value: Some(previous_plan),
                write_error,
            }) => {
                self.emit(
                    LedgerEventType::SubscriptionCancelled,
                    &record,
                    json!({
                        "previous_plan": previous_plan,
                        "subscription_id": event.subscription_id,
                    }),
                )
                .await;
                Ok(Handled::applied(&record, write_error))
            }
        }
    }

    async fn payment_succeeded(&self, event: &BillingEvent) -> Result<Handled> {
        let Some(record) = self.find_by_subscription_then_customer(event).await? else {
            return Ok(ReconcileOutcome::UserNotFound.into());
        };

        self.emit(
            LedgerEventType::PaymentSucceeded,
            &record,
            json!({
                "amount": event.amount,
                "currency": event.currency,
                "subscription_id": event.subscription_id,
            }),
        )
        .await;
        Ok(Handled::applied(&record, None))
    }

    async fn payment_failed(&self, event: &BillingEvent) -> Result<Handled> {
        let Some(record) = self.find_by_subscription_then_customer(event).await? else {
            return Ok(ReconcileOutcome::UserNotFound.into());
        };

        let updated = self
            .ledger
            .update_applied(record.user_id(), |r| {
                if !r.is_free() {
                    r.subscription_status = SubscriptionStatus::PastDue;
                }
                Ok(())
            })
            .await?;
        let Some(Applied {
            record,
            write_error,
            ..
        }) = updated
        else {
            return Ok(ReconcileOutcome::UserNotFound.into());
        };

        tracing::warn!(
            target: "tierwise::billing::reconciler",
            user_id = %record.user_id(),
            attempt_count = ?event.attempt_count,
            "Payment failed"
        );
        self.emit(
            LedgerEventType::PaymentFailed,
            &record,
            json!({
                "attempt_count": event.attempt_count,
                "amount": event.amount,
                "currency": event.currency,
                "subscription_id": event.subscription_id,
            }),
        )
        .await;
        Ok(Handled::applied(&record, write_error))
    }

    /// The plan id if it names a known, non-free plan.
    fn paid_plan(&self, hint: Option<&str>) -> Option<String> {
        let plan = self.catalog.get(hint?)?;
        (!plan.is_free()).then(|| plan.id.clone())
    }

    /// Email for the checkout's customer, asking the provider first.
    async fn customer_email(&self, event: &BillingEvent) -> Option<String> {
        if let Some(customer_id) = event.customer_id.as_deref() {
            match self.provider.retrieve_customer(customer_id).await {
                Ok(customer) if customer.email.is_some() => return customer.email,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        target: "tierwise::billing::reconciler",
                        customer_id = %customer_id,
                        error = %e,
                        "Could not retrieve billing customer; using event email"
                    );
                }
            }
        }
        event.customer_email.clone()
    }

    async fn fetch_subscription(&self, subscription_id: &str) -> Option<ProviderSubscription> {
        match self.provider.retrieve_subscription(subscription_id).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!(
                    target: "tierwise::billing::reconciler",
                    subscription_id = %subscription_id,
                    error = %e,
                    "Could not retrieve subscription"
                );
                None
            }
        }
    }

    async fn find_by_customer_then_subscription(
        &self,
        event: &BillingEvent,
    ) -> Result<Option<EntitlementRecord>> {
        let store = self.ledger.store();
        if let Some(customer_id) = event.customer_id.as_deref() {
            if let Some(record) = store.find_by_billing_customer_id(customer_id).await? {
                return Ok(Some(record));
            }
        }
        match event.subscription_id.as_deref() {
            Some(subscription_id) => store.find_by_billing_subscription_id(subscription_id).await,
            None => Ok(None),
        }
    }

    async fn find_by_subscription_then_customer(
        &self,
        event: &BillingEvent,
    ) -> Result<Option<EntitlementRecord>> {
        let store = self.ledger.store();
        if let Some(subscription_id) = event.subscription_id.as_deref() {
            if let Some(record) = store.find_by_billing_subscription_id(subscription_id).await? {
                return Ok(Some(record));
            }
        }
        match event.customer_id.as_deref() {
            Some(customer_id) => store.find_by_billing_customer_id(customer_id).await,
            None => Ok(None),
        }
    }

    async fn emit(
        &self,
        event_type: LedgerEventType,
        record: &EntitlementRecord,
        payload: serde_json::Value,
    ) {
        let event = LedgerEvent::new(event_type, record.user_id(), payload, self.ledger.clock().now());
        self.events.record(event).await;
    }
}

/// A handler's outcome, plus the snapshot write that failed after its change
/// was already applied in memory.
struct Handled {
    outcome: ReconcileOutcome,
    write_error: Option<LedgerError>,
}

impl Handled {
    fn applied(record: &EntitlementRecord, write_error: Option<LedgerError>) -> Self {
        Self {
            outcome: ReconcileOutcome::Applied {
                user_id: record.user_id().to_string(),
            },
            write_error,
        }
    }
}

impl From<ReconcileOutcome> for Handled {
    fn from(outcome: ReconcileOutcome) -> Self {
        Self {
            outcome,
            write_error: None,
        }
    }
}

/// One calendar month from `now`, used when neither the event nor the
/// provider supplies a period.
fn default_period(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = now
        .checked_add_months(Months::new(1))
        .unwrap_or_else(|| now + Duration::days(30));
    (now, end)
}

fn lookup_description(event: &BillingEvent) -> String {
    let mut parts = Vec::new();
    if let Some(id) = &event.subscription_id {
        parts.push(format!("subscription={}", id));
    }
    if let Some(id) = &event.customer_id {
        parts.push(format!("customer={}", id));
    }
    if let Some(email) = &event.customer_email {
        parts.push(format!("email={}", email));
    }
    if parts.is_empty() {
        "no identifiers".to_string()
    } else {
        parts.join(", ")
    }
}
