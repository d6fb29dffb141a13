//! Normalized billing events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::error::BillingError;
use crate::entitlements::PlanCatalog;

/// Provider lifecycle events the reconciler understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEventType {
    CheckoutCompleted,
    SubscriptionUpdated,
    SubscriptionDeleted,
    PaymentSucceeded,
    PaymentFailed,
    /// Anything else, carried by its provider name.
    Other(String),
}

impl BillingEventType {
    #[must_use]
    pub fn from_provider(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" | "invoice.paid" => Self::PaymentSucceeded,
            "invoice.payment_failed" => Self::PaymentFailed,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::CheckoutCompleted => "checkout_completed",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SubscriptionDeleted => "subscription_deleted",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified provider event, reduced to the fields reconciliation uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingEvent {
    pub provider_event_id: String,
    pub event_type: BillingEventType,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    /// Checkout only.
    pub customer_email: Option<String>,
    /// Checkout mode ("subscription", "payment", ...). Checkout only.
    pub checkout_mode: Option<String>,
    /// Plan id from checkout metadata, or resolved from the price.
    pub plan_hint: Option<String>,
    pub price_id: Option<String>,
    pub status: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    /// Minor currency units.
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub attempt_count: Option<u32>,
    pub created: Option<DateTime<Utc>>,
}

/// Raw webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: WebhookEnvelopeData,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WebhookEnvelopeData {
    pub object: Value,
}

impl BillingEvent {
    /// An event with only the id and type set.
    pub fn new(provider_event_id: impl Into<String>, event_type: BillingEventType) -> Self {
        Self {
            provider_event_id: provider_event_id.into(),
            event_type,
            subscription_id: None,
            customer_id: None,
            customer_email: None,
            checkout_mode: None,
            plan_hint: None,
            price_id: None,
            status: None,
            period_start: None,
            period_end: None,
            amount: None,
            currency: None,
            attempt_count: None,
            created: None,
        }
    }

    pub(crate) fn from_envelope(
        envelope: WebhookEnvelope,
        catalog: &PlanCatalog,
    ) -> Result<Self, BillingError> {
        let event_type = BillingEventType::from_provider(&envelope.event_type);
        let mut event = Self::new(envelope.id, event_type);
        event.created = envelope.created.and_then(timestamp);

        let object = &envelope.data.object;
        if !object.is_object() {
            return Err(BillingError::invalid_payload("event object is not a JSON object"));
        }

        match event.event_type {
            BillingEventType::CheckoutCompleted => {
                event.checkout_mode = str_field(object, "mode");
                event.customer_id = str_field(object, "customer");
                event.subscription_id = str_field(object, "subscription");
                event.customer_email = object
                    .get("customer_details")
                    .and_then(|d| str_field(d, "email"))
                    .or_else(|| str_field(object, "customer_email"));
                event.plan_hint = metadata_plan(object);
                event.amount = object.get("amount_total").and_then(Value::as_i64);
                event.currency = str_field(object, "currency");
            }
            BillingEventType::SubscriptionUpdated | BillingEventType::SubscriptionDeleted => {
                event.subscription_id = str_field(object, "id");
                if event.subscription_id.is_none() {
                    return Err(BillingError::invalid_payload("missing subscription id"));
                }
                event.customer_id = str_field(object, "customer");
                event.status = str_field(object, "status");

                let first_item = object
                    .get("items")
                    .and_then(|items| items.get("data"))
                    .and_then(Value::as_array)
                    .and_then(|items| items.first());
                event.price_id = first_item
                    .and_then(|item| item.get("price"))
                    .and_then(|price| str_field(price, "id"));
                event.plan_hint = event
                    .price_id
                    .as_deref()
                    .and_then(|price| catalog.plan_for_price(price))
                    .map(|plan| plan.id.clone())
                    .or_else(|| metadata_plan(object));

                // Newer API versions carry the period on the item
                event.period_start = time_field(object, "current_period_start")
                    .or_else(|| first_item.and_then(|i| time_field(i, "current_period_start")));
                event.period_end = time_field(object, "current_period_end")
                    .or_else(|| first_item.and_then(|i| time_field(i, "current_period_end")));
            }
            BillingEventType::PaymentSucceeded | BillingEventType::PaymentFailed => {
                event.subscription_id = str_field(object, "subscription");
                event.customer_id = str_field(object, "customer");
                event.customer_email = str_field(object, "customer_email");
                event.amount = object
                    .get("amount_paid")
                    .filter(|_| event.event_type == BillingEventType::PaymentSucceeded)
                    .or_else(|| object.get("amount_due"))
                    .and_then(Value::as_i64);
                event.currency = str_field(object, "currency");
                event.attempt_count = object
                    .get("attempt_count")
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok());
            }
            BillingEventType::Other(_) => {}
        }

        Ok(event)
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn time_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value.get(key).and_then(Value::as_i64).and_then(timestamp)
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn metadata_plan(object: &Value) -> Option<String> {
    let metadata = object.get("metadata")?;
    str_field(metadata, "plan")
        .or_else(|| str_field(metadata, "plan_id"))
        .or_else(|| str_field(metadata, "subscription_type"))
}
