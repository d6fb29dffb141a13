//! Billing provider client trait.
//!
//! The engine talks to the payment provider only through [`BillingProvider`].
//! A mock implementation is provided for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A provider-side customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Request to start a hosted checkout for a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCheckoutSession {
    pub customer_id: String,
    pub price_id: String,
    /// Carried as session metadata so the completion webhook can name the plan.
    pub plan_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSession {
    pub id: String,
    pub url: String,
}

/// A provider-side subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub price_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

/// Fields to change on a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub cancel_at_period_end: Option<bool>,
}

/// Operations the engine needs from the payment provider.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Find the customer with this email, or create one.
    async fn create_or_get_customer(&self, email: &str, name: Option<&str>) -> Result<String>;

    async fn retrieve_customer(&self, customer_id: &str) -> Result<ProviderCustomer>;

    async fn create_checkout_session(&self, request: CreateCheckoutSession) -> Result<CheckoutSession>;

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> Result<PortalSession>;

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: SubscriptionUpdate,
    ) -> Result<ProviderSubscription>;
}

/// Mock billing provider for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::BillingError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::RwLock;

    /// In-memory provider with customers, subscriptions and a failure switch.
    #[derive(Default)]
    pub struct MockBillingProvider {
        counter: AtomicU64,
        failing: AtomicBool,
        customers: RwLock<HashMap<String, ProviderCustomer>>,
        subscriptions: RwLock<HashMap<String, ProviderSubscription>>,
        checkouts: RwLock<Vec<CreateCheckoutSession>>,
    }

    impl MockBillingProvider {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every call fail with a 503 until switched back.
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn insert_customer(&self, id: &str, email: &str) {
            self.customers.write().unwrap().insert(
                id.to_string(),
                ProviderCustomer {
                    id: id.to_string(),
                    email: Some(email.to_string()),
                    name: None,
                },
            );
        }

        pub fn insert_subscription(&self, subscription: ProviderSubscription) {
            self.subscriptions
                .write()
                .unwrap()
                .insert(subscription.id.clone(), subscription);
        }

        pub fn subscription(&self, id: &str) -> Option<ProviderSubscription> {
            self.subscriptions.read().unwrap().get(id).cloned()
        }

        /// Checkout requests seen so far (for test assertions).
        pub fn checkouts(&self) -> Vec<CreateCheckoutSession> {
            self.checkouts.read().unwrap().clone()
        }

        pub fn customer_count(&self) -> usize {
            self.customers.read().unwrap().len()
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{}_test_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
        }

        fn check(&self, operation: &str) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BillingError::ProviderError {
                    operation: operation.to_string(),
                    message: "provider unavailable".to_string(),
                    http_status: Some(503),
                }
                .into());
            }
            Ok(())
        }

        fn not_found(operation: &str, id: &str) -> crate::error::TierwiseError {
            BillingError::ProviderError {
                operation: operation.to_string(),
                message: format!("No such object: {}", id),
                http_status: Some(404),
            }
            .into()
        }
    }

    #[async_trait]
    impl BillingProvider for MockBillingProvider {
        async fn create_or_get_customer(&self, email: &str, name: Option<&str>) -> Result<String> {
            self.check("create_or_get_customer")?;
            let mut customers = self.customers.write().unwrap();
            if let Some(existing) = customers
                .values()
                .find(|c| c.email.as_deref() == Some(email))
            {
                return Ok(existing.id.clone());
            }
            let id = self.next_id("cus");
            customers.insert(
                id.clone(),
                ProviderCustomer {
                    id: id.clone(),
                    email: Some(email.to_string()),
                    name: name.map(String::from),
                },
            );
            Ok(id)
        }

        async fn retrieve_customer(&self, customer_id: &str) -> Result<ProviderCustomer> {
            self.check("retrieve_customer")?;
            self.customers
                .read()
                .unwrap()
                .get(customer_id)
                .cloned()
                .ok_or_else(|| Self::not_found("retrieve_customer", customer_id))
        }

        async fn create_checkout_session(
            &self,
            request: CreateCheckoutSession,
        ) -> Result<CheckoutSession> {
            self.check("create_checkout_session")?;
            let id = self.next_id("cs");
            self.checkouts.write().unwrap().push(request);
            Ok(CheckoutSession {
                url: format!("https://checkout.example.com/{}", id),
                id,
            })
        }

        async fn create_portal_session(
            &self,
            customer_id: &str,
            _return_url: &str,
        ) -> Result<PortalSession> {
            self.check("create_portal_session")?;
            let id = self.next_id("bps");
            Ok(PortalSession {
                url: format!("https://billing.example.com/{}/{}", customer_id, id),
                id,
            })
        }

        async fn retrieve_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
            self.check("retrieve_subscription")?;
            self.subscription(subscription_id)
                .ok_or_else(|| Self::not_found("retrieve_subscription", subscription_id))
        }

        async fn update_subscription(
            &self,
            subscription_id: &str,
            update: SubscriptionUpdate,
        ) -> Result<ProviderSubscription> {
            self.check("update_subscription")?;
            let mut subscriptions = self.subscriptions.write().unwrap();
            let subscription = subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| Self::not_found("update_subscription", subscription_id))?;
            if let Some(cancel) = update.cancel_at_period_end {
                subscription.cancel_at_period_end = cancel;
            }
            Ok(subscription.clone())
        }
    }
}
