#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tierwise::billing::{
    sign_payload, BillingProvider, CheckoutSession, CreateCheckoutSession, PortalSession,
    ProviderCustomer, ProviderSubscription, SubscriptionUpdate,
};
use tierwise::config::WorkerConfig;
use tierwise::{
    BillingError, ConfigBuilder, EntitlementEngine, FileLedgerStore, Result,
    TrustedIdentityResolver,
};

pub const SECRET: &str = "whsec_integration";

/// Provider stub that knows customers by email and nothing else.
#[derive(Default)]
pub struct StubProvider {
    counter: AtomicU64,
    customers: Mutex<HashMap<String, ProviderCustomer>>,
    cancelled: Mutex<Vec<String>>,
}

impl StubProvider {
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn missing(operation: &str) -> tierwise::TierwiseError {
        BillingError::ProviderError {
            operation: operation.to_string(),
            message: "not found".to_string(),
            http_status: Some(404),
        }
        .into()
    }
}

#[async_trait]
impl BillingProvider for StubProvider {
    async fn create_or_get_customer(&self, email: &str, name: Option<&str>) -> Result<String> {
        let mut customers = self.customers.lock().unwrap();
        if let Some(existing) = customers.values().find(|c| c.email.as_deref() == Some(email)) {
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
        self.customers
            .lock()
            .unwrap()
            .get(customer_id)
            .cloned()
            .ok_or_else(|| Self::missing("retrieve_customer"))
    }

    async fn create_checkout_session(&self, _request: CreateCheckoutSession) -> Result<CheckoutSession> {
        let id = self.next_id("cs");
        Ok(CheckoutSession {
            url: format!("https://pay.example.com/{}", id),
            id,
        })
    }

    async fn create_portal_session(&self, _customer_id: &str, _return_url: &str) -> Result<PortalSession> {
        let id = self.next_id("bps");
        Ok(PortalSession {
            url: format!("https://portal.example.com/{}", id),
            id,
        })
    }

    async fn retrieve_subscription(&self, _subscription_id: &str) -> Result<ProviderSubscription> {
        Err(Self::missing("retrieve_subscription"))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: SubscriptionUpdate,
    ) -> Result<ProviderSubscription> {
        if update.cancel_at_period_end == Some(true) {
            self.cancelled.lock().unwrap().push(subscription_id.to_string());
        }
        Ok(ProviderSubscription {
            id: subscription_id.to_string(),
            customer_id: String::new(),
            status: "active".to_string(),
            price_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: update.cancel_at_period_end.unwrap_or(false),
        })
    }
}

/// Open a file-backed engine under `dir`.
pub async fn open_engine(dir: &Path, provider: Arc<StubProvider>) -> EntitlementEngine<FileLedgerStore> {
    let config = ConfigBuilder::new()
        .with_data_dir(dir)
        .with_webhook_secret(SECRET)
        .with_worker(WorkerConfig {
            max_attempts: 3,
            retry_backoff_ms: 1,
            lane_idle_secs: 1,
        })
        .build()
        .unwrap();
    EntitlementEngine::open(config, provider, Arc::new(TrustedIdentityResolver))
        .await
        .unwrap()
}

/// Serialize and sign a webhook body.
pub fn signed(body: &Value) -> (Vec<u8>, String) {
    let raw = serde_json::to_vec(body).unwrap();
    let header = sign_payload(SECRET, &raw, chrono::Utc::now().timestamp());
    (raw, header)
}

pub fn checkout_completed(event_id: &str, email: &str, subscription_id: &str, plan: &str) -> Value {
    serde_json::json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": chrono::Utc::now().timestamp(),
        "data": { "object": {
            "mode": "subscription",
            "customer": format!("cus_{}", subscription_id),
            "subscription": subscription_id,
            "customer_email": email,
            "metadata": { "plan": plan },
            "amount_total": 999,
            "currency": "usd"
        }}
    })
}

pub fn subscription_deleted(event_id: &str, subscription_id: &str) -> Value {
    serde_json::json!({
        "id": event_id,
        "type": "customer.subscription.deleted",
        "data": { "object": {
            "id": subscription_id,
            "customer": format!("cus_{}", subscription_id),
            "status": "canceled"
        }}
    })
}
