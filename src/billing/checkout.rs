//! User-initiated subscription management.
//!
//! Checkout, the self-service billing portal and cancellation all go through
//! the provider. None of them touch the plan directly: the resulting state
//! arrives later as webhooks and is applied by the reconciler.

use std::sync::Arc;

use super::client::{
    BillingProvider, CheckoutSession, CreateCheckoutSession, PortalSession, SubscriptionUpdate,
};
use super::error::BillingError;
use crate::config::BillingConfig;
use crate::entitlements::{EntitlementError, EntitlementRecord, PlanCatalog, SubscriptionStatus};
use crate::error::Result;
use crate::ledger::{Ledger, LedgerStore};

/// Redirect targets handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectUrls {
    pub success_url: String,
    pub cancel_url: String,
    pub portal_return_url: String,
}

impl From<&BillingConfig> for RedirectUrls {
    fn from(config: &BillingConfig) -> Self {
        Self {
            success_url: config.checkout_success_url.clone(),
            cancel_url: config.checkout_cancel_url.clone(),
            portal_return_url: config.portal_return_url.clone(),
        }
    }
}

/// Checkout, portal and cancellation flows.
pub struct SubscriptionManager<S: LedgerStore> {
    ledger: Ledger<S>,
    catalog: Arc<PlanCatalog>,
    provider: Arc<dyn BillingProvider>,
    urls: RedirectUrls,
}

impl<S: LedgerStore> SubscriptionManager<S> {
    pub fn new(
        ledger: Ledger<S>,
        catalog: Arc<PlanCatalog>,
        provider: Arc<dyn BillingProvider>,
        urls: RedirectUrls,
    ) -> Self {
        Self {
            ledger,
            catalog,
            provider,
            urls,
        }
    }

    /// Start a hosted checkout for `plan_id`.
    ///
    /// Creates the provider customer on first use and remembers its id.
    pub async fn start_checkout(&self, user_id: &str, plan_id: &str) -> Result<CheckoutSession> {
        let record = self.record(user_id).await?;

        let plan = self
            .catalog
            .get(plan_id)
            .filter(|plan| !plan.is_free())
            .ok_or_else(|| BillingError::PlanNotPurchasable {
                plan_id: plan_id.to_string(),
            })?;
        let price_id = plan
            .checkout_price()
            .ok_or_else(|| BillingError::PlanNotPurchasable {
                plan_id: plan_id.to_string(),
            })?
            .to_string();

        if record.subscription_type == plan.id
            && record.subscription_status == SubscriptionStatus::Active
        {
            return Err(BillingError::AlreadySubscribed {
                plan_id: plan.id.clone(),
            }
            .into());
        }

        let customer_id = self.ensure_customer(&record).await?;
        let session = self
            .provider
            .create_checkout_session(CreateCheckoutSession {
                customer_id,
                price_id,
                plan_id: plan.id.clone(),
                success_url: self.urls.success_url.clone(),
                cancel_url: self.urls.cancel_url.clone(),
            })
            .await?;

        tracing::info!(
            target: "tierwise::billing::checkout",
            user_id = %user_id,
            plan = %plan.id,
            session_id = %session.id,
            "Checkout session created"
        );
        Ok(session)
    }

    /// Open the provider's self-service portal.
    pub async fn open_portal(&self, user_id: &str) -> Result<PortalSession> {
        let record = self.record(user_id).await?;
        let customer_id = record
            .billing_customer_id
            .ok_or_else(|| BillingError::NoCustomer {
                user_id: user_id.to_string(),
            })?;

        let session = self
            .provider
            .create_portal_session(&customer_id, &self.urls.portal_return_url)
            .await?;
        tracing::debug!(
            target: "tierwise::billing::checkout",
            user_id = %user_id,
            "Billing portal session created"
        );
        Ok(session)
    }

    /// Cancel at the end of the current period.
    ///
    /// The downgrade itself happens when the provider's deletion webhook
    /// arrives.
    pub async fn cancel_subscription(&self, user_id: &str) -> Result<()> {
        let record = self.record(user_id).await?;
        let subscription_id = record
            .billing_subscription_id
            .ok_or_else(|| BillingError::NoSubscription {
                user_id: user_id.to_string(),
            })?;

        self.provider
            .update_subscription(
                &subscription_id,
                SubscriptionUpdate {
                    cancel_at_period_end: Some(true),
                },
            )
            .await?;

        tracing::info!(
            target: "tierwise::billing::checkout",
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Subscription set to cancel at period end"
        );
        Ok(())
    }

    async fn record(&self, user_id: &str) -> Result<EntitlementRecord> {
        self.ledger
            .get(user_id)
            .await?
            .ok_or_else(|| EntitlementError::Unauthenticated.into())
    }

    async fn ensure_customer(&self, record: &EntitlementRecord) -> Result<String> {
        if let Some(id) = &record.billing_customer_id {
            return Ok(id.clone());
        }

        let created = self
            .provider
            .create_or_get_customer(&record.email, record.display_name.as_deref())
            .await?;

        // Another request may have stored a customer in the meantime; keep it
        let stored = self
            .ledger
            .update(record.user_id(), |r| {
                Ok(r.billing_customer_id
                    .get_or_insert_with(|| created.clone())
                    .clone())
            })
            .await?;

        Ok(stored.map(|(_, id)| id).unwrap_or(created))
    }
}
