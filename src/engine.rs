//! The engine facade.
//!
//! [`EntitlementEngine`] wires the catalog, ledger, access gate, reconciler
//! and subscription flows together and exposes the operations callers use.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tierwise::{ConfigBuilder, EntitlementEngine, TrustedIdentityResolver};
//!
//! let config = ConfigBuilder::new().from_env().build()?;
//! let engine = EntitlementEngine::open(config, provider, Arc::new(TrustedIdentityResolver)).await?;
//!
//! let record = engine.sign_in("auth0|abc", "a@example.com", Some("Ada")).await?;
//! let outcome = engine
//!     .check_and_maybe_deny(record.user_id(), &Action::Conversation, None)
//!     .await?;
//! ```

use std::sync::Arc;

use serde_json::json;

use crate::billing::{
    BillingProvider, CheckoutSession, PortalSession, ReconcileOutcome, Reconciler, RedirectUrls,
    SubscriptionManager, WebhookVerifier,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::entitlements::{Action, EntitlementRecord, PlanCatalog, PolicyEngine};
use crate::error::{Result, TierwiseError};
use crate::events::{EventLog, EventSink, LedgerEvent, LedgerEventType, TracingEventSink};
use crate::gate::{AccessGate, EntitlementStatus, GateOutcome, WorkerOptions};
use crate::identity::IdentityResolver;
use crate::ledger::{FileLedgerStore, Ledger, LedgerStore};

/// Entitlement and subscription reconciliation engine.
pub struct EntitlementEngine<S: LedgerStore> {
    config: Config,
    ledger: Ledger<S>,
    policy: PolicyEngine,
    gate: AccessGate<S>,
    reconciler: Reconciler<S>,
    subscriptions: SubscriptionManager<S>,
    verifier: WebhookVerifier,
    resolver: Arc<dyn IdentityResolver>,
    events: Arc<dyn EventSink>,
    event_log: Option<EventLog>,
}

impl EntitlementEngine<FileLedgerStore> {
    /// Open the file-backed ledger and event log under `config.storage`.
    pub async fn open(
        config: Config,
        provider: Arc<dyn BillingProvider>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Result<Self> {
        let store = FileLedgerStore::open(config.storage.ledger_path()).await?;
        let event_log = EventLog::open(
            config.storage.events_path(),
            config.storage.event_log_capacity,
        )
        .await?;

        tracing::info!(
            target: "tierwise::engine",
            data_dir = %config.storage.data_dir.display(),
            "Entitlement engine opened"
        );

        EngineBuilder::new(store, provider)
            .with_config(config)
            .with_resolver(resolver)
            .with_event_log(event_log)
            .build()
    }
}

impl<S: LedgerStore + Clone + 'static> EntitlementEngine<S> {
    #[must_use]
    pub fn builder(store: S, provider: Arc<dyn BillingProvider>) -> EngineBuilder<S> {
        EngineBuilder::new(store, provider)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    #[must_use]
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    #[must_use]
    pub fn gate(&self) -> &AccessGate<S> {
        &self.gate
    }

    /// The bounded event log, when the engine owns one.
    #[must_use]
    pub fn event_log(&self) -> Option<&EventLog> {
        self.event_log.as_ref()
    }

    /// Turn a bearer token into a user id.
    pub async fn resolve_identity(&self, token: &str) -> Result<String> {
        self.resolver.resolve(token).await
    }

    /// Create the user's record on first sign-in, refresh it afterwards.
    pub async fn sign_in(
        &self,
        identity: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<EntitlementRecord> {
        let sign_in = self.ledger.sign_in(identity, email, display_name).await?;
        if sign_in.created {
            self.events
                .record(LedgerEvent::new(
                    LedgerEventType::UserSignedUp,
                    identity,
                    json!({
                        "email": sign_in.record.email,
                        "plan": sign_in.record.subscription_type,
                    }),
                    self.ledger.clock().now(),
                ))
                .await;
        }
        Ok(sign_in.record)
    }

    pub async fn check_and_maybe_deny(
        &self,
        user_id: &str,
        action: &Action,
        required_feature: Option<&str>,
    ) -> Result<GateOutcome> {
        self.gate
            .check_and_maybe_deny(user_id, action, required_feature)
            .await
    }

    /// Queue a completed action for counting. Never waits on the ledger.
    pub fn record_completed_action(&self, user_id: &str, action: &Action, amount: u32) -> Result<()> {
        self.gate.record_completed_action(user_id, action, amount)
    }

    /// Verify a raw webhook and reconcile it.
    pub async fn apply_billing_event(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<ReconcileOutcome> {
        let event = self.verifier.verify_and_parse(raw_body, signature_header)?;
        self.reconciler.apply(&event).await
    }

    pub async fn entitlement_status(&self, user_id: &str) -> Result<EntitlementStatus> {
        self.gate.status(user_id).await
    }

    pub async fn start_checkout(&self, user_id: &str, plan_id: &str) -> Result<CheckoutSession> {
        self.subscriptions.start_checkout(user_id, plan_id).await
    }

    pub async fn open_billing_portal(&self, user_id: &str) -> Result<PortalSession> {
        self.subscriptions.open_portal(user_id).await
    }

    pub async fn cancel_subscription(&self, user_id: &str) -> Result<()> {
        self.subscriptions.cancel_subscription(user_id).await
    }

    /// Drop processed webhook ids past the configured retention.
    pub async fn cleanup_processed_events(&self) -> Result<usize> {
        self.reconciler
            .cleanup_processed_events(self.config.storage.processed_event_retention_days)
            .await
    }

    /// Drain queued consumptions and stop the worker.
    pub async fn shutdown(&self) {
        self.gate.shutdown().await;
        tracing::info!(target: "tierwise::engine", "Entitlement engine stopped");
    }
}

/// Builder for [`EntitlementEngine`].
#[must_use = "builder does nothing until you call build()"]
pub struct EngineBuilder<S: LedgerStore> {
    store: S,
    provider: Arc<dyn BillingProvider>,
    config: Config,
    catalog: Option<PlanCatalog>,
    resolver: Option<Arc<dyn IdentityResolver>>,
    events: Option<Arc<dyn EventSink>>,
    event_log: Option<EventLog>,
    clock: Option<Arc<dyn Clock>>,
}

impl<S: LedgerStore + Clone + 'static> EngineBuilder<S> {
    pub fn new(store: S, provider: Arc<dyn BillingProvider>) -> Self {
        Self {
            store,
            provider,
            config: Config::default(),
            catalog: None,
            resolver: None,
            events: None,
            event_log: None,
            clock: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replace the catalog built from `config.plans`.
    pub fn with_catalog(mut self, catalog: PlanCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self.event_log = None;
        self
    }

    /// Record events to `log` and keep it reachable via [`EntitlementEngine::event_log`].
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.events = Some(Arc::new(log.clone()));
        self.event_log = Some(log);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Assemble the engine and start its consumption worker.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if no webhook secret is configured or no identity
    /// resolver was supplied.
    pub fn build(self) -> Result<EntitlementEngine<S>> {
        let secret = self
            .config
            .billing
            .webhook_secret
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| TierwiseError::bad_request("Webhook secret is required"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| TierwiseError::bad_request("Identity resolver is required"))?;

        let catalog = Arc::new(
            self.catalog
                .unwrap_or_else(|| PlanCatalog::from_config(&self.config.plans)),
        );
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(TracingEventSink));

        let ledger = Ledger::with_clock(self.store, clock);
        let policy = PolicyEngine::from(catalog.clone());
        let gate = AccessGate::new(
            ledger.clone(),
            policy.clone(),
            events.clone(),
            WorkerOptions::from(&self.config.worker),
        );
        let reconciler = Reconciler::new(
            ledger.clone(),
            catalog.clone(),
            self.provider.clone(),
            events.clone(),
        );
        let subscriptions = SubscriptionManager::new(
            ledger.clone(),
            catalog.clone(),
            self.provider,
            RedirectUrls::from(&self.config.billing),
        );
        let verifier = WebhookVerifier::new(secret, catalog.as_ref().clone())
            .with_tolerance_secs(self.config.billing.webhook_tolerance_secs);

        tracing::debug!(
            target: "tierwise::engine",
            plans = ?catalog.plan_ids(),
            "Entitlement engine built"
        );

        Ok(EntitlementEngine {
            config: self.config,
            ledger,
            policy,
            gate,
            reconciler,
            subscriptions,
            verifier,
            resolver,
            events,
            event_log: self.event_log,
        })
    }
}
