//! Tierwise - subscription entitlements for chat products
//!
//! Tierwise decides what a user may do based on their subscription tier and
//! keeps that state in step with an external billing provider.
//!
//! # Features
//!
//! - **Plans**: a catalog of plans with monthly quotas and feature sets
//! - **Ledger**: per-user entitlement records with serialized mutation and
//!   JSON snapshot persistence
//! - **Access gate**: allow/deny decisions with a soft upgrade wall, and
//!   deferred usage counting on per-user ordered lanes
//! - **Billing**: signed webhook verification, idempotent reconciliation,
//!   checkout, portal and cancellation flows
//! - **HTTP**: axum middleware and routes
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tierwise::{ConfigBuilder, EntitlementEngine, TrustedIdentityResolver};
//!
//! #[tokio::main]
//! async fn main() -> tierwise::Result<()> {
//!     tierwise::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let engine = Arc::new(
//!         EntitlementEngine::open(config, provider, Arc::new(TrustedIdentityResolver)).await?,
//!     );
//!
//!     let app = tierwise::http::router(engine.clone());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//!     axum::serve(listener, app).await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod billing;
pub mod clock;
pub mod config;
mod engine;
pub mod entitlements;
mod error;
pub mod events;
pub mod gate;
pub mod http;
pub mod identity;
pub mod ledger;
pub mod utils;

// Re-exports for public API
pub use billing::{BillingError, BillingEvent, BillingProvider, ReconcileOutcome};
pub use config::{Config, ConfigBuilder, LoggingConfig};
pub use engine::{EngineBuilder, EntitlementEngine};
pub use entitlements::{
    Action, Decision, EntitlementError, EntitlementRecord, PlanCatalog, PolicyEngine,
    SubscriptionStatus,
};
pub use error::{ErrorResponse, Result, TierwiseError};
pub use events::{EventLog, EventSink, LedgerEvent, LedgerEventType};
pub use gate::{Denial, EntitlementStatus, GateOutcome};
pub use identity::{IdentityResolver, StaticTokenResolver, TrustedIdentityResolver};
pub use ledger::{FileLedgerStore, Ledger, LedgerError, LedgerStore};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before opening the engine.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "tierwise=debug")
/// - `TIERWISE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
