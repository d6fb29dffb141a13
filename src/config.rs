use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::TierwiseError;
use crate::utils::{get_env_list, get_env_with_prefix};

/// Main configuration for the entitlement engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub plans: PlansConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// Where the ledger and event log snapshots live.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,
    #[serde(default = "default_events_file")]
    pub events_file: String,
    /// Most recent ledger events kept (default: 10,000)
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
    #[serde(default = "default_retention_days")]
    pub processed_event_retention_days: u32,
}

impl StorageConfig {
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(&self.ledger_file)
    }

    #[must_use]
    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join(&self.events_file)
    }
}

/// Configurable parts of the plan catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlansConfig {
    #[serde(default = "default_free_quota")]
    pub free_monthly_quota: u32,
    /// Provider price ids that map to premium
    #[serde(default)]
    pub premium_price_ids: Vec<String>,
    /// Provider price ids that map to therapy
    #[serde(default)]
    pub therapy_price_ids: Vec<String>,
}

/// Billing provider settings.
#[derive(Clone, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Webhook signing secret. Never serialized.
    #[serde(default, skip_serializing)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_secs: i64,
    #[serde(default = "default_success_url")]
    pub checkout_success_url: String,
    #[serde(default = "default_cancel_url")]
    pub checkout_cancel_url: String,
    #[serde(default = "default_portal_return_url")]
    pub portal_return_url: String,
}

impl fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BillingConfig")
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("checkout_success_url", &self.checkout_success_url)
            .field("checkout_cancel_url", &self.checkout_cancel_url)
            .field("portal_return_url", &self.portal_return_url)
            .finish()
    }
}

/// Deferred consumption worker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Seconds before an idle per-user lane shuts down
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ledger_file: default_ledger_file(),
            events_file: default_events_file(),
            event_log_capacity: default_event_log_capacity(),
            processed_event_retention_days: default_retention_days(),
        }
    }
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            free_monthly_quota: default_free_quota(),
            premium_price_ids: Vec::new(),
            therapy_price_ids: Vec::new(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance(),
            checkout_success_url: default_success_url(),
            checkout_cancel_url: default_cancel_url(),
            portal_return_url: default_portal_return_url(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lane_idle_secs: default_lane_idle_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_ledger_file() -> String {
    "entitlements.json".to_string()
}

fn default_events_file() -> String {
    "events.json".to_string()
}

fn default_event_log_capacity() -> usize {
    10_000
}

fn default_retention_days() -> u32 {
    30
}

fn default_free_quota() -> u32 {
    3
}

fn default_webhook_tolerance() -> i64 {
    crate::billing::DEFAULT_TOLERANCE_SECS
}

fn default_success_url() -> String {
    "http://localhost:3000/billing/success".to_string()
}

fn default_cancel_url() -> String {
    "http://localhost:3000/billing/cancel".to_string()
}

fn default_portal_return_url() -> String {
    "http://localhost:3000/account".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_lane_idle_secs() -> u64 {
    30
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.config.storage.data_dir = data_dir.into();
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.config.storage.event_log_capacity = capacity;
        self
    }

    pub fn with_plans(mut self, plans: PlansConfig) -> Self {
        self.config.plans = plans;
        self
    }

    pub fn with_free_monthly_quota(mut self, quota: u32) -> Self {
        self.config.plans.free_monthly_quota = quota;
        self
    }

    pub fn with_billing(mut self, billing: BillingConfig) -> Self {
        self.config.billing = billing;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.billing.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.config.worker = worker;
        self
    }

    /// Load configuration from environment variables with TIERWISE_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        let storage = &mut self.config.storage;
        if let Some(dir) = get_env_with_prefix("DATA_DIR") {
            storage.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = get_env_with_prefix("LEDGER_FILE") {
            storage.ledger_file = file;
        }
        if let Some(file) = get_env_with_prefix("EVENTS_FILE") {
            storage.events_file = file;
        }
        if let Some(capacity) = parse_env("EVENT_LOG_CAPACITY") {
            storage.event_log_capacity = capacity;
        }
        if let Some(days) = parse_env("PROCESSED_EVENT_RETENTION_DAYS") {
            storage.processed_event_retention_days = days;
        }

        let plans = &mut self.config.plans;
        if let Some(quota) = parse_env("FREE_MONTHLY_QUOTA") {
            plans.free_monthly_quota = quota;
        }
        if let Some(ids) = get_env_list("PREMIUM_PRICE_IDS") {
            plans.premium_price_ids = ids;
        }
        if let Some(ids) = get_env_list("THERAPY_PRICE_IDS") {
            plans.therapy_price_ids = ids;
        }

        let billing = &mut self.config.billing;
        if let Some(secret) = get_env_with_prefix("WEBHOOK_SECRET") {
            billing.webhook_secret = Some(secret);
        }
        if let Some(tolerance) = parse_env("WEBHOOK_TOLERANCE_SECS") {
            billing.webhook_tolerance_secs = tolerance;
        }
        if let Some(url) = get_env_with_prefix("CHECKOUT_SUCCESS_URL") {
            billing.checkout_success_url = url;
        }
        if let Some(url) = get_env_with_prefix("CHECKOUT_CANCEL_URL") {
            billing.checkout_cancel_url = url;
        }
        if let Some(url) = get_env_with_prefix("PORTAL_RETURN_URL") {
            billing.portal_return_url = url;
        }

        let worker = &mut self.config.worker;
        if let Some(attempts) = parse_env("CONSUMPTION_MAX_ATTEMPTS") {
            worker.max_attempts = attempts;
        }
        if let Some(ms) = parse_env("CONSUMPTION_RETRY_BACKOFF_MS") {
            worker.retry_backoff_ms = ms;
        }
        if let Some(secs) = parse_env("CONSUMPTION_LANE_IDLE_SECS") {
            worker.lane_idle_secs = secs;
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration is invalid:
    /// - Invalid log level
    /// - Zero event log capacity or worker attempts
    /// - Empty webhook secret or non-positive webhook tolerance
    pub fn build(self) -> crate::error::Result<Config> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(TierwiseError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.storage.event_log_capacity == 0 {
            return Err(TierwiseError::bad_request(
                "Event log capacity must be greater than 0",
            ));
        }

        if self.config.storage.ledger_file == self.config.storage.events_file {
            return Err(TierwiseError::bad_request(
                "Ledger and event log must use different files",
            ));
        }

        if self.config.worker.max_attempts == 0 {
            return Err(TierwiseError::bad_request(
                "Consumption max_attempts must be greater than 0",
            ));
        }

        if let Some(secret) = &self.config.billing.webhook_secret {
            if secret.trim().is_empty() {
                return Err(TierwiseError::bad_request("Webhook secret must not be empty"));
            }
        }

        if self.config.billing.webhook_tolerance_secs <= 0 {
            return Err(TierwiseError::bad_request(
                "Webhook tolerance must be greater than 0",
            ));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = get_env_with_prefix(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(
                target: "tierwise::config",
                key = %key,
                value = %raw,
                "Ignoring unparseable configuration value"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.storage.event_log_capacity, 10_000);
        assert_eq!(config.storage.processed_event_retention_days, 30);
        assert_eq!(config.plans.free_monthly_quota, 3);
        assert_eq!(config.billing.webhook_tolerance_secs, 300);
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.worker.retry_backoff_ms, 250);
        assert_eq!(
            config.storage.ledger_path(),
            PathBuf::from("./data/entitlements.json")
        );
    }

    #[test]
    fn test_validation() {
        assert!(ConfigBuilder::new().with_log_level("loud").build().is_err());
        assert!(ConfigBuilder::new().with_event_log_capacity(0).build().is_err());
        assert!(ConfigBuilder::new().with_webhook_secret("  ").build().is_err());
        assert!(ConfigBuilder::new()
            .with_worker(WorkerConfig {
                max_attempts: 0,
                ..WorkerConfig::default()
            })
            .build()
            .is_err());
    }

    #[test]
    fn test_webhook_secret_is_redacted() {
        let config = ConfigBuilder::new()
            .with_webhook_secret("whsec_very_secret")
            .build()
            .unwrap();

        let debug = format!("{:?}", config);
        assert!(!debug.contains("whsec_very_secret"));
        assert!(debug.contains("[REDACTED]"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("whsec_very_secret"));
    }

    #[test]
    fn test_from_env() {
        // SAFETY: only this test touches these variables
        unsafe {
            std::env::set_var("TIERWISE_FREE_MONTHLY_QUOTA", "5");
            std::env::set_var("TIERWISE_PREMIUM_PRICE_IDS", "price_a, price_b");
            std::env::set_var("TIERWISE_CONSUMPTION_MAX_ATTEMPTS", "not-a-number");
        }

        let config = ConfigBuilder::new().from_env().build().unwrap();
        assert_eq!(config.plans.free_monthly_quota, 5);
        assert_eq!(
            config.plans.premium_price_ids,
            vec!["price_a".to_string(), "price_b".to_string()]
        );
        assert_eq!(config.worker.max_attempts, 3);

        unsafe {
            std::env::remove_var("TIERWISE_FREE_MONTHLY_QUOTA");
            std::env::remove_var("TIERWISE_PREMIUM_PRICE_IDS");
            std::env::remove_var("TIERWISE_CONSUMPTION_MAX_ATTEMPTS");
        }
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config = serde_json::from_str(r#"{"plans": {"free_monthly_quota": 10}}"#).unwrap();
        assert_eq!(config.plans.free_monthly_quota, 10);
        assert_eq!(config.worker.lane_idle_secs, 30);
    }
}
