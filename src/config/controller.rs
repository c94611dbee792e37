//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables, with the
//! process flags from [`Args`] applied on top.

use crate::config::Args;
use crate::constants::*;
use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Metrics and probe bind address (`host:port`, an empty host means all interfaces)
    pub metrics_addr: String,
    /// Run leader election before starting the controller
    pub enable_leader_election: bool,
    /// Namespace to watch; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Global log level (debug, info)
    pub log_level: String,
    /// Maximum concurrent reconciliations
    pub max_concurrent_reconciles: u16,
    /// Exponential backoff starting value (milliseconds)
    pub backoff_base_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Fraction of each backoff delay that may be randomised away (0.0 - 1.0)
    pub backoff_jitter: f64,
    /// Interval between full resync sweeps (seconds)
    pub resync_interval_secs: u64,
    /// Maximum number of cached plaintexts
    pub cache_max_entries: u64,
    /// How long in-flight reconciles may run after a shutdown signal (seconds)
    pub shutdown_grace_period_secs: u64,
    /// Namespace holding the leader election Lease
    pub leader_election_namespace: String,
    /// Leader election identity (pod name)
    pub identity: String,
    /// Lease duration (seconds)
    pub lease_duration_secs: u64,
    /// Lease renew interval (seconds)
    pub lease_renew_secs: u64,
    /// Lease acquire retry interval (seconds)
    pub lease_retry_secs: u64,
    /// Server startup timeout (seconds)
    pub startup_timeout_secs: u64,
    /// Server readiness poll interval (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: DEFAULT_METRICS_ADDR.to_string(),
            enable_leader_election: false,
            watch_namespace: None,
            log_level: "info".to_string(),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            shutdown_grace_period_secs: DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS,
            leader_election_namespace: "kube-system".to_string(),
            identity: "kms-secrets-controller".to_string(),
            lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
            lease_renew_secs: DEFAULT_LEASE_RENEW_SECS,
            lease_retry_secs: DEFAULT_LEASE_RETRY_SECS,
            startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
        }
    }
}

/// Errors resolving the process configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("mode is namespaced, but unable to determine own namespace name, please set env 'POD_NAMESPACE'")]
    NamespaceUnknown,
    #[error("invalid log level '{0}', expected one of: debug, info")]
    InvalidLogLevel(String),
    #[error("invalid metrics address '{0}'")]
    InvalidMetricsAddr(String),
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let own_namespace = own_namespace();
        Self {
            metrics_addr: env_var_or_default_str("METRICS_ADDR", DEFAULT_METRICS_ADDR),
            enable_leader_election: env_var_or_default_bool("ENABLE_LEADER_ELECTION", false),
            watch_namespace: None,
            log_level: env_var_or_default_str("LOG_LEVEL", "info"),
            max_concurrent_reconciles: env_var_or_default(
                "MAX_CONCURRENT_RECONCILES",
                DEFAULT_MAX_CONCURRENT_RECONCILES,
            ),
            backoff_base_ms: env_var_or_default("BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            backoff_jitter: env_var_or_default("BACKOFF_JITTER", DEFAULT_BACKOFF_JITTER)
                .clamp(0.0, 1.0),
            resync_interval_secs: env_var_or_default(
                "RESYNC_INTERVAL_SECS",
                DEFAULT_RESYNC_INTERVAL_SECS,
            ),
            cache_max_entries: env_var_or_default(
                "DECRYPTION_CACHE_MAX_ENTRIES",
                DEFAULT_CACHE_MAX_ENTRIES,
            ),
            shutdown_grace_period_secs: env_var_or_default(
                "SHUTDOWN_GRACE_PERIOD_SECS",
                DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS,
            ),
            leader_election_namespace: std::env::var("LEADER_ELECTION_NAMESPACE")
                .ok()
                .or(own_namespace)
                .unwrap_or_else(|| "kube-system".to_string()),
            identity: std::env::var("POD_NAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "kms-secrets-controller".to_string()),
            lease_duration_secs: env_var_or_default(
                "LEASE_DURATION_SECS",
                DEFAULT_LEASE_DURATION_SECS,
            ),
            lease_renew_secs: env_var_or_default("LEASE_RENEW_SECS", DEFAULT_LEASE_RENEW_SECS),
            lease_retry_secs: env_var_or_default("LEASE_RETRY_SECS", DEFAULT_LEASE_RETRY_SECS),
            startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
        }
    }

    /// Load from the environment and apply process flags on top
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        Self::from_env().with_args(args, own_namespace())
    }

    /// Apply process flags, resolving namespaced mode against `own_namespace`
    pub fn with_args(
        mut self,
        args: &Args,
        own_namespace: Option<String>,
    ) -> Result<Self, ConfigError> {
        let level = args.log_level.to_lowercase();
        if level != "debug" && level != "info" {
            return Err(ConfigError::InvalidLogLevel(args.log_level.clone()));
        }
        self.log_level = level;

        if args.metrics_addr.rsplit_once(':').is_none() {
            return Err(ConfigError::InvalidMetricsAddr(args.metrics_addr.clone()));
        }
        self.metrics_addr = args.metrics_addr.clone();
        self.enable_leader_election = args.enable_leader_election || self.enable_leader_election;

        if args.namespaced {
            let namespace = own_namespace.ok_or(ConfigError::NamespaceUnknown)?;
            self.watch_namespace = Some(namespace);
        }
        Ok(self)
    }

    /// Socket address for the metrics server; `:8080` binds all interfaces
    pub fn metrics_bind_addr(&self) -> String {
        match self.metrics_addr.rsplit_once(':') {
            Some(("", port)) => format!("0.0.0.0:{port}"),
            _ => self.metrics_addr.clone(),
        }
    }

    /// Tracing filter directive derived from the log level
    pub fn log_filter(&self) -> String {
        format!("kms_secrets_controller={0},kube_runtime=info", self.log_level)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Interval between resync sweeps, never shorter than one second
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_secs(self.lease_renew_secs)
    }

    pub fn lease_retry_interval(&self) -> Duration {
        Duration::from_secs(self.lease_retry_secs)
    }
}

/// Namespace this pod runs in: `POD_NAMESPACE`, else the service account namespace file
pub fn own_namespace() -> Option<String> {
    std::env::var("POD_NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty())
        .or_else(|| {
            std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE)
                .ok()
                .map(|data| data.trim().to_string())
                .filter(|ns| !ns.is_empty())
        })
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let v_lower = v.to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
