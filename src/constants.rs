//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group of the `KMSSecret` custom resource
pub const API_GROUP: &str = "secret.h3poteto.dev";

/// Finalizer guarding cleanup of the generated Secret
pub const FINALIZER: &str = "secret.h3poteto.dev/finalizer";

/// Annotation on the generated Secret mapping each field to its ciphertext
/// fingerprint and plaintext digest
pub const CHECKSUMS_ANNOTATION: &str = "secret.h3poteto.dev/field-checksums";

/// Field manager / event reporter name
pub const CONTROLLER_NAME: &str = "kms-secret";

/// Leader election Lease name
pub const LEADER_ELECTION_ID: &str = "e976aec6.h3poteto.dev";

/// Secret type used when the template does not set one
pub const DEFAULT_SECRET_TYPE: &str = "Opaque";

/// Secret types the controller is willing to produce
pub const SUPPORTED_SECRET_TYPES: &[&str] = &[
    "Opaque",
    "kubernetes.io/basic-auth",
    "kubernetes.io/ssh-auth",
    "kubernetes.io/tls",
    "kubernetes.io/dockercfg",
    "kubernetes.io/dockerconfigjson",
];

/// Default bind address for metrics and health probes
pub const DEFAULT_METRICS_ADDR: &str = ":8080";

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Default fraction of each backoff delay that is randomised away
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Default interval between full resync sweeps (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 600;

/// Default maximum number of plaintexts held by the decryption cache
pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 4096;

/// Default grace period for in-flight reconciles on shutdown (seconds)
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

/// Default maximum concurrent reconciles
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 4;

/// Default lease duration (seconds)
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

/// Default lease renew interval (seconds)
pub const DEFAULT_LEASE_RENEW_SECS: u64 = 5;

/// Default lease acquire retry interval (seconds)
pub const DEFAULT_LEASE_RETRY_SECS: u64 = 2;

/// Namespace file mounted from the service account token
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
