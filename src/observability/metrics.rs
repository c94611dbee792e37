//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `kms_secrets_reconciliations_total` - Total number of reconciliations
//! - `kms_secrets_reconciliation_errors_total` - Reconciliation errors by class
//! - `kms_secrets_reconciliation_duration_seconds` - Duration of reconciliations
//! - `kms_secrets_decrypt_requests_total` - Total number of KMS decrypt calls
//! - `kms_secrets_decrypt_errors_total` - KMS decrypt failures by reason
//! - `kms_secrets_decrypt_duration_seconds` - Duration of KMS decrypt calls
//! - `kms_secrets_cache_hits_total` / `kms_secrets_cache_misses_total` - Decryption cache lookups
//! - `kms_secrets_secret_writes_total` - Secret writes by operation
//! - `kms_secrets_requeues_total` - Requeues by trigger
//! - `kms_secrets_is_leader` - 1 while this replica holds the leader Lease

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kms_secrets_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kms_secrets_reconciliation_errors_total",
            "Total number of reconciliation errors by error class",
        ),
        &["class"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "kms_secrets_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static DECRYPT_REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kms_secrets_decrypt_requests_total",
        "Total number of KMS decrypt calls",
    )
    .expect("Failed to create DECRYPT_REQUESTS_TOTAL metric - this should never happen")
});

static DECRYPT_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kms_secrets_decrypt_errors_total",
            "Total number of failed KMS decrypt calls by failure reason",
        ),
        &["reason"],
    )
    .expect("Failed to create DECRYPT_ERRORS_TOTAL metric - this should never happen")
});

static DECRYPT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "kms_secrets_decrypt_duration_seconds",
            "Duration of KMS decrypt calls in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
    )
    .expect("Failed to create DECRYPT_DURATION metric - this should never happen")
});

static CACHE_HITS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kms_secrets_cache_hits_total",
        "Total number of decryption cache hits",
    )
    .expect("Failed to create CACHE_HITS_TOTAL metric - this should never happen")
});

static CACHE_MISSES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kms_secrets_cache_misses_total",
        "Total number of decryption cache misses",
    )
    .expect("Failed to create CACHE_MISSES_TOTAL metric - this should never happen")
});

static SECRET_WRITES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kms_secrets_secret_writes_total",
            "Total number of writes to generated Secrets by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create SECRET_WRITES_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kms_secrets_requeues_total",
            "Total number of requeues by trigger",
        ),
        &["trigger"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static IS_LEADER: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "kms_secrets_is_leader",
        "Whether this replica currently holds the leader election Lease",
    )
    .expect("Failed to create IS_LEADER metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
/// Register all metrics with the process registry; call once at startup
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(DECRYPT_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DECRYPT_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DECRYPT_DURATION.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRET_WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IS_LEADER.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors(class: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[class]).inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_decrypt_requests() {
    DECRYPT_REQUESTS_TOTAL.inc();
}

pub fn increment_decrypt_errors(reason: &str) {
    DECRYPT_ERRORS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn observe_decrypt_duration(duration: f64) {
    DECRYPT_DURATION.observe(duration);
}

pub fn increment_cache_hits() {
    CACHE_HITS_TOTAL.inc();
}

pub fn increment_cache_misses() {
    CACHE_MISSES_TOTAL.inc();
}

/// Count a write to a generated Secret (`create`, `patch`, `recreate`, `delete`)
pub fn increment_secret_writes(operation: &str) {
    SECRET_WRITES_TOTAL.with_label_values(&[operation]).inc();
}

/// Count a requeue (`error-backoff`, `error-policy`, `resync`)
pub fn increment_requeues(trigger: &str) {
    REQUEUES_TOTAL.with_label_values(&[trigger]).inc();
}

pub fn set_is_leader(is_leader: bool) {
    IS_LEADER.set(i64::from(is_leader));
}
