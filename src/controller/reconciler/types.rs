//! # Types
//!
//! Core types for the reconciler.

use crate::cluster::{ClusterApi, ClusterError, ResourceKey};
use crate::config::ControllerConfig;
use crate::controller::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::controller::cache::DecryptionCache;
use crate::controller::reconciler::validation::ValidationError;
use crate::provider::{DecryptionError, DecryptionGateway};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ReconcilerError {
    #[error("invalid spec: {0}")]
    Validation(#[from] ValidationError),
    #[error("field {field}: decryption failed: {}", .source.reason)]
    Decryption {
        field: String,
        #[source]
        source: DecryptionError,
    },
    #[error("apply conflict: {0}")]
    ApplyConflict(String),
    #[error("secret {secret} exists and is not owned by this resource")]
    OwnershipConflict { secret: String },
    #[error("secret rejected by the API server: {0}")]
    Rejected(String),
    #[error("{0}")]
    Cluster(ClusterError),
    #[error("status update failed: {0}")]
    StatusUpdate(ClusterError),
}

impl From<ClusterError> for ReconcilerError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Conflict(msg) => Self::ApplyConflict(msg),
            ClusterError::Invalid(msg) => Self::Rejected(msg),
            other => Self::Cluster(other),
        }
    }
}

impl ReconcilerError {
    /// Whether retrying the same generation can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Validation(_) | Self::OwnershipConflict { .. } | Self::Rejected(_) => false,
            Self::Decryption { source, .. } => source.is_transient(),
            Self::ApplyConflict(_) | Self::Cluster(_) | Self::StatusUpdate(_) => true,
        }
    }

    /// Condition reason written to status
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::Rejected(_) => "InvalidSpec",
            _ if self.is_transient() => "Retryable",
            _ => "Terminal",
        }
    }

    /// Metric label for the error class
    pub fn class(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Decryption { .. } => "decryption",
            Self::ApplyConflict(_) => "conflict",
            Self::OwnershipConflict { .. } => "ownership",
            Self::Rejected(_) => "rejected",
            Self::Cluster(_) => "cluster",
            Self::StatusUpdate(_) => "status",
        }
    }
}

/// Result of one reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged, or nothing to do; wait for the next change or resync
    Synced,
    /// Retry after the given delay
    Requeue(Duration),
    /// Failed in a way retries cannot fix; wait for a spec change
    TerminalFailure,
}

/// Backoff state for a specific resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: ExponentialBackoff,
    pub error_count: u32,
}

impl BackoffState {
    pub fn new(policy: &BackoffPolicy) -> Self {
        Self {
            backoff: policy.backoff(),
            error_count: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.error_count += 1;
        self.backoff.next_backoff()
    }
}

pub struct Reconciler {
    pub cluster: Arc<dyn ClusterApi>,
    pub gateway: Arc<dyn DecryptionGateway>,
    pub cache: DecryptionCache,
    pub backoff_policy: BackoffPolicy,
    // Per-resource retry state, owned by the reconcile and error_policy paths
    backoff_states: Mutex<HashMap<ResourceKey, BackoffState>>,
    // Generation and resync epoch at which a resource last failed terminally
    terminal_failures: Mutex<HashMap<ResourceKey, (i64, u64)>>,
    resync_epoch: AtomicU64,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("cache", &self.cache)
            .field("backoff_policy", &self.backoff_policy)
            .field("resync_epoch", &self.resync_epoch.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        gateway: Arc<dyn DecryptionGateway>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            gateway,
            cache: DecryptionCache::new(config.cache_max_entries),
            backoff_policy: BackoffPolicy {
                base: config.backoff_base(),
                max: config.backoff_max(),
                jitter: config.backoff_jitter,
            },
            backoff_states: Mutex::new(HashMap::new()),
            terminal_failures: Mutex::new(HashMap::new()),
            resync_epoch: AtomicU64::new(0),
        }
    }

    /// Next retry delay for `key`, advancing its backoff
    pub fn next_backoff(&self, key: &ResourceKey) -> Duration {
        let mut states = lock(&self.backoff_states);
        states
            .entry(key.clone())
            .or_insert_with(|| BackoffState::new(&self.backoff_policy))
            .next_delay()
    }

    /// Consecutive failures recorded for `key`
    pub fn error_count(&self, key: &ResourceKey) -> u32 {
        lock(&self.backoff_states)
            .get(key)
            .map_or(0, |state| state.error_count)
    }

    pub fn reset_backoff(&self, key: &ResourceKey) {
        lock(&self.backoff_states).remove(key);
    }

    /// Record a terminal failure of `generation` in the current resync epoch
    pub fn mark_terminal(&self, key: &ResourceKey, generation: i64) {
        let epoch = self.resync_epoch();
        lock(&self.terminal_failures).insert(key.clone(), (generation, epoch));
    }

    /// Whether `generation` already failed terminally since the last resync sweep
    pub fn is_terminal_for(&self, key: &ResourceKey, generation: i64) -> bool {
        let epoch = self.resync_epoch();
        lock(&self.terminal_failures)
            .get(key)
            .is_some_and(|&(failed_generation, failed_epoch)| {
                failed_generation == generation && failed_epoch == epoch
            })
    }

    pub fn clear_terminal(&self, key: &ResourceKey) {
        lock(&self.terminal_failures).remove(key);
    }

    /// Drop all per-resource state for a deleted resource
    pub fn forget(&self, key: &ResourceKey) {
        self.reset_backoff(key);
        self.clear_terminal(key);
    }

    /// Start a new resync sweep; terminal failures are retried once per sweep
    pub fn begin_resync_sweep(&self) -> u64 {
        self.resync_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn resync_epoch(&self) -> u64 {
        self.resync_epoch.load(Ordering::SeqCst)
    }
}
