//! # Error Policy
//!
//! Error handling for the controller watch loop.
//!
//! Reconcile failures that the state machine turns into status never reach
//! this module; only errors that escaped it (a failed status write, a failed
//! read of the resource itself) land here and are retried with the same
//! per-resource backoff.

use crate::cluster::ResourceKey;
use crate::controller::reconciler::ReconcilerError;
use crate::crd::KMSSecret;
use crate::observability;
use crate::runtime::watch_loop::Context;
use kube_runtime::controller::{self, Action};
use kube_runtime::watcher;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Handle reconciliation errors with exponential backoff
///
/// Backoff state is tracked per resource so one failing resource does not
/// slow down the others.
pub fn handle_reconciliation_error(
    obj: Arc<KMSSecret>,
    error: &ReconcilerError,
    ctx: Arc<Context>,
) -> Action {
    let Some(key) = ResourceKey::from_object(&obj) else {
        return Action::await_change();
    };

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = %key.name,
        resource.namespace = %key.namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    let delay = ctx.reconciler.next_backoff(&key);
    error!(
        error_count = ctx.reconciler.error_count(&key),
        retry_in_ms = delay.as_millis() as u64,
        "Reconciliation error for {}: {}",
        key,
        error
    );

    observability::metrics::increment_requeues("error-policy");
    Action::requeue(delay)
}

/// Log an item of the controller's output stream that carries an error
pub fn log_controller_error(err: &controller::Error<ReconcilerError, watcher::Error>) {
    match err {
        // Already logged and requeued by the error policy
        controller::Error::ReconcilerFailed(e, obj) => {
            debug!(object = %obj, error = %e, "Reconcile returned an error");
        }
        controller::Error::ObjectNotFound(obj) => {
            debug!(object = %obj, "Object gone before reconcile");
        }
        other => {
            warn!(error = %other, "Controller stream error");
        }
    }
}
