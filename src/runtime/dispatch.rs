//! # Dispatch
//!
//! Single entry point from the watch loop into the reconciler, guarded by the
//! leadership gate. A standby replica never reaches the reconciler, so it
//! never calls KMS or writes to the cluster.

use crate::cluster::ResourceKey;
use crate::controller::reconciler::{reconcile, ReconcileOutcome, Reconciler, ReconcilerError};
use crate::runtime::leader::LeadershipGate;
use tracing::debug;

/// Run one reconcile for `key` if the gate is open
///
/// Returns `None` when the gate is closed.
pub async fn dispatch_reconcile(
    gate: &LeadershipGate,
    reconciler: &Reconciler,
    key: &ResourceKey,
) -> Option<Result<ReconcileOutcome, ReconcilerError>> {
    if !gate.is_open() {
        debug!(resource = %key, "Not the leader, skipping reconcile");
        return None;
    }
    Some(reconcile(reconciler, key).await)
}
