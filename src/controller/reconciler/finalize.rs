//! # Finalizer
//!
//! The finalizer keeps a deleted `KMSSecret` around until the Secrets it
//! generated are gone. It is added before the first Secret write and removed
//! only after cleanup succeeded, so a failed cleanup leaves the resource in
//! place to be retried.

use crate::cluster::{ControllerEvent, ResourceKey};
use crate::constants::FINALIZER;
use crate::controller::reconciler::desired::is_controlled_by;
use crate::controller::reconciler::status::{failed_status, now, REASON_RETRYABLE};
use crate::controller::reconciler::types::{ReconcileOutcome, Reconciler, ReconcilerError};
use crate::crd::KMSSecret;
use std::collections::BTreeSet;
use tracing::{info, warn};

pub fn has_finalizer(obj: &KMSSecret) -> bool {
    obj.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == FINALIZER))
}

/// Add the finalizer if missing, returning the up-to-date object
pub async fn ensure_finalizer(
    reconciler: &Reconciler,
    key: &ResourceKey,
    obj: KMSSecret,
) -> Result<KMSSecret, ReconcilerError> {
    if has_finalizer(&obj) {
        return Ok(obj);
    }

    let mut finalizers = obj.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    let resource_version = obj.metadata.resource_version.clone().unwrap_or_default();

    let updated = reconciler
        .cluster
        .patch_finalizers(key, &finalizers, &resource_version)
        .await?;
    info!(resource = %key, "Added finalizer");
    Ok(updated)
}

/// Delete the generated Secrets of a deleted resource, then release it
pub async fn cleanup(
    reconciler: &Reconciler,
    key: &ResourceKey,
    obj: &KMSSecret,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let owner_uid = obj.metadata.uid.as_deref().unwrap_or_default();

    // The current target plus whatever status last recorded, in case the
    // template name changed before deletion
    let mut candidates = BTreeSet::new();
    candidates.insert(obj.spec.target_name(&key.name).to_string());
    if let Some(recorded) = obj.status.as_ref().and_then(|s| s.secret_name.as_deref()) {
        candidates.insert(recorded.to_string());
    }

    for name in &candidates {
        if let Err(e) = delete_owned(reconciler, &key.namespace, name, owner_uid).await {
            let delay = reconciler.next_backoff(key);
            warn!(
                resource = %key,
                secret = %name,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Failed to delete generated Secret, keeping finalizer"
            );
            reconciler
                .cluster
                .publish_event(
                    obj,
                    &ControllerEvent::warning(
                        "CleanupFailed",
                        "Delete",
                        format!("Failed to delete Secret {name}: {}", e.reason()),
                    ),
                )
                .await;

            let previous = obj.status.as_ref();
            let next = failed_status(
                previous,
                REASON_RETRYABLE,
                &format!("cleanup failed: could not delete Secret {name}: {e}"),
                &now(),
            );
            if previous != Some(&next) {
                reconciler
                    .cluster
                    .update_status(key, previous, &next)
                    .await
                    .map_err(ReconcilerError::StatusUpdate)?;
            }
            return Ok(ReconcileOutcome::Requeue(delay));
        }
    }

    let finalizers: Vec<String> = obj
        .metadata
        .finalizers
        .iter()
        .flatten()
        .filter(|name| *name != FINALIZER)
        .cloned()
        .collect();
    let resource_version = obj.metadata.resource_version.clone().unwrap_or_default();
    reconciler
        .cluster
        .patch_finalizers(key, &finalizers, &resource_version)
        .await?;

    reconciler.forget(key);
    info!(resource = %key, "Removed finalizer");
    reconciler
        .cluster
        .publish_event(
            obj,
            &ControllerEvent::normal("Deleted", "Delete", "Generated Secret removed"),
        )
        .await;
    Ok(ReconcileOutcome::Synced)
}

/// Delete `name` if it is controlled by `owner_uid`; foreign Secrets are left alone
pub async fn delete_owned(
    reconciler: &Reconciler,
    namespace: &str,
    name: &str,
    owner_uid: &str,
) -> Result<bool, ReconcilerError> {
    let Some(secret) = reconciler.cluster.get_secret(namespace, name).await? else {
        return Ok(false);
    };
    if !is_controlled_by(&secret, owner_uid) {
        return Ok(false);
    }
    reconciler
        .cluster
        .delete_secret(namespace, name, secret.metadata.uid.as_deref())
        .await?;
    info!(secret = %name, namespace = %namespace, "Deleted generated Secret");
    crate::observability::metrics::increment_secret_writes("delete");
    Ok(true)
}
