//! # Apply
//!
//! Brings the live Secret in line with the desired one using the smallest
//! write that does it:
//!
//! - absent: create it
//! - present but owned by someone else: refuse
//! - type differs (immutable in Kubernetes): delete and recreate
//! - content hash equal: nothing
//! - otherwise: merge patch of the changed keys, preconditioned on the
//!   live `resourceVersion`

use crate::cluster::{ClusterApi, ClusterError};
use crate::controller::reconciler::desired::{is_controlled_by, secret_type, DesiredSecret};
use crate::controller::reconciler::types::ReconcilerError;
use crate::observability::metrics;
use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info};

/// What apply did to the live Secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Created,
    Patched,
    Recreated,
    NoOp,
}

impl ApplyResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "create",
            Self::Patched => "patch",
            Self::Recreated => "recreate",
            Self::NoOp => "noop",
        }
    }

    pub fn wrote(self) -> bool {
        self != Self::NoOp
    }
}

/// Apply `desired`, given the `live` Secret read earlier in the same pass
pub async fn apply_if_needed(
    cluster: &dyn ClusterApi,
    desired: &DesiredSecret,
    live: Option<&Secret>,
    owner_uid: &str,
) -> Result<ApplyResult, ReconcilerError> {
    let Some(live) = live else {
        create(cluster, desired).await?;
        info!(secret = %desired.name, namespace = %desired.namespace, "Created Secret");
        metrics::increment_secret_writes(ApplyResult::Created.as_str());
        return Ok(ApplyResult::Created);
    };

    if !is_controlled_by(live, owner_uid) {
        return Err(ReconcilerError::OwnershipConflict {
            secret: desired.name.clone(),
        });
    }

    if secret_type(live) != desired.type_ {
        info!(
            secret = %desired.name,
            namespace = %desired.namespace,
            from = secret_type(live),
            to = %desired.type_,
            "Secret type changed, recreating Secret"
        );
        cluster
            .delete_secret(
                &desired.namespace,
                &desired.name,
                live.metadata.uid.as_deref(),
            )
            .await?;
        create(cluster, desired).await?;
        metrics::increment_secret_writes(ApplyResult::Recreated.as_str());
        return Ok(ApplyResult::Recreated);
    }

    if desired.live_content_hash(live) == desired.content_hash {
        debug!(secret = %desired.name, namespace = %desired.namespace, "Secret up to date");
        return Ok(ApplyResult::NoOp);
    }

    let patch = desired.diff(live);
    if patch.is_empty() {
        return Ok(ApplyResult::NoOp);
    }
    debug!(
        secret = %desired.name,
        namespace = %desired.namespace,
        keys = ?patch.touched_data_keys(),
        "Patching Secret"
    );
    cluster
        .patch_secret(&desired.namespace, &desired.name, &patch)
        .await?;
    info!(secret = %desired.name, namespace = %desired.namespace, "Patched Secret");
    metrics::increment_secret_writes(ApplyResult::Patched.as_str());
    Ok(ApplyResult::Patched)
}

async fn create(cluster: &dyn ClusterApi, desired: &DesiredSecret) -> Result<(), ReconcilerError> {
    match cluster.create_secret(&desired.to_secret()).await {
        Ok(_) => Ok(()),
        // Created by someone else since the read; the next pass sorts out ownership
        Err(ClusterError::Conflict(msg)) => Err(ReconcilerError::ApplyConflict(msg)),
        Err(e) => Err(e.into()),
    }
}
