//! # Reconciliation Logic
//!
//! One pass of the `KMSSecret` state machine:
//!
//! 1. Re-fetch the object; gone means nothing to do
//! 2. Deletion requested: run cleanup if our finalizer is present
//! 3. Skip generations that already failed terminally in this resync epoch
//! 4. Make sure the finalizer is in place before any Secret write
//! 5. Validate, resolve every field (reuse, cache or KMS), apply, record status
//!
//! Failures after step 4 are turned into status and an outcome here. Only a
//! failed status write escapes to the controller error policy.

use crate::cluster::{ClusterError, ControllerEvent, ResourceKey};
use crate::constants::CHECKSUMS_ANNOTATION;
use crate::controller::reconciler::apply::{apply_if_needed, ApplyResult};
use crate::controller::reconciler::desired::{compute_desired, is_controlled_by, ResolvedField};
use crate::controller::reconciler::finalize::{cleanup, delete_owned, ensure_finalizer, has_finalizer};
use crate::controller::reconciler::fingerprint::{decode_checksums, plaintext_digest, FieldChecksum};
use crate::controller::reconciler::status::{converged_status, failed_status, now};
use crate::controller::reconciler::types::{ReconcileOutcome, Reconciler, ReconcilerError};
use crate::controller::reconciler::validation::{validate_spec, ValidatedEntry};
use crate::crd::{FieldStatus, KMSSecret};
use crate::observability::metrics;
use crate::provider::Plaintext;
use k8s_openapi::api::core::v1::Secret;
use kube::Resource;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Reconcile the `KMSSecret` identified by `key`
pub async fn reconcile(
    reconciler: &Reconciler,
    key: &ResourceKey,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations();

    let result = reconcile_internal(reconciler, key).await;

    metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        metrics::increment_reconciliation_errors(e.class());
    }
    result
}

async fn reconcile_internal(
    reconciler: &Reconciler,
    key: &ResourceKey,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let Some(obj) = reconciler.cluster.get_kms_secret(key).await? else {
        debug!(resource = %key, "Resource no longer exists");
        reconciler.forget(key);
        return Ok(ReconcileOutcome::Synced);
    };

    if obj.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&obj) {
            info!(resource = %key, "Deletion requested, cleaning up");
            return cleanup(reconciler, key, &obj).await;
        }
        return Ok(ReconcileOutcome::Synced);
    }

    let generation = obj.metadata.generation.unwrap_or_default();
    if reconciler.is_terminal_for(key, generation) {
        debug!(
            resource = %key,
            generation,
            "Generation already failed terminally, waiting for a spec change or resync"
        );
        return Ok(ReconcileOutcome::TerminalFailure);
    }

    let obj = match ensure_finalizer(reconciler, key, obj.clone()).await {
        Ok(updated) => updated,
        Err(e) => return handle_failure(reconciler, key, &obj, e).await,
    };

    match converge(reconciler, key, &obj).await {
        Ok(converged) => handle_success(reconciler, key, &obj, converged).await,
        Err(e) => handle_failure(reconciler, key, &obj, e).await,
    }
}

/// Result of a successful converge step
struct Converged {
    applied: ApplyResult,
    fields: BTreeMap<String, FieldStatus>,
    secret_name: String,
}

async fn converge(
    reconciler: &Reconciler,
    key: &ResourceKey,
    obj: &KMSSecret,
) -> Result<Converged, ReconcilerError> {
    let entries = validate_spec(&obj.spec, &key.name)?;

    let owner = obj.controller_owner_ref(&()).ok_or_else(|| {
        ReconcilerError::Cluster(ClusterError::Api(format!("{key} has no uid")))
    })?;
    let owner_uid = owner.uid.clone();
    let target = obj.spec.target_name(&key.name).to_string();

    let live = reconciler
        .cluster
        .get_secret(&key.namespace, &target)
        .await?;
    if let Some(live) = &live {
        if !is_controlled_by(live, &owner_uid) {
            return Err(ReconcilerError::OwnershipConflict { secret: target });
        }
    }

    let previous_fields = obj.status.as_ref().map(|s| &s.fields);
    let live_checksums = live
        .as_ref()
        .and_then(|s| s.metadata.annotations.as_ref())
        .and_then(|a| a.get(CHECKSUMS_ANNOTATION))
        .and_then(|v| decode_checksums(v))
        .unwrap_or_default();

    let mut resolved = BTreeMap::new();
    for entry in &entries {
        let previous = previous_fields.and_then(|f| f.get(&entry.field_name));
        let plaintext = match reusable_value(
            entry,
            previous,
            live_checksums.get(&entry.field_name),
            live.as_ref(),
        ) {
            Some(plaintext) => {
                debug!(resource = %key, field = %entry.field_name, "Reusing stored value");
                plaintext
            }
            None => resolve_field(reconciler, key, entry, previous).await?,
        };
        resolved.insert(
            entry.field_name.clone(),
            ResolvedField {
                plaintext,
                fingerprint: entry.fingerprint.clone(),
            },
        );
    }

    let desired = compute_desired(&obj.spec, &key.name, &key.namespace, owner, &resolved);
    let applied = apply_if_needed(
        reconciler.cluster.as_ref(),
        &desired,
        live.as_ref(),
        &owner_uid,
    )
    .await?;

    // Template name changed: the Secret recorded in status is now an orphan
    if let Some(previous_name) = obj.status.as_ref().and_then(|s| s.secret_name.as_deref()) {
        if previous_name != target
            && delete_owned(reconciler, &key.namespace, previous_name, &owner_uid).await?
        {
            info!(resource = %key, secret = %previous_name, "Deleted Secret left behind by rename");
        }
    }

    let fields = entries
        .iter()
        .map(|entry| {
            (
                entry.field_name.clone(),
                FieldStatus {
                    last_ciphertext_fingerprint: entry.fingerprint.clone(),
                    key_id: entry.key_id.clone(),
                },
            )
        })
        .collect();

    Ok(Converged {
        applied,
        fields,
        secret_name: target,
    })
}

/// The live value of a field, if it provably came from the current ciphertext
///
/// Requires the status fingerprint and key, the checksum annotation
/// fingerprint and the digest of the stored bytes to all agree.
fn reusable_value(
    entry: &ValidatedEntry,
    previous: Option<&FieldStatus>,
    checksum: Option<&FieldChecksum>,
    live: Option<&Secret>,
) -> Option<Plaintext> {
    let previous = previous?;
    if previous.last_ciphertext_fingerprint != entry.fingerprint || previous.key_id != entry.key_id {
        return None;
    }
    let checksum = checksum?;
    if checksum.fingerprint != entry.fingerprint {
        return None;
    }
    let stored = live?.data.as_ref()?.get(&entry.field_name)?;
    (plaintext_digest(&stored.0) == checksum.digest).then(|| Plaintext::new(stored.0.clone()))
}

async fn resolve_field(
    reconciler: &Reconciler,
    key: &ResourceKey,
    entry: &ValidatedEntry,
    previous: Option<&FieldStatus>,
) -> Result<Plaintext, ReconcilerError> {
    if let Some(previous) = previous {
        if previous.last_ciphertext_fingerprint != entry.fingerprint
            || previous.key_id != entry.key_id
        {
            reconciler
                .cache
                .invalidate(&previous.last_ciphertext_fingerprint, &previous.key_id)
                .await;
        }
    }

    debug!(resource = %key, field = %entry.field_name, key_id = %entry.key_id, "Resolving field");
    reconciler
        .cache
        .get_or_decrypt(
            &entry.fingerprint,
            &entry.key_id,
            reconciler
                .gateway
                .decrypt(&entry.ciphertext, &entry.key_id, &entry.region),
        )
        .await
        .map_err(|source| ReconcilerError::Decryption {
            field: entry.field_name.clone(),
            source,
        })
}

async fn handle_success(
    reconciler: &Reconciler,
    key: &ResourceKey,
    obj: &KMSSecret,
    converged: Converged,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let generation = obj.metadata.generation.unwrap_or_default();
    let previous = obj.status.as_ref();
    let next = converged_status(
        previous,
        generation,
        converged.fields,
        &converged.secret_name,
        &now(),
    );

    if previous != Some(&next) {
        reconciler
            .cluster
            .update_status(key, previous, &next)
            .await
            .map_err(ReconcilerError::StatusUpdate)?;
    }

    reconciler.reset_backoff(key);
    reconciler.clear_terminal(key);

    if converged.applied.wrote() {
        let reason = match converged.applied {
            ApplyResult::Created => "Created",
            ApplyResult::Recreated => "Recreated",
            _ => "Updated",
        };
        reconciler
            .cluster
            .publish_event(
                obj,
                &ControllerEvent::normal(
                    reason,
                    "Apply",
                    format!("Secret {} {}", converged.secret_name, reason.to_lowercase()),
                ),
            )
            .await;
    }

    info!(
        resource = %key,
        generation,
        secret = %converged.secret_name,
        result = converged.applied.as_str(),
        "Reconciled"
    );
    Ok(ReconcileOutcome::Synced)
}

async fn handle_failure(
    reconciler: &Reconciler,
    key: &ResourceKey,
    obj: &KMSSecret,
    err: ReconcilerError,
) -> Result<ReconcileOutcome, ReconcilerError> {
    metrics::increment_reconciliation_errors(err.class());
    let message = err.to_string();
    let previous = obj.status.as_ref();
    let next = failed_status(previous, err.reason(), &message, &now());

    if previous != Some(&next) {
        reconciler
            .cluster
            .update_status(key, previous, &next)
            .await
            .map_err(ReconcilerError::StatusUpdate)?;
        reconciler
            .cluster
            .publish_event(
                obj,
                &ControllerEvent::warning(err.reason(), "Reconcile", message.clone()),
            )
            .await;
    }

    if err.is_transient() {
        let delay = reconciler.next_backoff(key);
        metrics::increment_requeues("error-backoff");
        warn!(
            resource = %key,
            error = %message,
            retry_in_ms = delay.as_millis() as u64,
            "Reconcile failed, will retry"
        );
        Ok(ReconcileOutcome::Requeue(delay))
    } else {
        let generation = obj.metadata.generation.unwrap_or_default();
        reconciler.mark_terminal(key, generation);
        warn!(
            resource = %key,
            generation,
            error = %message,
            "Reconcile failed terminally, waiting for a spec change"
        );
        Ok(ReconcileOutcome::TerminalFailure)
    }
}
