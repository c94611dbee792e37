//! # Kubernetes Cluster API
//!
//! [`ClusterApi`] on top of `kube::Api`. Typed API handles are built per call
//! from one shared client.

use super::{ClusterApi, ClusterError, ControllerEvent, EventKind, ResourceKey, SecretPatch};
use crate::constants::CONTROLLER_NAME;
use crate::crd::{KMSSecret, KMSSecretStatus};
use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, Preconditions};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Production cluster API
pub struct KubeClusterApi {
    client: Client,
    recorder: Recorder,
}

impl std::fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterApi").finish_non_exhaustive()
    }
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
        }
    }

    fn kms_secrets(&self, namespace: &str) -> Api<KMSSecret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Build the merge patch body for a status update
///
/// Per-field entries present in `previous` but missing from `next` are set to
/// `null` so the merge removes them.
pub fn status_merge_patch(
    previous: Option<&KMSSecretStatus>,
    next: &KMSSecretStatus,
) -> Result<Value, ClusterError> {
    let mut status = serde_json::to_value(next)
        .map_err(|e| ClusterError::Serialization(format!("status: {e}")))?;

    if let Some(previous) = previous {
        let removed: Vec<&String> = previous
            .fields
            .keys()
            .filter(|field| !next.fields.contains_key(*field))
            .collect();
        if let Some(fields) = status.get_mut("fields").and_then(Value::as_object_mut) {
            for field in removed {
                fields.insert(field.clone(), Value::Null);
            }
        }
    }

    Ok(json!({ "status": status }))
}

/// Build the merge patch body for a Secret update
fn secret_merge_patch(patch: &SecretPatch) -> Value {
    let engine = base64::engine::general_purpose::STANDARD;

    let mut data = Map::new();
    for (key, value) in &patch.set_data {
        data.insert(key.clone(), Value::String(engine.encode(value.as_bytes())));
    }
    for key in &patch.remove_data {
        data.insert(key.clone(), Value::Null);
    }

    let mut metadata = Map::new();
    if let Some(resource_version) = &patch.resource_version {
        metadata.insert("resourceVersion".to_string(), json!(resource_version));
    }
    if !patch.labels.is_empty() {
        metadata.insert("labels".to_string(), json!(patch.labels));
    }
    if !patch.annotations.is_empty() {
        metadata.insert("annotations".to_string(), json!(patch.annotations));
    }

    let mut body = Map::new();
    body.insert("metadata".to_string(), Value::Object(metadata));
    if !data.is_empty() {
        body.insert("data".to_string(), Value::Object(data));
    }
    Value::Object(body)
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_kms_secret(&self, key: &ResourceKey) -> Result<Option<KMSSecret>, ClusterError> {
        Ok(self.kms_secrets(&key.namespace).get_opt(&key.name).await?)
    }

    async fn patch_finalizers(
        &self,
        key: &ResourceKey,
        finalizers: &[String],
        resource_version: &str,
    ) -> Result<KMSSecret, ClusterError> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": resource_version,
            }
        });
        let updated = self
            .kms_secrets(&key.namespace)
            .patch(
                &key.name,
                &PatchParams::apply(CONTROLLER_NAME),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        previous: Option<&KMSSecretStatus>,
        next: &KMSSecretStatus,
    ) -> Result<(), ClusterError> {
        let patch = status_merge_patch(previous, next)?;
        self.kms_secrets(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::apply(CONTROLLER_NAME),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(resource = %key, "Status updated");
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        Ok(self.secrets(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or("default");
        let params = PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..PostParams::default()
        };
        Ok(self.secrets(namespace).create(&params, secret).await?)
    }

    async fn patch_secret(
        &self,
        namespace: &str,
        name: &str,
        patch: &SecretPatch,
    ) -> Result<Secret, ClusterError> {
        let body = secret_merge_patch(patch);
        let updated = self
            .secrets(namespace)
            .patch(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&body))
            .await?;
        Ok(updated)
    }

    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<&str>,
    ) -> Result<(), ClusterError> {
        let params = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        match self.secrets(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_event(&self, resource: &KMSSecret, event: &ControllerEvent) {
        let kube_event = Event {
            type_: match event.kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: event.reason.clone(),
            note: event.note.clone(),
            action: event.action.clone(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&kube_event, &resource.object_ref(&()))
            .await
        {
            warn!(
                reason = event.reason.as_str(),
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}
