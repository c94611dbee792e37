//! # Cluster API
//!
//! The controller's view of the Kubernetes API: `KMSSecret` objects, their
//! status and finalizers, generated `Secret`s and Events.
//!
//! Reconcile logic only talks to [`ClusterApi`], so it can run against the
//! real API server ([`KubeClusterApi`]) or an in-memory cluster in tests.

use crate::crd::{KMSSecret, KMSSecretStatus};
use crate::provider::Plaintext;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use std::collections::{BTreeMap, BTreeSet};

mod kubernetes;

pub use kubernetes::{status_merge_patch, KubeClusterApi};

/// Namespace and name of a `KMSSecret`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Key of a watched object; `None` when the object has no name
    pub fn from_object(obj: &KMSSecret) -> Option<Self> {
        let name = obj.metadata.name.as_deref()?;
        let namespace = obj.metadata.namespace.as_deref().unwrap_or("default");
        Some(Self::new(namespace, name))
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Cluster API failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),
    /// Optimistic concurrency or already-exists conflict
    #[error("conflict: {0}")]
    Conflict(String),
    /// The API server rejected the object itself (422); resending it cannot succeed
    #[error("rejected by the API server: {0}")]
    Invalid(String),
    #[error("kubernetes API error: {0}")]
    Api(String),
    #[error("failed to serialize {0}")]
    Serialization(String),
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(api_err) if api_err.code == 404 => Self::NotFound(api_err.message),
            kube::Error::Api(api_err) if api_err.code == 409 => Self::Conflict(api_err.message),
            kube::Error::Api(api_err) if api_err.code == 422 => Self::Invalid(api_err.message),
            other => Self::Api(other.to_string()),
        }
    }
}

/// Changes to a live Secret, sent as one merge patch
///
/// Only keys listed here are touched; everything else on the Secret is left
/// as it is.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretPatch {
    /// Precondition: the patch fails with a conflict if the Secret changed
    pub resource_version: Option<String>,
    pub set_data: BTreeMap<String, Plaintext>,
    pub remove_data: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl SecretPatch {
    pub fn is_empty(&self) -> bool {
        self.set_data.is_empty()
            && self.remove_data.is_empty()
            && self.labels.is_empty()
            && self.annotations.is_empty()
    }

    /// Data keys this patch writes or removes
    pub fn touched_data_keys(&self) -> BTreeSet<&str> {
        self.set_data
            .keys()
            .chain(self.remove_data.iter())
            .map(String::as_str)
            .collect()
    }
}

impl std::fmt::Debug for SecretPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretPatch")
            .field("resource_version", &self.resource_version)
            .field("set_data", &self.set_data.keys().collect::<Vec<_>>())
            .field("remove_data", &self.remove_data)
            .field("labels", &self.labels)
            .field("annotations", &self.annotations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// A Kubernetes Event about a `KMSSecret`
///
/// Notes carry field names and error classes only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEvent {
    pub kind: EventKind,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl ControllerEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }
}

/// Trait abstracting Kubernetes API operations used by the reconciler
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Get a KMSSecret; `None` if it does not exist
    async fn get_kms_secret(&self, key: &ResourceKey) -> Result<Option<KMSSecret>, ClusterError>;

    /// Replace the finalizer list, preconditioned on `resource_version`
    ///
    /// Returns the updated object.
    async fn patch_finalizers(
        &self,
        key: &ResourceKey,
        finalizers: &[String],
        resource_version: &str,
    ) -> Result<KMSSecret, ClusterError>;

    /// Write the status subresource
    ///
    /// `previous` is the status the update is based on, so fields dropped from
    /// `next` can be removed.
    async fn update_status(
        &self,
        key: &ResourceKey,
        previous: Option<&KMSSecretStatus>,
        next: &KMSSecretStatus,
    ) -> Result<(), ClusterError>;

    /// Get a Secret; `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ClusterError>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError>;

    async fn patch_secret(
        &self,
        namespace: &str,
        name: &str,
        patch: &SecretPatch,
    ) -> Result<Secret, ClusterError>;

    /// Delete a Secret, only if its uid still matches `uid` when given
    ///
    /// Deleting an absent Secret succeeds.
    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<&str>,
    ) -> Result<(), ClusterError>;

    /// Publish an Event; failures are logged, never returned
    async fn publish_event(&self, resource: &KMSSecret, event: &ControllerEvent);
}
