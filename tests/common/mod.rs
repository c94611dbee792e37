//! Common test utilities for reconciler integration tests
//!
//! Provides an in-memory cluster, a scripted KMS gateway and an in-memory
//! Lease so the reconcile state machine and leader election can run without
//! an API server or AWS.

#![allow(dead_code, reason = "not every test binary uses every helper")]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kms_secrets_controller::cluster::{
    ClusterApi, ClusterError, ControllerEvent, ResourceKey, SecretPatch,
};
use kms_secrets_controller::config::ControllerConfig;
use kms_secrets_controller::controller::reconciler::{reconcile, ReconcileOutcome, Reconciler};
use kms_secrets_controller::crd::{DataEntry, KMSSecret, KMSSecretSpec, KMSSecretStatus, SecretTemplate};
use kms_secrets_controller::provider::{
    DecryptionError, DecryptionFailureReason, DecryptionGateway, Plaintext,
};
use kms_secrets_controller::runtime::leader::{LeaderElectionError, LeaseBackend, LeaseRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NAMESPACE: &str = "default";
pub const REGION: &str = "us-east-1";

/// base64("c1"), decrypts to "s3cr3t"
pub const C1: &str = "YzE=";
/// base64("c2"), decrypts to "n3wpass"
pub const C2: &str = "YzI=";
/// base64("u1"), decrypts to "admin"
pub const U1: &str = "dTE=";

/// A Secret write observed by the fake cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretWrite {
    Create(String),
    /// Secret name and the data keys the patch touched
    Patch(String, Vec<String>),
    Delete(String),
}

#[derive(Default)]
struct ClusterState {
    kms_secrets: BTreeMap<ResourceKey, KMSSecret>,
    secrets: BTreeMap<(String, String), Secret>,
    secret_writes: Vec<SecretWrite>,
    status_writes: usize,
    events: Vec<ControllerEvent>,
    failing_deletes: usize,
    rejected_creates: Option<String>,
    race_next_patch: bool,
    next_version: u64,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// In-memory cluster enforcing resourceVersion preconditions
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    /// Store a new KMSSecret at generation 1
    pub fn add_kms_secret(&self, mut obj: KMSSecret) -> ResourceKey {
        let key = ResourceKey::from_object(&obj).unwrap();
        let mut state = self.state();
        obj.metadata.uid = Some(format!("uid-{}", key.name));
        obj.metadata.generation = Some(1);
        obj.metadata.resource_version = Some(state.bump());
        state.kms_secrets.insert(key.clone(), obj);
        key
    }

    /// Change the spec, bumping the generation
    pub fn update_spec(&self, key: &ResourceKey, update: impl FnOnce(&mut KMSSecretSpec)) {
        let mut state = self.state();
        let version = state.bump();
        let obj = state.kms_secrets.get_mut(key).unwrap();
        update(&mut obj.spec);
        obj.metadata.generation = Some(obj.metadata.generation.unwrap_or_default() + 1);
        obj.metadata.resource_version = Some(version);
    }

    /// Request deletion; the object stays until its finalizers are gone
    pub fn request_deletion(&self, key: &ResourceKey) {
        let mut state = self.state();
        let version = state.bump();
        let obj = state.kms_secrets.get_mut(key).unwrap();
        let timestamp: Time = serde_json::from_value(serde_json::json!("2026-10-16T00:00:00Z")).unwrap();
        obj.metadata.deletion_timestamp = Some(timestamp);
        obj.metadata.resource_version = Some(version);
    }

    pub fn kms_secret(&self, key: &ResourceKey) -> Option<KMSSecret> {
        self.state().kms_secrets.get(key).cloned()
    }

    pub fn status(&self, key: &ResourceKey) -> Option<KMSSecretStatus> {
        self.kms_secret(key).and_then(|obj| obj.status)
    }

    /// Store a Secret as some other actor would
    pub fn put_secret(&self, mut secret: Secret) {
        let mut state = self.state();
        let namespace = secret.metadata.namespace.clone().unwrap();
        let name = secret.metadata.name.clone().unwrap();
        secret.metadata.uid = Some(format!("uid-secret-{name}-{}", state.next_version));
        secret.metadata.resource_version = Some(state.bump());
        state.secrets.insert((namespace, name), secret);
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.state()
            .secrets
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    /// Data value of a Secret key as a string
    pub fn secret_value(&self, name: &str, field: &str) -> Option<String> {
        let secret = self.secret(name)?;
        let value = secret.data?.get(field)?.0.clone();
        Some(String::from_utf8(value).unwrap())
    }

    /// Overwrite one data key out of band
    pub fn tamper(&self, name: &str, field: &str, value: &str) {
        let mut state = self.state();
        let version = state.bump();
        let secret = state
            .secrets
            .get_mut(&(NAMESPACE.to_string(), name.to_string()))
            .unwrap();
        secret
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(field.to_string(), ByteString(value.as_bytes().to_vec()));
        secret.metadata.resource_version = Some(version);
    }

    pub fn secret_writes(&self) -> Vec<SecretWrite> {
        self.state().secret_writes.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    pub fn events(&self) -> Vec<ControllerEvent> {
        self.state().events.clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    /// Forget recorded writes and events
    pub fn clear_history(&self) {
        let mut state = self.state();
        state.secret_writes.clear();
        state.status_writes = 0;
        state.events.clear();
    }

    /// Make the next `count` Secret deletes fail
    pub fn fail_deletes(&self, count: usize) {
        self.state().failing_deletes = count;
    }

    /// Reject every Secret create the way the API server rejects an invalid object
    pub fn reject_creates(&self, message: &str) {
        self.state().rejected_creates = Some(message.to_string());
    }

    /// Let another writer change the Secret just before the next patch lands
    pub fn race_next_patch(&self) {
        self.state().race_next_patch = true;
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_kms_secret(&self, key: &ResourceKey) -> Result<Option<KMSSecret>, ClusterError> {
        Ok(self.state().kms_secrets.get(key).cloned())
    }

    async fn patch_finalizers(
        &self,
        key: &ResourceKey,
        finalizers: &[String],
        resource_version: &str,
    ) -> Result<KMSSecret, ClusterError> {
        let mut state = self.state();
        let version = state.bump();
        let obj = state
            .kms_secrets
            .get_mut(key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        if obj.metadata.resource_version.as_deref() != Some(resource_version) {
            return Err(ClusterError::Conflict(key.to_string()));
        }
        obj.metadata.finalizers = Some(finalizers.to_vec());
        obj.metadata.resource_version = Some(version);
        let updated = obj.clone();

        if updated.metadata.deletion_timestamp.is_some() && finalizers.is_empty() {
            state.kms_secrets.remove(key);
        }
        Ok(updated)
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        _previous: Option<&KMSSecretStatus>,
        next: &KMSSecretStatus,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        let version = state.bump();
        let obj = state
            .kms_secrets
            .get_mut(key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        obj.status = Some(next.clone());
        obj.metadata.resource_version = Some(version);
        state.status_writes += 1;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ClusterError> {
        Ok(self
            .state()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        let mut state = self.state();
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        if let Some(message) = &state.rejected_creates {
            return Err(ClusterError::Invalid(message.clone()));
        }
        let id = (namespace, name.clone());
        if state.secrets.contains_key(&id) {
            return Err(ClusterError::Conflict(format!("secret {name} already exists")));
        }
        let mut created = secret.clone();
        created.metadata.uid = Some(format!("uid-secret-{name}-{}", state.next_version));
        created.metadata.resource_version = Some(state.bump());
        state.secrets.insert(id, created.clone());
        state.secret_writes.push(SecretWrite::Create(name));
        Ok(created)
    }

    async fn patch_secret(
        &self,
        namespace: &str,
        name: &str,
        patch: &SecretPatch,
    ) -> Result<Secret, ClusterError> {
        let mut state = self.state();
        let id = (namespace.to_string(), name.to_string());
        if std::mem::take(&mut state.race_next_patch) {
            let version = state.bump();
            if let Some(secret) = state.secrets.get_mut(&id) {
                secret.metadata.resource_version = Some(version);
            }
        }
        let version = state.bump();
        let secret = state
            .secrets
            .get_mut(&id)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        if patch.resource_version.is_some()
            && patch.resource_version != secret.metadata.resource_version
        {
            return Err(ClusterError::Conflict(name.to_string()));
        }

        let data = secret.data.get_or_insert_with(BTreeMap::new);
        for (key, value) in &patch.set_data {
            data.insert(key.clone(), ByteString(value.as_bytes().to_vec()));
        }
        for key in &patch.remove_data {
            data.remove(key);
        }
        secret
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(patch.labels.clone());
        secret
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(patch.annotations.clone());
        secret.metadata.resource_version = Some(version);
        let patched = secret.clone();

        let touched = patch
            .touched_data_keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        state
            .secret_writes
            .push(SecretWrite::Patch(name.to_string(), touched));
        Ok(patched)
    }

    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<&str>,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(ClusterError::Api("injected delete failure".to_string()));
        }
        let id = (namespace.to_string(), name.to_string());
        let Some(existing) = state.secrets.get(&id) else {
            return Ok(());
        };
        if uid.is_some() && existing.metadata.uid.as_deref() != uid {
            return Err(ClusterError::Conflict(name.to_string()));
        }
        state.secrets.remove(&id);
        state.secret_writes.push(SecretWrite::Delete(name.to_string()));
        Ok(())
    }

    async fn publish_event(&self, _resource: &KMSSecret, event: &ControllerEvent) {
        self.state().events.push(event.clone());
    }
}

/// KMS stand-in mapping ciphertext bytes to plaintexts
///
/// Counts every call so tests can assert how often KMS would be hit.
pub struct FakeGateway {
    plaintexts: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    failures: Mutex<HashMap<Vec<u8>, DecryptionFailureReason>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        let plaintexts = HashMap::from([
            (b"c1".to_vec(), b"s3cr3t".to_vec()),
            (b"c2".to_vec(), b"n3wpass".to_vec()),
            (b"u1".to_vec(), b"admin".to_vec()),
        ]);
        Self {
            plaintexts: Mutex::new(plaintexts),
            failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }
}

impl FakeGateway {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make decrypts of `ciphertext` fail with `reason`
    pub fn fail(&self, ciphertext: &[u8], reason: DecryptionFailureReason) {
        self.failures
            .lock()
            .unwrap()
            .insert(ciphertext.to_vec(), reason);
    }

    pub fn heal(&self, ciphertext: &[u8]) {
        self.failures.lock().unwrap().remove(ciphertext);
    }

    /// Hold every decrypt for `delay` before answering
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl DecryptionGateway for FakeGateway {
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        region: &str,
    ) -> Result<Plaintext, DecryptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().unwrap().get(ciphertext).copied();
        if let Some(reason) = failure {
            return Err(DecryptionError::new(reason, key_id, region));
        }
        let plaintext = self.plaintexts.lock().unwrap().get(ciphertext).cloned();
        plaintext.map(Plaintext::new).ok_or_else(|| {
            DecryptionError::new(DecryptionFailureReason::InvalidCiphertext, key_id, region)
        })
    }
}

/// Lease kept in memory with versioned compare-and-swap
#[derive(Clone, Default)]
pub struct MemoryLease {
    inner: Arc<Mutex<Option<(LeaseRecord, u64)>>>,
}

impl MemoryLease {
    pub fn holder(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|(record, _)| record.holder.clone())
    }
}

#[async_trait]
impl LeaseBackend for MemoryLease {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        Ok(self.inner.lock().unwrap().as_ref().map(|(record, version)| LeaseRecord {
            resource_version: Some(version.to_string()),
            ..record.clone()
        }))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_some() {
            return Ok(false);
        }
        *inner = Some((record.clone(), 1));
        Ok(true)
    }

    async fn replace(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        let mut inner = self.inner.lock().unwrap();
        let Some((_, version)) = inner.as_ref() else {
            return Ok(false);
        };
        if record.resource_version.as_deref() != Some(version.to_string().as_str()) {
            return Ok(false);
        }
        let next = version + 1;
        *inner = Some((record.clone(), next));
        Ok(true)
    }
}

pub fn entry(field_name: &str, ciphertext_blob: &str, key_id: &str) -> DataEntry {
    DataEntry {
        field_name: field_name.to_string(),
        ciphertext_blob: ciphertext_blob.to_string(),
        key_id: key_id.to_string(),
        region: REGION.to_string(),
    }
}

pub fn kms_secret(name: &str, entries: Vec<DataEntry>) -> KMSSecret {
    let mut obj = KMSSecret::new(
        name,
        KMSSecretSpec {
            data_entries: entries,
            template: None,
        },
    );
    obj.metadata.namespace = Some(NAMESPACE.to_string());
    obj
}

pub fn template(name: Option<&str>, type_: Option<&str>) -> SecretTemplate {
    SecretTemplate {
        name: name.map(str::to_string),
        type_: type_.map(str::to_string),
        ..SecretTemplate::default()
    }
}

/// A Secret nobody controls
pub fn foreign_secret(name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            "password".to_string(),
            ByteString(b"hand-made".to_vec()),
        )])),
        ..Secret::default()
    }
}

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
        backoff_jitter: 0.0,
        ..ControllerConfig::default()
    }
}

/// Reconciler wired to a fake cluster and a fake gateway
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub gateway: Arc<FakeGateway>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        let cluster = Arc::new(FakeCluster::default());
        let gateway = Arc::new(FakeGateway::default());
        let reconciler = Reconciler::new(
            Arc::clone(&cluster) as Arc<dyn ClusterApi>,
            Arc::clone(&gateway) as Arc<dyn DecryptionGateway>,
            &test_config(),
        );
        Self {
            cluster,
            gateway,
            reconciler,
        }
    }

    pub async fn reconcile(&self, key: &ResourceKey) -> ReconcileOutcome {
        reconcile(&self.reconciler, key)
            .await
            .expect("reconcile should not escape an error")
    }
}
