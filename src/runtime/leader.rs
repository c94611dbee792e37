//! # Leader Election
//!
//! Leader election over a `coordination.k8s.io/v1` Lease. Only the replica
//! holding the Lease runs the controller; standbys wait and retry.
//!
//! ## Atomicity
//!
//! Every write is a compare-and-swap on the Lease `resourceVersion`. If the
//! Lease changed between read and write, the write conflicts and this round
//! is lost, so two replicas can never both believe they acquired it.
//!
//! Storage sits behind [`LeaseBackend`] so the election logic runs unchanged
//! against the API server ([`KubeLeaseBackend`]) or an in-memory Lease.
//!
//! ## Renewal deadline
//!
//! Each renewal must finish within `renew_deadline`, and never later than
//! `lease_duration` after the last successful renewal. A renewal that hangs
//! closes the gate before a standby can consider the Lease expired.

use crate::constants::CONTROLLER_NAME;
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, PostParams};
use kube::Client;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
    #[error("invalid lease {name}: {message}")]
    InvalidLease { name: String, message: String },
    #[error("lease request did not finish within {0:?}")]
    Timeout(Duration),
}

/// The parts of a Lease the election reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub lease_duration_secs: i64,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub transitions: i32,
    /// Version the record was read at; writes are preconditioned on it
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// Whether the holder's claim has run out at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.renew_time {
            Some(renewed) => now > renewed + chrono::Duration::seconds(self.lease_duration_secs),
            None => true,
        }
    }
}

/// Lease storage with compare-and-swap writes
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError>;

    /// Create the Lease; `false` if it already exists
    async fn create(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError>;

    /// Replace the Lease if it is still at `record.resource_version`;
    /// `false` on conflict
    async fn replace(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError>;
}

/// Lease stored in the Kubernetes API
pub struct KubeLeaseBackend {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl std::fmt::Debug for KubeLeaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeaseBackend")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeLeaseBackend {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn invalid(&self, message: impl std::fmt::Display) -> LeaderElectionError {
        LeaderElectionError::InvalidLease {
            name: self.name.clone(),
            message: message.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Result<Lease, LeaderElectionError> {
        let time = |t: Option<DateTime<Utc>>| {
            t.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
        };
        let mut metadata = json!({
            "name": self.name,
            "namespace": self.namespace,
        });
        if let Some(resource_version) = &record.resource_version {
            metadata["resourceVersion"] = json!(resource_version);
        }
        let lease = json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": metadata,
            "spec": {
                "holderIdentity": record.holder,
                "leaseDurationSeconds": record.lease_duration_secs,
                "acquireTime": time(record.acquire_time),
                "renewTime": time(record.renew_time),
                "leaseTransitions": record.transitions,
            }
        });
        serde_json::from_value(lease).map_err(|e| self.invalid(e))
    }

    fn to_record(&self, lease: &Lease) -> Result<LeaseRecord, LeaderElectionError> {
        let value = serde_json::to_value(lease).map_err(|e| self.invalid(e))?;
        let spec = &value["spec"];
        let time = |field: &str| -> Result<Option<DateTime<Utc>>, LeaderElectionError> {
            spec[field]
                .as_str()
                .map(|s| {
                    DateTime::parse_from_rfc3339(s)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| self.invalid(e))
                })
                .transpose()
        };

        Ok(LeaseRecord {
            holder: spec["holderIdentity"].as_str().map(str::to_string),
            lease_duration_secs: spec["leaseDurationSeconds"].as_i64().unwrap_or_default(),
            acquire_time: time("acquireTime")?,
            renew_time: time("renewTime")?,
            transitions: spec["leaseTransitions"]
                .as_i64()
                .and_then(|t| i32::try_from(t).ok())
                .unwrap_or_default(),
            resource_version: lease.metadata.resource_version.clone(),
        })
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..PostParams::default()
        }
    }
}

#[async_trait]
impl LeaseBackend for KubeLeaseBackend {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        match self.api.get_opt(&self.name).await? {
            Some(lease) => Ok(Some(self.to_record(&lease)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        let lease = self.to_lease(record)?;
        match self.api.create(&Self::post_params(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        if record.resource_version.is_none() {
            return Err(LeaderElectionError::MissingResourceVersion(self.name.clone()));
        }
        let lease = self.to_lease(record)?;
        match self
            .api
            .replace(&self.name, &Self::post_params(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared view of whether this replica may dispatch reconciles
#[derive(Debug, Clone)]
pub struct LeadershipGate {
    open: Arc<AtomicBool>,
}

impl LeadershipGate {
    /// Gate for a single replica running without leader election
    pub fn always_open() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Leader elector using a Lease
pub struct LeaderElector<B> {
    backend: B,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    renew_deadline: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl<B> std::fmt::Debug for LeaderElector<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("identity", &self.identity)
            .field("lease_duration", &self.lease_duration)
            .field("renew_deadline", &self.renew_deadline)
            .field("is_leader", &self.is_leader.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<B: LeaseBackend + 'static> LeaderElector<B> {
    /// Create an elector; renewals get two thirds of `lease_duration` to finish
    pub fn new(
        backend: B,
        identity: &str,
        lease_duration: Duration,
        renew_interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            backend,
            identity: identity.to_string(),
            lease_duration,
            renew_interval,
            renew_deadline: lease_duration * 2 / 3,
            retry_interval,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Gate that is open exactly while this elector holds the Lease
    pub fn gate(&self) -> LeadershipGate {
        LeadershipGate {
            open: Arc::clone(&self.is_leader),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::SeqCst);
        metrics::set_is_leader(leader);
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the Lease. When renewal fails the gate closes
    /// and the guard's lost signal fires.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard<B> {
        info!(identity = %self.identity, "Waiting for leadership...");

        loop {
            let attempt = tokio::time::timeout(self.renew_deadline, self.try_acquire_or_renew())
                .await
                .unwrap_or_else(|_| Err(LeaderElectionError::Timeout(self.renew_deadline)));
            match attempt {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard<B> {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        self.try_acquire_or_renew_at(Utc::now()).await
    }

    /// One election round at `now`: create, renew or take over the Lease
    ///
    /// Returns whether this elector holds the Lease afterwards, and opens or
    /// closes the gate to match.
    pub async fn try_acquire_or_renew_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let held = match self.backend.get().await? {
            None => {
                let created = self.backend.create(&self.fresh_record(now, 0, None)).await?;
                if created {
                    info!(identity = %self.identity, "Created new lease");
                }
                created
            }
            Some(existing) if existing.holder.as_deref() == Some(self.identity.as_str()) => {
                let renewed = LeaseRecord {
                    renew_time: Some(now),
                    lease_duration_secs: self.lease_duration_secs(),
                    ..existing
                };
                let ok = self.backend.replace(&renewed).await?;
                if ok {
                    debug!(identity = %self.identity, "Lease renewed");
                } else {
                    warn!(identity = %self.identity, "Lease renewal conflict - lost leadership");
                }
                ok
            }
            Some(existing) if existing.holder.is_none() || existing.is_expired_at(now) => {
                let transitions = existing.transitions + 1;
                let taken = self
                    .backend
                    .replace(&self.fresh_record(now, transitions, existing.resource_version))
                    .await?;
                if taken {
                    info!(identity = %self.identity, transitions, "Took over expired lease");
                }
                taken
            }
            Some(_) => false,
        };

        self.set_leader(held);
        Ok(held)
    }

    fn fresh_record(
        &self,
        now: DateTime<Utc>,
        transitions: i32,
        resource_version: Option<String>,
    ) -> LeaseRecord {
        LeaseRecord {
            holder: Some(self.identity.clone()),
            lease_duration_secs: self.lease_duration_secs(),
            acquire_time: Some(now),
            renew_time: Some(now),
            transitions,
            resource_version,
        }
    }

    fn lease_duration_secs(&self) -> i64 {
        i64::try_from(self.lease_duration.as_secs()).unwrap_or(i64::MAX)
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewed = Instant::now();
        loop {
            let remaining = self.lease_duration.saturating_sub(last_renewed.elapsed());
            tokio::time::sleep(self.renew_interval.min(remaining)).await;

            let remaining = self.lease_duration.saturating_sub(last_renewed.elapsed());
            let deadline = self.renew_deadline.min(remaining);
            let attempt = tokio::time::timeout(deadline, self.try_acquire_or_renew())
                .await
                .unwrap_or(Err(LeaderElectionError::Timeout(deadline)));

            match attempt {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "Leadership lost to another holder");
                    break;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Leadership lost");
                    break;
                }
            }
        }
        self.set_leader(false);
        let _ = lost_tx.send(());
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    pub async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let Some(existing) = self.backend.get().await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };
        if existing.holder.as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        self.set_leader(false);
        let released = LeaseRecord {
            holder: None,
            renew_time: Some(Utc::now() - chrono::Duration::seconds(self.lease_duration_secs())),
            ..existing
        };
        if self.backend.replace(&released).await? {
            info!(identity = %self.identity, "Lease released for fast failover");
        }
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// While the guard exists the elector renews the Lease. The renewal task is
/// aborted and the gate closed when the guard is dropped.
pub struct LeaderGuard<B: LeaseBackend + 'static> {
    elector: Arc<LeaderElector<B>>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl<B: LeaseBackend + 'static> std::fmt::Debug for LeaderGuard<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderGuard")
            .field("elector", &self.elector)
            .finish_non_exhaustive()
    }
}

impl<B: LeaseBackend + 'static> LeaderGuard<B> {
    /// Future resolving when leadership is lost
    ///
    /// Can be taken once; later calls resolve never.
    pub fn lost_signal(&mut self) -> impl Future<Output = ()> + Send + 'static {
        let rx = self.lost_rx.take();
        async move {
            match rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => futures::future::pending::<()>().await,
            }
        }
    }

    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        self.lost_signal().await;
    }

    /// Release leadership by clearing the Lease holder
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl<B: LeaseBackend + 'static> Drop for LeaderGuard<B> {
    fn drop(&mut self) {
        self.elector.set_leader(false);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}
