//! # Leader Election Tests
//!
//! Lease acquisition, renewal, takeover and the dispatch gate, run against
//! an in-memory Lease.

mod common;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{entry, kms_secret, Harness, MemoryLease, C1};
use kms_secrets_controller::controller::reconciler::ReconcileOutcome;
use kms_secrets_controller::prelude::{LeaderElector, LeaseBackend};
use kms_secrets_controller::runtime::dispatch::dispatch_reconcile;
use kms_secrets_controller::runtime::leader::{LeaderElectionError, LeaseRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lease whose reads stop answering once `stalled` is set
#[derive(Clone, Default)]
struct StallingLease {
    inner: MemoryLease,
    stalled: Arc<AtomicBool>,
}

#[async_trait]
impl LeaseBackend for StallingLease {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        if self.stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.inner.get().await
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        self.inner.create(record).await
    }

    async fn replace(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        self.inner.replace(record).await
    }
}

fn elector(lease: &MemoryLease, identity: &str) -> LeaderElector<MemoryLease> {
    LeaderElector::new(
        lease.clone(),
        identity,
        Duration::from_secs(15),
        Duration::from_secs(5),
        Duration::from_secs(2),
    )
}

#[tokio::test]
async fn test_only_one_replica_holds_the_lease() {
    let lease = MemoryLease::default();
    let a = elector(&lease, "replica-a");
    let b = elector(&lease, "replica-b");
    let t0 = Utc::now();

    assert!(a.try_acquire_or_renew_at(t0).await.unwrap());
    assert!(!b.try_acquire_or_renew_at(t0).await.unwrap());
    assert!(a.gate().is_open());
    assert!(!b.gate().is_open());
    assert_eq!(lease.holder().as_deref(), Some("replica-a"));

    // Renewal keeps the standby out past the original expiry
    assert!(a.try_acquire_or_renew_at(t0 + ChronoDuration::seconds(10)).await.unwrap());
    assert!(!b.try_acquire_or_renew_at(t0 + ChronoDuration::seconds(20)).await.unwrap());

    // The holder stops renewing: the standby takes over once it expires
    let later = t0 + ChronoDuration::seconds(26);
    assert!(b.try_acquire_or_renew_at(later).await.unwrap());
    assert!(!a.try_acquire_or_renew_at(later).await.unwrap());
    assert!(!a.gate().is_open());
    assert!(b.gate().is_open());

    let record = lease.get().await.unwrap().unwrap();
    assert_eq!(record.holder.as_deref(), Some("replica-b"));
    assert_eq!(record.transitions, 1);
    assert_eq!(record.lease_duration_secs, 15);
}

#[tokio::test]
async fn test_stale_write_loses_the_race() {
    let lease = MemoryLease::default();
    let a = elector(&lease, "replica-a");
    assert!(a.try_acquire_or_renew().await.unwrap());

    let stale = lease.get().await.unwrap().unwrap();
    assert!(a.try_acquire_or_renew().await.unwrap());

    // A write based on the old version is rejected
    let mut stolen = stale;
    stolen.holder = Some("replica-b".to_string());
    assert!(!lease.replace(&stolen).await.unwrap());
    assert_eq!(lease.holder().as_deref(), Some("replica-a"));
}

#[tokio::test]
async fn test_standby_never_reconciles() {
    let h = Harness::new();
    let key = h
        .cluster
        .add_kms_secret(kms_secret("app", vec![entry("password", C1, "k1")]));
    let lease = MemoryLease::default();
    let leader = elector(&lease, "replica-a");
    let standby = elector(&lease, "replica-b");

    assert!(leader.try_acquire_or_renew().await.unwrap());
    assert!(!standby.try_acquire_or_renew().await.unwrap());

    assert!(dispatch_reconcile(&standby.gate(), &h.reconciler, &key)
        .await
        .is_none());
    assert_eq!(h.gateway.calls(), 0);
    assert!(h.cluster.secret("app").is_none());

    let outcome = dispatch_reconcile(&leader.gate(), &h.reconciler, &key)
        .await
        .expect("leader dispatches")
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Synced);
    assert_eq!(h.gateway.calls(), 1);
    assert!(h.cluster.secret("app").is_some());
}

#[tokio::test]
async fn test_release_allows_immediate_takeover() {
    let lease = MemoryLease::default();
    let a = elector(&lease, "replica-a");
    let b = elector(&lease, "replica-b");

    assert!(a.try_acquire_or_renew().await.unwrap());
    a.release_lease().await.unwrap();

    assert!(!a.is_leader());
    assert_eq!(lease.holder(), None);
    assert!(b.try_acquire_or_renew().await.unwrap());
}

#[tokio::test]
async fn test_guard_signals_lost_leadership() {
    let lease = MemoryLease::default();
    let a = Arc::new(LeaderElector::new(
        lease.clone(),
        "replica-a",
        Duration::from_secs(15),
        Duration::from_millis(20),
        Duration::from_millis(20),
    ));
    let b = elector(&lease, "replica-b");

    let mut guard = Arc::clone(&a).acquire().await;
    assert!(a.is_leader());

    // Another replica takes the Lease from a clock far ahead
    assert!(b
        .try_acquire_or_renew_at(Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap());

    tokio::time::timeout(Duration::from_secs(5), guard.lost())
        .await
        .expect("renewal notices the new holder");
    assert!(!a.is_leader());

    drop(guard);
    assert!(!a.gate().is_open());
}

#[tokio::test(start_paused = true)]
async fn test_hung_renewal_closes_gate_within_lease_duration() {
    let lease = StallingLease::default();
    let a = Arc::new(LeaderElector::new(
        lease.clone(),
        "replica-a",
        Duration::from_secs(15),
        Duration::from_secs(5),
        Duration::from_secs(2),
    ));
    let b = elector(&lease.inner, "replica-b");

    let mut guard = Arc::clone(&a).acquire().await;
    let gate = a.gate();
    assert!(gate.is_open());

    let stalled_at = tokio::time::Instant::now();
    lease.stalled.store(true, Ordering::SeqCst);

    tokio::time::timeout(Duration::from_secs(60), guard.lost())
        .await
        .expect("a hung renewal gives up");
    assert!(stalled_at.elapsed() <= Duration::from_secs(15));
    assert!(!gate.is_open());

    // The standby only sees an expired Lease after the old leader stopped
    assert!(b
        .try_acquire_or_renew_at(Utc::now() + ChronoDuration::seconds(60))
        .await
        .unwrap());
    assert!(b.gate().is_open());
    assert!(!gate.is_open());
}
