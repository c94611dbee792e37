//! # Runtime
//!
//! Process runtime around the reconciler.
//!
//! - `initialization`: tracing, metrics server, Kubernetes client, reconciler
//! - `leader`: Lease-based leader election and the leadership gate
//! - `dispatch`: gate-checked entry into the reconciler
//! - `watch_loop`: the `kube_runtime` controller, resync ticker and shutdown
//! - `error_policy`: backoff for errors that escape a reconcile

pub mod dispatch;
pub mod error_policy;
pub mod initialization;
pub mod leader;
pub mod watch_loop;

use crate::config::ControllerConfig;
use crate::constants::LEADER_ELECTION_ID;
use anyhow::Result;
use leader::{KubeLeaseBackend, LeaderElector, LeadershipGate};
use std::sync::Arc;
use tracing::{info, warn};
use watch_loop::{run_watch_loop, Context, StopReason};

/// Run the controller until shutdown
///
/// Returns an error when leadership is lost, so the process exits and
/// rejoins as a standby after restart.
pub async fn run(config: ControllerConfig) -> Result<()> {
    let init = initialization::initialize(&config).await?;

    let (gate, mut guard) = if config.enable_leader_election {
        let backend = KubeLeaseBackend::new(
            init.client.clone(),
            &config.leader_election_namespace,
            LEADER_ELECTION_ID,
        );
        let elector = Arc::new(LeaderElector::new(
            backend,
            &config.identity,
            config.lease_duration(),
            config.lease_renew_interval(),
            config.lease_retry_interval(),
        ));
        let gate = elector.gate();
        info!(
            lease = LEADER_ELECTION_ID,
            namespace = %config.leader_election_namespace,
            identity = %config.identity,
            "Leader election enabled"
        );
        let guard = elector.acquire().await;
        (gate, Some(guard))
    } else {
        (LeadershipGate::always_open(), None)
    };

    let leadership_lost = guard.as_mut().map(leader::LeaderGuard::lost_signal);
    let leadership_lost = async move {
        match leadership_lost {
            Some(lost) => lost.await,
            None => futures::future::pending::<()>().await,
        }
    };

    let ctx = Arc::new(Context {
        reconciler: Arc::clone(&init.reconciler),
        gate,
    });

    let reason = run_watch_loop(
        init.kms_secrets,
        init.secrets,
        ctx,
        &config,
        Arc::clone(&init.server_state),
        leadership_lost,
    )
    .await?;

    match reason {
        StopReason::Signal => {
            if let Some(guard) = guard.take() {
                if let Err(e) = guard.release_leadership().await {
                    warn!(error = %e, "Failed to release lease");
                }
            }
            info!("Controller stopped");
            Ok(())
        }
        StopReason::LeadershipLost => Err(anyhow::anyhow!(
            "leadership lost, exiting to rejoin as standby"
        )),
    }
}
