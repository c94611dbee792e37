//! # Watch Loop
//!
//! Controller watch loop that monitors `KMSSecret` resources (and the Secrets
//! they own) and triggers reconciliation when changes are detected.
//!
//! `kube_runtime::Controller` is the work queue: it deduplicates keys, never
//! runs one key on two workers at once and bounds parallelism. On top of
//! watch events a resync ticker reconciles every object each
//! `resync_interval`, which corrects externally edited Secrets.

use crate::cluster::ResourceKey;
use crate::config::ControllerConfig;
use crate::controller::reconciler::{ReconcileOutcome, Reconciler, ReconcilerError};
use crate::controller::server::ServerState;
use crate::crd::KMSSecret;
use crate::observability;
use crate::runtime::dispatch::dispatch_reconcile;
use crate::runtime::error_policy::{handle_reconciliation_error, log_controller_error};
use crate::runtime::leader::LeadershipGate;
use futures::{FutureExt, SinkExt, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube_runtime::{controller, controller::Action, watcher, Controller};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Instrument};

/// Shared state handed to every reconcile
#[derive(Debug)]
pub struct Context {
    pub reconciler: Arc<Reconciler>,
    pub gate: LeadershipGate,
}

/// Why the watch loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// SIGINT/SIGTERM
    Signal,
    LeadershipLost,
}

/// Map a reconcile outcome to a controller action
pub fn action_for(outcome: ReconcileOutcome) -> Action {
    match outcome {
        ReconcileOutcome::Synced | ReconcileOutcome::TerminalFailure => Action::await_change(),
        ReconcileOutcome::Requeue(after) => Action::requeue(after),
    }
}

/// Run the controller until a shutdown signal or loss of leadership
///
/// After the stop trigger, in-flight reconciles get the shutdown grace period
/// to finish; anything still running after that is dropped.
pub async fn run_watch_loop(
    kms_secrets: Api<KMSSecret>,
    secrets: Api<Secret>,
    ctx: Arc<Context>,
    config: &ControllerConfig,
    server_state: Arc<ServerState>,
    leadership_lost: impl Future<Output = ()> + Send + 'static,
) -> Result<StopReason, anyhow::Error> {
    info!(
        concurrency = config.max_concurrent_reconciles,
        resync_secs = config.resync_interval_secs,
        "Starting controller watch loop..."
    );

    let (stop_tx, stop_rx) = watch::channel(None::<StopReason>);
    let (shutdown_tx, shutdown_rx) = futures::channel::oneshot::channel::<()>();

    // Stop trigger: first of shutdown signal or leadership loss
    let shutdown_server_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        let reason = tokio::select! {
            () = shutdown_signal() => StopReason::Signal,
            () = leadership_lost => StopReason::LeadershipLost,
        };
        match reason {
            StopReason::Signal => {
                info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
            }
            StopReason::LeadershipLost => {
                warn!("Leadership lost, stopping controller");
            }
        }
        shutdown_server_state.set_ready(false);
        let _ = stop_tx.send(Some(reason));
        let _ = shutdown_tx.send(());
    });

    let resync = resync_trigger(Arc::clone(&ctx.reconciler), config.resync_interval());

    let controller_config =
        controller::Config::default().concurrency(config.max_concurrent_reconciles);
    let controller_future = Controller::new(kms_secrets, watcher::Config::default())
        .owns(secrets, watcher::Config::default())
        .with_config(controller_config)
        .reconcile_all_on(resync)
        .graceful_shutdown_on(shutdown_rx.map(|_| ()))
        .run(reconcile_object, handle_reconciliation_error, ctx)
        .for_each(|result| {
            if let Err(e) = &result {
                log_controller_error(e);
            }
            futures::future::ready(())
        });

    server_state.set_ready(true);
    info!("Controller running");

    let grace_period = config.shutdown_grace_period();
    let grace_elapsed = {
        let stop_rx = stop_rx.clone();
        async move {
            stopped(stop_rx).await;
            tokio::time::sleep(grace_period).await;
        }
    };

    tokio::select! {
        () = controller_future => {
            info!("Controller stopped gracefully");
        }
        () = grace_elapsed => {
            warn!(
                grace_secs = grace_period.as_secs(),
                "Shutdown grace period elapsed, aborting in-flight reconciles"
            );
        }
    }

    let reason = (*stop_rx.borrow()).unwrap_or(StopReason::Signal);
    Ok(reason)
}

async fn reconcile_object(obj: Arc<KMSSecret>, ctx: Arc<Context>) -> Result<Action, ReconcilerError> {
    let Some(key) = ResourceKey::from_object(&obj) else {
        return Ok(Action::await_change());
    };

    let reconcile_span = tracing::info_span!(
        "controller.watch.reconcile",
        resource.namespace = %key.namespace,
        resource.name = %key.name,
        resource.generation = obj.metadata.generation.unwrap_or(0),
    );

    async move {
        match dispatch_reconcile(&ctx.gate, &ctx.reconciler, &key).await {
            None => Ok(Action::await_change()),
            Some(Ok(outcome)) => Ok(action_for(outcome)),
            Some(Err(e)) => Err(e),
        }
    }
    .instrument(reconcile_span)
    .await
}

/// Stream that fires every `interval` after starting a new resync sweep
fn resync_trigger(
    reconciler: Arc<Reconciler>,
    interval: Duration,
) -> futures::channel::mpsc::Receiver<()> {
    let (mut tx, rx) = futures::channel::mpsc::channel(0);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately and the initial list already
        // reconciles everything
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let epoch = reconciler.begin_resync_sweep();
            info!(epoch, "Starting resync sweep");
            observability::metrics::increment_requeues("resync");
            if tx.send(()).await.is_err() {
                return;
            }
        }
    });
    rx
}

async fn stopped(mut rx: watch::Receiver<Option<StopReason>>) {
    let _ = rx.wait_for(Option::is_some).await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only handling SIGINT");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
