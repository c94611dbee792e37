//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, and Kubernetes client setup.

use crate::cluster::KubeClusterApi;
use crate::config::ControllerConfig;
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::crd::KMSSecret;
use crate::observability;
use crate::provider::aws::AwsKmsGateway;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::{api::Api, api::ListParams, Client};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// API for the KMSSecret CRD, scoped to the watched namespace(s)
    pub kms_secrets: Api<KMSSecret>,
    /// API for generated Secrets, same scope
    pub secrets: Api<Secret>,
    /// Reconciler context
    pub reconciler: Arc<Reconciler>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.is_ready())
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Reconciler setup
/// - Startup resource summary
pub async fn initialize(config: &ControllerConfig) -> Result<InitializationResult> {
    // Required for rustls 0.23+ when no default provider is set via features
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    init_tracing(config)?;

    info!("Starting KMS Secrets Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    // Initialize metrics
    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());

    // Start HTTP server for metrics and probes in the background, and wait
    // for it to bind before going on
    let bind_addr = config.metrics_bind_addr();
    let server_state_clone = Arc::clone(&server_state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(bind_addr, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let (kms_secrets, secrets): (Api<KMSSecret>, Api<Secret>) = match &config.watch_namespace {
        Some(namespace) => {
            info!(namespace = %namespace, "Watching KMSSecret resources in one namespace");
            (
                Api::namespaced(client.clone(), namespace),
                Api::namespaced(client.clone(), namespace),
            )
        }
        None => {
            info!("Watching KMSSecret resources in all namespaces");
            (Api::all(client.clone()), Api::all(client.clone()))
        }
    };

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(KubeClusterApi::new(client.clone())),
        Arc::new(AwsKmsGateway::new()),
        config,
    ));

    log_startup_summary(&kms_secrets).await;

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        kms_secrets,
        secrets,
        reconciler,
        server_state,
    })
}

fn init_tracing(config: &ControllerConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(config.log_filter()))
        .context("Invalid log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ControllerConfig,
) -> Result<()> {
    let startup_timeout = std::time::Duration::from_secs(config.startup_timeout_secs);
    let poll_interval = std::time::Duration::from_millis(config.poll_interval_ms);
    let start_time = std::time::Instant::now();

    loop {
        // Check if server task crashed
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.is_listening() {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}

/// Log existing KMSSecret resources by namespace
///
/// The controller's initial list reconciles all of them; this only gives
/// operators a picture of what the controller is about to manage.
async fn log_startup_summary(kms_secrets: &Api<KMSSecret>) {
    let list = match kms_secrets.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            warn!(
                error = %e,
                "KMSSecret CRD is not queryable yet; the watch will retry"
            );
            return;
        }
    };

    let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for item in &list.items {
        let namespace = item.metadata.namespace.as_deref().unwrap_or("default");
        let name = item.metadata.name.as_deref().unwrap_or("unknown");
        by_namespace
            .entry(namespace.to_string())
            .or_default()
            .push(name.to_string());
    }

    info!("KMS Secrets Controller - Startup Resource Summary");
    info!("Resource Kind: KMSSecret");
    info!("Total Resources: {}", list.items.len());
    info!("Namespaces: {}", by_namespace.len());

    for (namespace, mut names) in by_namespace {
        names.sort();
        let shown = if names.len() <= 3 {
            names.join(", ")
        } else {
            format!("{}, ... ({} total)", names[..3].join(", "), names.len())
        };
        info!("Namespace: {}", namespace);
        info!("  Resources ({}): {}", names.len(), shown);
    }
}
