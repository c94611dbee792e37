//! # Configuration
//!
//! Process flags and controller configuration.
//!
//! - `controller`: [`ControllerConfig`] loaded from the environment
//! - [`Args`]: command line flags, applied on top of the environment

pub mod controller;

pub use controller::{own_namespace, ConfigError, ControllerConfig};

use crate::constants::DEFAULT_METRICS_ADDR;
use clap::Parser;

/// Command line flags of the controller binary
#[derive(Parser, Debug, Clone)]
#[command(name = "kms-secrets-controller")]
#[command(about = "Decrypts KMSSecret resources with AWS KMS into Kubernetes Secrets", long_about = None)]
#[command(version)]
pub struct Args {
    /// The address the metric endpoint binds to
    #[arg(long = "metrics-addr", default_value = DEFAULT_METRICS_ADDR)]
    pub metrics_addr: String,

    /// Enable leader election for controller manager. Enabling this will ensure there is only one active controller manager
    #[arg(long = "enable-leader-election", default_value_t = false)]
    pub enable_leader_election: bool,

    /// Only watch KMSSecret resources in the controller's own namespace
    #[arg(long, default_value_t = false)]
    pub namespaced: bool,

    /// Log level (debug, info)
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    pub log_level: String,
}
