//! # KMS Secrets Controller
//!
//! A Kubernetes controller that turns `KMSSecret` resources into native
//! `Secret`s by decrypting their fields with AWS KMS.
//!
//! ## Overview
//!
//! 1. **Watching KMSSecrets** - Monitors `KMSSecret` resources and the Secrets they own
//! 2. **Decrypting fields** - Calls KMS `Decrypt` per field, skipping unchanged fields
//! 3. **Applying Secrets** - Creates or minimally patches the generated Secret
//! 4. **Cleaning up** - Deletes the generated Secret before the resource goes away
//!
//! ## Features
//!
//! - **Decryption cache**: identical ciphertexts cost one KMS call
//! - **Leader election**: one active replica via a Lease (`--enable-leader-election`)
//! - **Namespaced mode**: watch only the controller's namespace (`--namespaced`)
//! - **Prometheus metrics**: exposed on `--metrics-addr` with health probes

use anyhow::Result;
use clap::Parser;
use kms_secrets_controller::config::{Args, ControllerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ControllerConfig::from_args(&args)?;

    kms_secrets_controller::runtime::run(config).await
}
