//! # CRD Generator
//!
//! Generates the Kubernetes CustomResourceDefinition YAML for `KMSSecret`
//! from the Rust type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Generate CRD YAML
//! cargo run --bin crdgen > config/crd/kmssecret.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kms_secrets_controller::crd::KMSSecret;
use kube::core::CustomResourceExt;

fn main() {
    let crd = KMSSecret::crd();

    match serde_yaml::to_string(&crd) {
        Ok(yaml) => {
            print!("{yaml}");
        }
        Err(e) => {
            eprintln!("Failed to serialize CRD to YAML: {e}");
            std::process::exit(1);
        }
    }
}
