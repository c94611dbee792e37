//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use kms_secrets_controller::prelude::*;
//! ```
//!
//! This brings into scope:
//! - All CRD types (`KMSSecret`, `DataEntry`, etc.)
//! - The cluster and decryption seams (`ClusterApi`, `DecryptionGateway`)
//! - Reconciler types (`Reconciler`, `ReconcilerError`, etc.)
//! - Config types (`ControllerConfig`, `Args`)

// CRD types - most commonly used
pub use crate::crd::*;

// Seams - needed for alternative cluster or KMS backends
pub use crate::cluster::{ClusterApi, ClusterError, ResourceKey};
pub use crate::provider::{DecryptionError, DecryptionFailureReason, DecryptionGateway, Plaintext};

// Reconciler types - core controller functionality
pub use crate::controller::reconciler::{
    reconcile, ApplyResult, ReconcileOutcome, Reconciler, ReconcilerError,
};

// Config types - for configuration management
pub use crate::config::{Args, ControllerConfig};

// Leader election
pub use crate::runtime::leader::{LeaseBackend, LeaderElector, LeadershipGate};
