//! # Reconciler
//!
//! Core reconciliation logic for `KMSSecret` resources.
//!
//! The reconciler:
//! - Validates the spec and decodes ciphertexts
//! - Resolves each field from the live Secret, the decryption cache or KMS
//! - Creates, patches or recreates the generated Secret with minimal writes
//! - Cleans up generated Secrets before releasing the finalizer
//! - Records per-field fingerprints and conditions in status
//!
//! ## Reconciliation Flow
//!
//! 1. Fetch the `KMSSecret`
//! 2. Deletion: delete generated Secrets, remove finalizer
//! 3. Ensure finalizer
//! 4. Validate, resolve fields, compute the desired Secret
//! 5. Apply
//! 6. Update status

pub mod apply;
pub mod desired;
pub mod finalize;
pub mod fingerprint;
pub mod reconcile;
pub mod status;
pub mod types;
pub mod validation;

// Re-export public API
pub use apply::ApplyResult;
pub use reconcile::reconcile;
pub use types::{BackoffState, ReconcileOutcome, Reconciler, ReconcilerError};
pub use validation::ValidationError;
