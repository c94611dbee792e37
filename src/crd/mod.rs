//! # Custom Resource Definitions
//!
//! CRD types for the KMS Secrets Controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - `KMSSecret` specification (encrypted fields and Secret template)
//! - `status.rs` - Status types for tracking reconciliation state

mod spec;
mod status;

// Re-export all public types
pub use spec::{DataEntry, KMSSecret, KMSSecretSpec, SecretTemplate};
pub use status::{Condition, FieldStatus, KMSSecretStatus};
