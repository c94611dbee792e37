//! KMS Secrets Controller Library
//!
//! Core functionality of the KMS Secrets Controller: a Kubernetes controller
//! that decrypts the fields of `KMSSecret` resources with AWS KMS and keeps a
//! native `Secret` in sync with them.
//!
//! ## Quick Start
//!
//! ```rust
//! use kms_secrets_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

// Re-export modules so they can be tested
pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod provider;
pub mod runtime;
