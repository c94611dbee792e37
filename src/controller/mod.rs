//! # Controller
//!
//! Core controller modules for the KMS Secrets Controller.
//!
//! - `backoff`: Exponential backoff with jitter for retries
//! - `cache`: Decryption cache keyed by ciphertext fingerprint
//! - `reconciler`: Core reconciliation logic
//! - `server`: HTTP server for metrics and health checks

pub mod backoff;
pub mod cache;
pub mod reconciler;
pub mod server;
