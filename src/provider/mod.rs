//! # Provider Modules
//!
//! The decryption boundary between the controller and the key-management service.
//!
//! - [`DecryptionGateway`]: trait implemented by every decryption backend
//! - `aws`: AWS KMS implementation
//! - `error`: failure classification (retryable vs terminal)

use async_trait::async_trait;
use std::sync::Arc;
use zeroize::Zeroizing;

pub mod aws;
pub mod error;

pub use error::{classify_kms_error_code, DecryptionError, DecryptionFailureReason};

/// Decrypted field value
///
/// The buffer is wiped when the last clone is dropped and is never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Plaintext(Arc<Zeroizing<Vec<u8>>>);

impl Plaintext {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Zeroizing::new(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Plaintext {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl std::fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Plaintext(<redacted {} bytes>)", self.len())
    }
}

/// Decrypts ciphertext blobs with a key-management service
#[async_trait]
pub trait DecryptionGateway: Send + Sync {
    /// Decrypt `ciphertext`, encrypted under `key_id`, using the service in `region`
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        region: &str,
    ) -> Result<Plaintext, DecryptionError>;
}
