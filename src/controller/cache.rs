//! # Decryption Cache
//!
//! Process-local cache of decrypted field values keyed by
//! `(ciphertext fingerprint, key id)`.
//!
//! Uses moka for bounded, concurrent caching. Concurrent misses for the same
//! key are coalesced into a single load; failed loads are not cached.
//! Entries live in memory only and are shared across resources, so two
//! KMSSecrets carrying the same ciphertext cost one KMS call.

use crate::observability::metrics;
use crate::provider::{DecryptionError, Plaintext};
use moka::future::Cache;
use std::future::Future;

/// Cache key: content fingerprint plus the key the content was encrypted under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: String,
    pub key_id: String,
}

impl CacheKey {
    pub fn new(fingerprint: &str, key_id: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            key_id: key_id.to_string(),
        }
    }
}

/// Bounded plaintext cache
pub struct DecryptionCache {
    cache: Cache<CacheKey, Plaintext>,
}

impl std::fmt::Debug for DecryptionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionCache")
            .field("entry_count", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl DecryptionCache {
    /// Create a cache holding at most `max_capacity` plaintexts
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    pub async fn lookup(&self, fingerprint: &str, key_id: &str) -> Option<Plaintext> {
        self.cache.get(&CacheKey::new(fingerprint, key_id)).await
    }

    pub async fn store(&self, fingerprint: &str, key_id: &str, plaintext: Plaintext) {
        self.cache
            .insert(CacheKey::new(fingerprint, key_id), plaintext)
            .await;
    }

    pub async fn invalidate(&self, fingerprint: &str, key_id: &str) {
        self.cache
            .invalidate(&CacheKey::new(fingerprint, key_id))
            .await;
    }

    /// Return the cached plaintext, or run `load` and cache its result
    ///
    /// Callers racing on the same key wait for the first caller's load instead
    /// of starting their own. A load error is returned to every waiter and
    /// leaves the key uncached.
    pub async fn get_or_decrypt<F>(
        &self,
        fingerprint: &str,
        key_id: &str,
        load: F,
    ) -> Result<Plaintext, DecryptionError>
    where
        F: Future<Output = Result<Plaintext, DecryptionError>>,
    {
        let entry = self
            .cache
            .entry(CacheKey::new(fingerprint, key_id))
            .or_try_insert_with(load)
            .await
            .map_err(|e| (*e).clone())?;

        if entry.is_fresh() {
            metrics::increment_cache_misses();
        } else {
            metrics::increment_cache_hits();
        }
        Ok(entry.into_value())
    }

    /// Approximate number of cached entries
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Run pending maintenance tasks (eviction, invalidation bookkeeping)
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DecryptionFailureReason;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn plaintext(value: &str) -> Plaintext {
        Plaintext::new(value.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_store_and_lookup() {
        let cache = DecryptionCache::new(16);
        assert!(cache.lookup("sha256:aa", "k1").await.is_none());

        cache.store("sha256:aa", "k1", plaintext("s3cr3t")).await;

        let hit = cache.lookup("sha256:aa", "k1").await;
        assert_eq!(hit.as_ref().map(Plaintext::as_bytes), Some(&b"s3cr3t"[..]));
        // Same content under another key is a different entry
        assert!(cache.lookup("sha256:aa", "k2").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache = DecryptionCache::new(16);
        cache.store("sha256:aa", "k1", plaintext("one")).await;
        cache.store("sha256:bb", "k1", plaintext("two")).await;

        cache.invalidate("sha256:aa", "k1").await;

        assert!(cache.lookup("sha256:aa", "k1").await.is_none());
        assert!(cache.lookup("sha256:bb", "k1").await.is_some());
    }

    #[tokio::test]
    async fn test_get_or_decrypt_loads_once() {
        let cache = DecryptionCache::new(16);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_decrypt("sha256:aa", "k1", async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(plaintext("s3cr3t"))
                })
                .await
                .unwrap();
            assert_eq!(value.as_bytes(), b"s3cr3t");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_are_coalesced() {
        let cache = DecryptionCache::new(16);
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let load = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(plaintext("s3cr3t"))
        };

        let (first, second) = tokio::join!(
            cache.get_or_decrypt("sha256:aa", "k1", load()),
            cache.get_or_decrypt("sha256:aa", "k1", load()),
        );

        assert_eq!(first.unwrap().as_bytes(), b"s3cr3t");
        assert_eq!(second.unwrap().as_bytes(), b"s3cr3t");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cache = DecryptionCache::new(16);

        let err = cache
            .get_or_decrypt("sha256:aa", "k1", async {
                Err(DecryptionError::new(
                    DecryptionFailureReason::Throttled,
                    "k1",
                    "us-east-1",
                ))
            })
            .await
            .unwrap_err();
        assert_eq!(err.reason, DecryptionFailureReason::Throttled);

        let value = cache
            .get_or_decrypt("sha256:aa", "k1", async { Ok(plaintext("later")) })
            .await
            .unwrap();
        assert_eq!(value.as_bytes(), b"later");
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let cache = DecryptionCache::new(4);
        for i in 0..32 {
            cache
                .store(&format!("sha256:{i:02x}"), "k1", plaintext("v"))
                .await;
        }
        cache.run_pending_tasks().await;
        assert!(cache.entry_count() <= 4);
    }
}
