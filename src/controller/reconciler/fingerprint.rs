//! # Fingerprints
//!
//! SHA-256 fingerprints of ciphertexts and digests of stored plaintexts, and
//! the checksum annotation that ties the two together on a generated Secret.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// `sha256:<hex>` of a ciphertext blob
pub fn ciphertext_fingerprint(ciphertext: &[u8]) -> String {
    sha256_tag(ciphertext)
}

/// `sha256:<hex>` of a plaintext value as stored in the Secret
pub fn plaintext_digest(plaintext: &[u8]) -> String {
    sha256_tag(plaintext)
}

fn sha256_tag(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

/// Checksum annotation entry for one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChecksum {
    /// Fingerprint of the ciphertext the stored value was decrypted from
    pub fingerprint: String,
    /// Digest of the stored value
    pub digest: String,
}

/// Serialize the checksum annotation value (sorted by field name)
pub fn encode_checksums(checksums: &BTreeMap<String, FieldChecksum>) -> String {
    let map: serde_json::Map<String, serde_json::Value> = checksums
        .iter()
        .map(|(field, checksum)| {
            (
                field.clone(),
                serde_json::json!({
                    "fingerprint": checksum.fingerprint,
                    "digest": checksum.digest,
                }),
            )
        })
        .collect();
    serde_json::Value::Object(map).to_string()
}

/// Parse a checksum annotation value; malformed values are treated as absent
pub fn decode_checksums(value: &str) -> Option<BTreeMap<String, FieldChecksum>> {
    serde_json::from_str(value).ok()
}

/// Feeds length-prefixed sections into one SHA-256
///
/// Used for the content hash of a Secret's managed surface. Length prefixes
/// keep `("ab", "c")` and `("a", "bc")` apart.
#[derive(Default)]
pub(crate) struct ContentHasher {
    hasher: Sha256,
}

impl ContentHasher {
    pub(crate) fn section(&mut self, tag: &str) {
        self.bytes(tag.as_bytes());
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
    }

    pub(crate) fn string_map<'a>(&mut self, entries: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (key, value) in entries {
            self.bytes(key.as_bytes());
            self.bytes(value.as_bytes());
        }
    }

    pub(crate) fn finish(self) -> String {
        format!("sha256:{:x}", self.hasher.finalize())
    }
}
