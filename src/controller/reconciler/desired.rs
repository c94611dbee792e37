//! # Desired Secret
//!
//! Pure computation of the Secret a `KMSSecret` should produce, plus the
//! comparison against a live Secret that drives the apply step.
//!
//! The managed surface of a generated Secret is its type, the labels and
//! annotations declared by the template, the checksum annotation and the data
//! map. Nothing else on the live object is compared or touched.

use crate::cluster::SecretPatch;
use crate::constants::CHECKSUMS_ANNOTATION;
use crate::controller::reconciler::fingerprint::{
    encode_checksums, plaintext_digest, ContentHasher, FieldChecksum,
};
use crate::crd::KMSSecretSpec;
use crate::provider::Plaintext;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

/// A field value ready to be written, with the fingerprint it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedField {
    pub plaintext: Plaintext,
    pub fingerprint: String,
}

/// The Secret a `KMSSecret` should produce
#[derive(Clone, PartialEq)]
pub struct DesiredSecret {
    pub name: String,
    pub namespace: String,
    pub type_: String,
    pub labels: BTreeMap<String, String>,
    /// Template annotations plus the checksum annotation
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, Plaintext>,
    pub owner: OwnerReference,
    /// Hash over the managed surface
    pub content_hash: String,
}

impl std::fmt::Debug for DesiredSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesiredSecret")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("type_", &self.type_)
            .field("labels", &self.labels)
            .field("data_keys", &self.data.keys().collect::<Vec<_>>())
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compute the desired Secret
///
/// Deterministic: the same spec and field values always give the same
/// result, including the content hash.
pub fn compute_desired(
    spec: &KMSSecretSpec,
    resource_name: &str,
    namespace: &str,
    owner: OwnerReference,
    fields: &BTreeMap<String, ResolvedField>,
) -> DesiredSecret {
    let template = spec.template.clone().unwrap_or_default();

    let checksums: BTreeMap<String, FieldChecksum> = fields
        .iter()
        .map(|(field, resolved)| {
            (
                field.clone(),
                FieldChecksum {
                    fingerprint: resolved.fingerprint.clone(),
                    digest: plaintext_digest(resolved.plaintext.as_bytes()),
                },
            )
        })
        .collect();

    let mut annotations = template.annotations;
    annotations.insert(
        CHECKSUMS_ANNOTATION.to_string(),
        encode_checksums(&checksums),
    );

    let data: BTreeMap<String, Plaintext> = fields
        .iter()
        .map(|(field, resolved)| (field.clone(), resolved.plaintext.clone()))
        .collect();

    let type_ = spec.target_type().to_string();
    let labels = template.labels;
    let content_hash = managed_surface_hash(
        &type_,
        labels.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        annotations.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        data.iter().map(|(k, v)| (k.as_str(), v.as_bytes())),
    );

    DesiredSecret {
        name: spec.target_name(resource_name).to_string(),
        namespace: namespace.to_string(),
        type_,
        labels,
        annotations,
        data,
        owner,
        content_hash,
    }
}

impl DesiredSecret {
    /// Full Secret object for a create call
    pub fn to_secret(&self) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.clone()),
                annotations: Some(self.annotations.clone()),
                owner_references: Some(vec![self.owner.clone()]),
                ..ObjectMeta::default()
            },
            type_: Some(self.type_.clone()),
            data: Some(
                self.data
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Secret::default()
        }
    }

    /// Hash of `live` restricted to what this desired Secret manages
    pub fn live_content_hash(&self, live: &Secret) -> String {
        let live_labels = live.metadata.labels.as_ref();
        let live_annotations = live.metadata.annotations.as_ref();
        let empty = BTreeMap::new();

        managed_surface_hash(
            secret_type(live),
            self.labels.keys().filter_map(|k| {
                live_labels
                    .and_then(|labels| labels.get(k))
                    .map(|v| (k.as_str(), v.as_str()))
            }),
            self.annotations.keys().filter_map(|k| {
                live_annotations
                    .and_then(|annotations| annotations.get(k))
                    .map(|v| (k.as_str(), v.as_str()))
            }),
            live.data
                .as_ref()
                .unwrap_or(&empty)
                .iter()
                .map(|(k, v)| (k.as_str(), v.0.as_slice())),
        )
    }

    /// Minimal merge patch turning `live` into this desired Secret
    pub fn diff(&self, live: &Secret) -> SecretPatch {
        let live_data = live.data.as_ref();
        let live_labels = live.metadata.labels.as_ref();
        let live_annotations = live.metadata.annotations.as_ref();

        let set_data = self
            .data
            .iter()
            .filter(|(k, v)| {
                live_data
                    .and_then(|data| data.get(*k))
                    .is_none_or(|current| current.0.as_slice() != v.as_bytes())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let remove_data = live_data
            .map(|data| {
                data.keys()
                    .filter(|k| !self.data.contains_key(*k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        SecretPatch {
            resource_version: live.metadata.resource_version.clone(),
            set_data,
            remove_data,
            labels: changed_entries(&self.labels, live_labels),
            annotations: changed_entries(&self.annotations, live_annotations),
        }
    }
}

/// Type of a live Secret, `Opaque` when unset
pub fn secret_type(secret: &Secret) -> &str {
    secret
        .type_
        .as_deref()
        .unwrap_or(crate::constants::DEFAULT_SECRET_TYPE)
}

/// Whether `secret` has a controller owner reference to `owner_uid`
pub fn is_controlled_by(secret: &Secret, owner_uid: &str) -> bool {
    secret
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.uid == owner_uid)
        })
}

fn changed_entries(
    desired: &BTreeMap<String, String>,
    live: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    desired
        .iter()
        .filter(|(k, v)| live.and_then(|m| m.get(*k)) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn managed_surface_hash<'a>(
    type_: &str,
    labels: impl Iterator<Item = (&'a str, &'a str)>,
    annotations: impl Iterator<Item = (&'a str, &'a str)>,
    data: impl Iterator<Item = (&'a str, &'a [u8])>,
) -> String {
    let mut hasher = ContentHasher::default();
    hasher.section("type");
    hasher.bytes(type_.as_bytes());
    hasher.section("labels");
    hasher.string_map(labels);
    hasher.section("annotations");
    hasher.string_map(annotations);
    hasher.section("data");
    for (key, value) in data {
        hasher.bytes(key.as_bytes());
        hasher.bytes(value);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::reconciler::fingerprint::{ciphertext_fingerprint, decode_checksums};
    use crate::crd::SecretTemplate;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "secret.h3poteto.dev/v1beta1".to_string(),
            kind: "KMSSecret".to_string(),
            name: "example".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn resolved(pairs: &[(&str, &str, &str)]) -> BTreeMap<String, ResolvedField> {
        pairs
            .iter()
            .map(|(field, value, ciphertext)| {
                (
                    field.to_string(),
                    ResolvedField {
                        plaintext: Plaintext::new(value.as_bytes().to_vec()),
                        fingerprint: ciphertext_fingerprint(ciphertext.as_bytes()),
                    },
                )
            })
            .collect()
    }

    fn spec_with_template(template: Option<SecretTemplate>) -> KMSSecretSpec {
        KMSSecretSpec {
            data_entries: vec![],
            template,
        }
    }

    #[test]
    fn test_compute_desired_is_deterministic() {
        let spec = spec_with_template(None);
        let fields = resolved(&[("password", "s3cr3t", "c1"), ("username", "admin", "c0")]);

        let first = compute_desired(&spec, "example", "default", owner(), &fields);
        let second = compute_desired(&spec, "example", "default", owner(), &fields);

        assert_eq!(first, second);
        assert_eq!(first.name, "example");
        assert_eq!(first.type_, "Opaque");
        let checksums = decode_checksums(&first.annotations[CHECKSUMS_ANNOTATION]).unwrap();
        assert_eq!(checksums["password"].fingerprint, ciphertext_fingerprint(b"c1"));
        assert_eq!(checksums["password"].digest, plaintext_digest(b"s3cr3t"));
    }

    #[test]
    fn test_content_hash_tracks_data() {
        let spec = spec_with_template(None);
        let a = compute_desired(&spec, "example", "default", owner(), &resolved(&[("password", "s3cr3t", "c1")]));
        let b = compute_desired(&spec, "example", "default", owner(), &resolved(&[("password", "n3wpass", "c2")]));
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_live_hash_matches_created_secret() {
        let spec = spec_with_template(Some(SecretTemplate {
            labels: BTreeMap::from([("app".to_string(), "demo".to_string())]),
            ..SecretTemplate::default()
        }));
        let desired = compute_desired(&spec, "example", "default", owner(), &resolved(&[("password", "s3cr3t", "c1")]));

        let mut live = desired.to_secret();
        // Foreign metadata is outside the managed surface
        live.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("other".to_string(), "x".to_string());
        live.metadata.resource_version = Some("7".to_string());

        assert_eq!(desired.live_content_hash(&live), desired.content_hash);
        assert!(desired.diff(&live).is_empty());
    }

    #[test]
    fn test_diff_touches_only_changed_fields() {
        let spec = spec_with_template(None);
        let before = compute_desired(
            &spec,
            "example",
            "default",
            owner(),
            &resolved(&[("password", "s3cr3t", "c1"), ("username", "admin", "c0"), ("old", "x", "c9")]),
        );
        let mut live = before.to_secret();
        live.metadata.resource_version = Some("11".to_string());

        let after = compute_desired(
            &spec,
            "example",
            "default",
            owner(),
            &resolved(&[("password", "n3wpass", "c2"), ("username", "admin", "c0")]),
        );
        assert_ne!(after.live_content_hash(&live), after.content_hash);

        let patch = after.diff(&live);
        assert_eq!(patch.resource_version.as_deref(), Some("11"));
        assert_eq!(patch.set_data.keys().collect::<Vec<_>>(), vec!["password"]);
        assert_eq!(patch.remove_data.iter().collect::<Vec<_>>(), vec!["old"]);
        assert!(patch.labels.is_empty());
        assert_eq!(
            patch.annotations.keys().collect::<Vec<_>>(),
            vec![CHECKSUMS_ANNOTATION]
        );
    }

    #[test]
    fn test_is_controlled_by() {
        let spec = spec_with_template(None);
        let desired = compute_desired(&spec, "example", "default", owner(), &BTreeMap::new());
        let secret = desired.to_secret();
        assert!(is_controlled_by(&secret, "uid-1"));
        assert!(!is_controlled_by(&secret, "uid-2"));
        assert!(!is_controlled_by(&Secret::default(), "uid-1"));
    }

    #[test]
    fn test_debug_hides_values() {
        let spec = spec_with_template(None);
        let desired = compute_desired(&spec, "example", "default", owner(), &resolved(&[("password", "s3cr3t", "c1")]));
        let printed = format!("{desired:?}");
        assert!(printed.contains("password"));
        assert!(!printed.contains("s3cr3t"));
    }
}
