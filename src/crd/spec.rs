//! # KMSSecret Spec
//!
//! Main CRD specification types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// KMSSecret Custom Resource Definition
///
/// Holds KMS-encrypted field values and a template for the Secret the
/// controller generates from them.
///
/// # Example
///
/// ```yaml
/// apiVersion: secret.h3poteto.dev/v1beta1
/// kind: KMSSecret
/// metadata:
///   name: example
///   namespace: default
/// spec:
///   dataEntries:
///     - fieldName: password
///       ciphertextBlob: AQICAHh...
///       keyId: alias/app
///       region: us-east-1
///   template:
///     labels:
///       app: example
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "KMSSecret",
    group = "secret.h3poteto.dev",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::KMSSecretStatus",
    shortname = "kmss",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Secret", "type":"string", "jsonPath":".status.secretName"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KMSSecretSpec {
    /// Encrypted fields, one per key of the generated Secret
    #[serde(default)]
    pub data_entries: Vec<DataEntry>,
    /// Metadata for the generated Secret
    #[serde(default)]
    pub template: Option<SecretTemplate>,
}

/// One encrypted field
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataEntry {
    /// Key in the generated Secret's data map; unique within the resource
    pub field_name: String,
    /// Base64-encoded KMS ciphertext
    pub ciphertext_blob: String,
    /// KMS key id, ARN or alias used to encrypt the field
    pub key_id: String,
    /// AWS region of the key
    pub region: String,
}

/// Metadata applied to the generated Secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplate {
    /// Secret name; defaults to the KMSSecret name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Secret type; defaults to `Opaque`
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
}

impl KMSSecretSpec {
    /// Name of the Secret this spec produces
    pub fn target_name<'a>(&'a self, resource_name: &'a str) -> &'a str {
        self.template
            .as_ref()
            .and_then(|t| t.name.as_deref())
            .filter(|name| !name.is_empty())
            .unwrap_or(resource_name)
    }

    /// Type of the Secret this spec produces
    pub fn target_type(&self) -> &str {
        self.template
            .as_ref()
            .and_then(|t| t.type_.as_deref())
            .filter(|ty| !ty.is_empty())
            .unwrap_or(crate::constants::DEFAULT_SECRET_TYPE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_wire_format() {
        let spec: KMSSecretSpec = serde_json::from_value(serde_json::json!({
            "dataEntries": [
                {"fieldName": "password", "ciphertextBlob": "YzE=", "keyId": "k1", "region": "us-east-1"}
            ],
            "template": {"type": "kubernetes.io/basic-auth", "labels": {"app": "demo"}}
        }))
        .unwrap();

        assert_eq!(spec.data_entries.len(), 1);
        assert_eq!(spec.data_entries[0].field_name, "password");
        assert_eq!(spec.target_type(), "kubernetes.io/basic-auth");
        assert_eq!(spec.target_name("example"), "example");
    }

    #[test]
    fn test_target_defaults() {
        let spec = KMSSecretSpec {
            data_entries: vec![],
            template: None,
        };
        assert_eq!(spec.target_name("example"), "example");
        assert_eq!(spec.target_type(), "Opaque");

        let spec = KMSSecretSpec {
            data_entries: vec![],
            template: Some(SecretTemplate {
                name: Some("renamed".to_string()),
                ..SecretTemplate::default()
            }),
        };
        assert_eq!(spec.target_name("example"), "renamed");
    }
}
