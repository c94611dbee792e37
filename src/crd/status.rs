//! # KMSSecret Status
//!
//! Status types for tracking reconciliation state and conditions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of the KMSSecret resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KMSSecretStatus {
    /// Last spec generation that converged
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Per-field record of the ciphertext last written to the Secret
    #[serde(default)]
    pub fields: BTreeMap<String, FieldStatus>,
    /// Name of the Secret last written
    /// Used to clean up a Secret orphaned by a template rename
    #[serde(default)]
    pub secret_name: Option<String>,
    /// Ready and Synced conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Last time the Ready condition changed status (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

/// Per-field status entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldStatus {
    /// `sha256:<hex>` of the ciphertext whose plaintext is in the Secret
    pub last_ciphertext_fingerprint: String,
    pub key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl KMSSecretStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == type_)
    }

    /// Whether the Ready condition is `True`
    pub fn is_ready(&self) -> bool {
        self.condition("Ready").is_some_and(|c| c.status == "True")
    }
}
