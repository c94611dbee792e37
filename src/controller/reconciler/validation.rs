//! # Validation
//!
//! Validates a `KMSSecret` spec before any decryption happens and decodes the
//! ciphertext blobs. Validation failures are terminal: retrying the same
//! generation cannot fix them.

use crate::constants::SUPPORTED_SECRET_TYPES;
use crate::controller::reconciler::fingerprint::ciphertext_fingerprint;
use crate::crd::KMSSecretSpec;
use base64::Engine;
use std::collections::{BTreeMap, BTreeSet};

/// Maximum length of a Secret data key and of a Secret name
const MAX_NAME_LENGTH: usize = 253;

/// Maximum length of a label value and of the name part of a metadata key
const MAX_LABEL_LENGTH: usize = 63;

/// Data keys the API server requires for each typed Secret
///
/// For `kubernetes.io/basic-auth` one of the listed keys is enough; the
/// other types need all of theirs.
const REQUIRED_KEYS: &[(&str, &[&str])] = &[
    ("kubernetes.io/tls", &["tls.crt", "tls.key"]),
    ("kubernetes.io/ssh-auth", &["ssh-privatekey"]),
    ("kubernetes.io/dockercfg", &[".dockercfg"]),
    ("kubernetes.io/dockerconfigjson", &[".dockerconfigjson"]),
];
const BASIC_AUTH_KEYS: &[&str] = &["username", "password"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("dataEntries[{0}]: field name is empty")]
    EmptyFieldName(usize),
    #[error("field {0}: invalid field name")]
    InvalidFieldName(String),
    #[error("field {0}: duplicate field name")]
    DuplicateFieldName(String),
    #[error("field {0}: ciphertext is empty")]
    EmptyCiphertext(String),
    #[error("field {0}: ciphertext is not valid base64")]
    InvalidCiphertextEncoding(String),
    #[error("field {0}: keyId is empty")]
    EmptyKeyId(String),
    #[error("field {0}: region is empty")]
    EmptyRegion(String),
    #[error("unsupported secret type {0}")]
    UnsupportedSecretType(String),
    #[error("invalid secret name {0}")]
    InvalidSecretName(String),
    #[error("secret type {secret_type} requires field {field}")]
    MissingRequiredField { secret_type: String, field: String },
    #[error("template label {0}: invalid key or value")]
    InvalidLabel(String),
    #[error("template annotation {0}: invalid key")]
    InvalidAnnotation(String),
}

impl ValidationError {
    /// Name of the offending field, when the error is about one field
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::InvalidFieldName(f)
            | Self::DuplicateFieldName(f)
            | Self::EmptyCiphertext(f)
            | Self::InvalidCiphertextEncoding(f)
            | Self::EmptyKeyId(f)
            | Self::EmptyRegion(f) => Some(f),
            Self::MissingRequiredField { field, .. } => Some(field),
            Self::EmptyFieldName(_)
            | Self::UnsupportedSecretType(_)
            | Self::InvalidSecretName(_)
            | Self::InvalidLabel(_)
            | Self::InvalidAnnotation(_) => None,
        }
    }
}

/// A data entry that passed validation, with its ciphertext decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEntry {
    pub field_name: String,
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    pub region: String,
    /// `sha256:<hex>` of `ciphertext`
    pub fingerprint: String,
}

/// Validate the spec of the resource named `resource_name`
///
/// Entries come back in spec order.
pub fn validate_spec(
    spec: &KMSSecretSpec,
    resource_name: &str,
) -> Result<Vec<ValidatedEntry>, ValidationError> {
    let target_name = spec.target_name(resource_name);
    if !is_dns_subdomain(target_name) {
        return Err(ValidationError::InvalidSecretName(target_name.to_string()));
    }

    let secret_type = spec.target_type();
    if !SUPPORTED_SECRET_TYPES.contains(&secret_type) {
        return Err(ValidationError::UnsupportedSecretType(
            secret_type.to_string(),
        ));
    }

    if let Some(template) = &spec.template {
        validate_metadata(&template.labels, &template.annotations)?;
    }

    let engine = base64::engine::general_purpose::STANDARD;
    let mut seen = BTreeSet::new();
    let mut entries = Vec::with_capacity(spec.data_entries.len());

    for (index, entry) in spec.data_entries.iter().enumerate() {
        let field = entry.field_name.as_str();
        if field.is_empty() {
            return Err(ValidationError::EmptyFieldName(index));
        }
        if !is_secret_key(field) {
            return Err(ValidationError::InvalidFieldName(field.to_string()));
        }
        if !seen.insert(field) {
            return Err(ValidationError::DuplicateFieldName(field.to_string()));
        }

        let blob = entry.ciphertext_blob.trim();
        if blob.is_empty() {
            return Err(ValidationError::EmptyCiphertext(field.to_string()));
        }
        let ciphertext = engine
            .decode(blob)
            .map_err(|_| ValidationError::InvalidCiphertextEncoding(field.to_string()))?;
        if ciphertext.is_empty() {
            return Err(ValidationError::EmptyCiphertext(field.to_string()));
        }

        if entry.key_id.trim().is_empty() {
            return Err(ValidationError::EmptyKeyId(field.to_string()));
        }
        if entry.region.trim().is_empty() {
            return Err(ValidationError::EmptyRegion(field.to_string()));
        }

        entries.push(ValidatedEntry {
            field_name: field.to_string(),
            fingerprint: ciphertext_fingerprint(&ciphertext),
            ciphertext,
            key_id: entry.key_id.trim().to_string(),
            region: entry.region.trim().to_string(),
        });
    }

    check_required_fields(secret_type, &seen)?;
    Ok(entries)
}

fn check_required_fields(secret_type: &str, fields: &BTreeSet<&str>) -> Result<(), ValidationError> {
    let missing = |field: &str| ValidationError::MissingRequiredField {
        secret_type: secret_type.to_string(),
        field: field.to_string(),
    };

    if secret_type == "kubernetes.io/basic-auth" {
        if BASIC_AUTH_KEYS.iter().any(|key| fields.contains(key)) {
            return Ok(());
        }
        return Err(missing(&BASIC_AUTH_KEYS.join(" or ")));
    }

    let required = REQUIRED_KEYS
        .iter()
        .find(|(type_, _)| *type_ == secret_type)
        .map_or(&[][..], |(_, keys)| *keys);
    match required.iter().find(|key| !fields.contains(*key)) {
        Some(key) => Err(missing(key)),
        None => Ok(()),
    }
}

fn validate_metadata(
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Result<(), ValidationError> {
    if let Some((key, _)) = labels
        .iter()
        .find(|(key, value)| !is_qualified_name(key) || !is_label_value(value))
    {
        return Err(ValidationError::InvalidLabel(key.clone()));
    }
    if let Some(key) = annotations.keys().find(|key| !is_qualified_name(key)) {
        return Err(ValidationError::InvalidAnnotation(key.clone()));
    }
    Ok(())
}

/// Label and annotation keys: an optional DNS subdomain prefix and `/`, then
/// a name of at most 63 alphanumerics, `-`, `_` and `.`, alphanumeric at both ends
fn is_qualified_name(key: &str) -> bool {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    prefix.is_none_or(is_dns_subdomain) && !name.is_empty() && is_label_value(name)
}

/// Label values: empty, or at most 63 alphanumerics, `-`, `_` and `.`,
/// alphanumeric at both ends
fn is_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    value.len() <= MAX_LABEL_LENGTH
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && value.chars().last().is_some_and(|c| c.is_ascii_alphanumeric())
}

/// Secret data keys: `[-._a-zA-Z0-9]+`, not `.` or `..`
fn is_secret_key(key: &str) -> bool {
    key.len() <= MAX_NAME_LENGTH
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// RFC 1123 subdomain: lowercase alphanumerics, `-` and `.`, alphanumeric at both ends
fn is_dns_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    valid_chars
        && name.chars().next().is_some_and(alnum)
        && name.chars().last().is_some_and(alnum)
}
