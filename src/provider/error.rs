//! # Decryption Errors
//!
//! Classification of KMS decrypt failures.
//!
//! The controller only needs to know whether retrying can help: throttling,
//! service-side faults and network trouble are transient; anything about the
//! key, the ciphertext or the caller's permissions is terminal until the
//! resource (or the key) is fixed.

/// Why a decryption failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecryptionFailureReason {
    /// Request rate exceeded
    Throttled,
    /// Service-side or network fault, or a timeout
    Transient,
    /// Key material temporarily unavailable
    Unavailable,
    AccessDenied,
    InvalidCiphertext,
    /// Ciphertext was encrypted under a different key than the one given
    IncorrectKey,
    KeyNotFound,
    KeyDisabled,
    InvalidKeyState,
    /// The service returned no plaintext
    EmptyPlaintext,
    /// Unrecognised error code
    Unknown,
}

impl DecryptionFailureReason {
    /// Whether a later attempt with the same input can succeed
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Throttled | Self::Transient | Self::Unavailable | Self::Unknown
        )
    }

    /// Stable error class used in status messages, events and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Throttled => "Throttled",
            Self::Transient => "Transient",
            Self::Unavailable => "Unavailable",
            Self::AccessDenied => "AccessDenied",
            Self::InvalidCiphertext => "InvalidCiphertext",
            Self::IncorrectKey => "IncorrectKey",
            Self::KeyNotFound => "KeyNotFound",
            Self::KeyDisabled => "KeyDisabled",
            Self::InvalidKeyState => "InvalidKeyState",
            Self::EmptyPlaintext => "EmptyPlaintext",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for DecryptionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed decrypt call
///
/// Carries the key and region but never the ciphertext or any plaintext.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("decrypt with key {key_id} in {region} failed: {reason}")]
pub struct DecryptionError {
    pub reason: DecryptionFailureReason,
    pub key_id: String,
    pub region: String,
    /// Service error code, when the service returned one
    pub code: Option<String>,
}

impl DecryptionError {
    pub fn new(reason: DecryptionFailureReason, key_id: &str, region: &str) -> Self {
        Self {
            reason,
            key_id: key_id.to_string(),
            region: region.to_string(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: Option<&str>) -> Self {
        self.code = code.map(str::to_string);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.reason.is_transient()
    }
}

/// Classify a KMS error code
///
/// Codes follow the AWS KMS API error names. A missing code means the request
/// never produced a service error (connection reset, malformed response) and
/// is treated as transient.
pub fn classify_kms_error_code(code: Option<&str>) -> DecryptionFailureReason {
    let Some(code) = code else {
        return DecryptionFailureReason::Transient;
    };

    match code {
        "ThrottlingException" | "LimitExceededException" | "TooManyRequestsException" => {
            DecryptionFailureReason::Throttled
        }
        "KMSInternalException" | "DependencyTimeoutException" | "InternalFailure"
        | "ServiceUnavailable" | "RequestTimeout" | "RequestTimeoutException" => {
            DecryptionFailureReason::Transient
        }
        "KeyUnavailableException" => DecryptionFailureReason::Unavailable,
        "AccessDeniedException" | "AccessDenied" | "UnrecognizedClientException"
        | "InvalidGrantTokenException" | "ExpiredTokenException" => {
            DecryptionFailureReason::AccessDenied
        }
        "InvalidCiphertextException" | "InvalidParameterValue" | "ValidationException" => {
            DecryptionFailureReason::InvalidCiphertext
        }
        "IncorrectKeyException" => DecryptionFailureReason::IncorrectKey,
        "NotFoundException" => DecryptionFailureReason::KeyNotFound,
        "DisabledException" => DecryptionFailureReason::KeyDisabled,
        "KMSInvalidStateException" | "InvalidKeyUsageException" => {
            DecryptionFailureReason::InvalidKeyState
        }
        _ => DecryptionFailureReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_is_transient() {
        let reason = classify_kms_error_code(Some("ThrottlingException"));
        assert_eq!(reason, DecryptionFailureReason::Throttled);
        assert!(reason.is_transient());
    }

    #[test]
    fn test_missing_code_is_transient() {
        assert_eq!(
            classify_kms_error_code(None),
            DecryptionFailureReason::Transient
        );
    }

    #[test]
    fn test_key_problems_are_terminal() {
        let codes = [
            ("AccessDeniedException", DecryptionFailureReason::AccessDenied),
            ("InvalidCiphertextException", DecryptionFailureReason::InvalidCiphertext),
            ("IncorrectKeyException", DecryptionFailureReason::IncorrectKey),
            ("NotFoundException", DecryptionFailureReason::KeyNotFound),
            ("DisabledException", DecryptionFailureReason::KeyDisabled),
            ("KMSInvalidStateException", DecryptionFailureReason::InvalidKeyState),
        ];
        for (code, expected) in codes {
            let reason = classify_kms_error_code(Some(code));
            assert_eq!(reason, expected, "code {code}");
            assert!(!reason.is_transient(), "code {code} should be terminal");
        }
    }

    #[test]
    fn test_error_display_has_no_payload() {
        let err = DecryptionError::new(DecryptionFailureReason::IncorrectKey, "k1", "us-east-1")
            .with_code(Some("IncorrectKeyException"));
        assert_eq!(
            err.to_string(),
            "decrypt with key k1 in us-east-1 failed: IncorrectKey"
        );
        assert!(!err.is_transient());
    }
}
