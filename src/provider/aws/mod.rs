//! # AWS KMS Client
//!
//! [`DecryptionGateway`] backed by the AWS KMS `Decrypt` API.
//!
//! One SDK client is created per region on first use and reused afterwards.
//! Credentials come from the default provider chain, which covers IRSA
//! (the pod's service account annotation `eks.amazonaws.com/role-arn`),
//! instance profiles and static environment credentials.

use crate::observability::metrics;
use crate::provider::{
    classify_kms_error_code, DecryptionError, DecryptionFailureReason, DecryptionGateway,
    Plaintext,
};
use async_trait::async_trait;
use aws_sdk_kms::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};

/// Upper bound for one Decrypt call including retries inside the SDK
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// AWS KMS decryption gateway
pub struct AwsKmsGateway {
    clients: RwLock<HashMap<String, KmsClient>>,
}

impl std::fmt::Debug for AwsKmsGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsKmsGateway").finish_non_exhaustive()
    }
}

impl Default for AwsKmsGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl AwsKmsGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Client for `region`, created on first use
    async fn client(&self, region: &str) -> KmsClient {
        if let Some(client) = self.clients.read().await.get(region) {
            return client.clone();
        }

        info!(region = region, "Creating AWS KMS client");
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .timeout_config(
                aws_config::timeout::TimeoutConfig::builder()
                    .operation_timeout(OPERATION_TIMEOUT)
                    .build(),
            )
            .load()
            .await;
        let client = KmsClient::new(&sdk_config);

        // Another task may have raced us here; keep whichever landed first
        self.clients
            .write()
            .await
            .entry(region.to_string())
            .or_insert(client)
            .clone()
    }
}

/// Classify an SDK error into a failure reason
fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> (DecryptionFailureReason, Option<String>)
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            (DecryptionFailureReason::Transient, None)
        }
        SdkError::ServiceError(service) => {
            let code = service.err().code();
            (classify_kms_error_code(code), code.map(str::to_string))
        }
        _ => (DecryptionFailureReason::Transient, None),
    }
}

#[async_trait]
impl DecryptionGateway for AwsKmsGateway {
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        region: &str,
    ) -> Result<Plaintext, DecryptionError> {
        let span = info_span!("aws.kms.decrypt", key.id = key_id, region = region);
        let start = Instant::now();

        async move {
            let client = self.client(region).await;
            metrics::increment_decrypt_requests();

            let result = client
                .decrypt()
                .ciphertext_blob(Blob::new(ciphertext.to_vec()))
                .key_id(key_id)
                .send()
                .await;
            metrics::observe_decrypt_duration(start.elapsed().as_secs_f64());

            let output = match result {
                Ok(output) => output,
                Err(e) => {
                    let (reason, code) = classify_sdk_error(&e);
                    warn!(
                        error.class = reason.as_str(),
                        error.code = code.as_deref().unwrap_or("none"),
                        "KMS decrypt failed"
                    );
                    metrics::increment_decrypt_errors(reason.as_str());
                    return Err(DecryptionError::new(reason, key_id, region)
                        .with_code(code.as_deref()));
                }
            };

            match output.plaintext() {
                Some(blob) if !blob.as_ref().is_empty() => {
                    debug!(
                        duration_ms = start.elapsed().as_millis() as u64,
                        "KMS decrypt succeeded"
                    );
                    Ok(Plaintext::new(blob.as_ref().to_vec()))
                }
                _ => {
                    let reason = DecryptionFailureReason::EmptyPlaintext;
                    metrics::increment_decrypt_errors(reason.as_str());
                    Err(DecryptionError::new(reason, key_id, region))
                }
            }
        }
        .instrument(span)
        .await
    }
}
