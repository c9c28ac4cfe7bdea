//! AWS KMS-backed provider. Keys are asymmetric RSA CMKs; unwrap and wrap
//! use `RSAES_OAEP_SHA_256` and private key material never leaves KMS.

use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::EncryptionAlgorithmSpec;
use log::{info, warn};
use zeroize::Zeroizing;

use crate::hsm::{HsmError, HsmProvider, KeyMaterial};
use crate::modules::crypto::der_to_public_key_pem;

pub struct AwsKmsProvider {
    client: aws_sdk_kms::Client,
}

impl AwsKmsProvider {
    /// Load credentials and region from the environment. `region`
    /// overrides the default chain.
    pub async fn from_env(region: Option<&str>) -> Self {
        let mut config_loader = aws_config::from_env();
        if let Some(r) = region {
            config_loader = config_loader.region(aws_config::Region::new(r.to_string()));
        }
        let sdk_config = config_loader.load().await;
        info!(
            "AWS KMS provider initialized (region: {})",
            sdk_config
                .region()
                .map(|r| r.as_ref())
                .unwrap_or("<default>")
        );
        Self {
            client: aws_sdk_kms::Client::new(&sdk_config),
        }
    }

    pub fn from_client(client: aws_sdk_kms::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HsmProvider for AwsKmsProvider {
    async fn unwrap(&self, wrapped_key: &[u8], key_id: &str) -> Result<KeyMaterial, HsmError> {
        let resp = self
            .client
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(Blob::new(wrapped_key))
            .encryption_algorithm(EncryptionAlgorithmSpec::RsaesOaepSha256)
            .send()
            .await
            .map_err(|e| {
                if e
                    .as_service_error()
                    .map(|s| s.is_not_found_exception())
                    .unwrap_or(false)
                {
                    return HsmError::UnknownKey(key_id.to_string());
                }
                warn!("KMS decrypt failed for {}: {}", key_id, e);
                HsmError::Unwrap {
                    kid: key_id.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let plaintext = resp.plaintext().ok_or_else(|| HsmError::Unwrap {
            kid: key_id.to_string(),
            reason: "KMS decrypt response missing plaintext".to_string(),
        })?;
        Ok(Zeroizing::new(plaintext.as_ref().to_vec()))
    }

    async fn wrap(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, HsmError> {
        let resp = self
            .client
            .encrypt()
            .key_id(key_id)
            .plaintext(Blob::new(plaintext))
            .encryption_algorithm(EncryptionAlgorithmSpec::RsaesOaepSha256)
            .send()
            .await
            .map_err(|e| HsmError::Wrap {
                kid: key_id.to_string(),
                reason: e.to_string(),
            })?;

        resp.ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| HsmError::Wrap {
                kid: key_id.to_string(),
                reason: "KMS encrypt response missing ciphertext".to_string(),
            })
    }

    async fn get_public_key(&self, key_id: &str) -> Result<String, HsmError> {
        let resp = self
            .client
            .get_public_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| {
                if e
                    .as_service_error()
                    .map(|s| s.is_not_found_exception())
                    .unwrap_or(false)
                {
                    return HsmError::UnknownKey(key_id.to_string());
                }
                HsmError::PublicKey {
                    kid: key_id.to_string(),
                    reason: e.to_string(),
                }
            })?;

        // KMS returns DER-encoded SubjectPublicKeyInfo.
        let der = resp.public_key().ok_or_else(|| HsmError::PublicKey {
            kid: key_id.to_string(),
            reason: "KMS response missing public key".to_string(),
        })?;
        Ok(der_to_public_key_pem(der.as_ref()))
    }
}
