//! Key custody. The rewrap path only ever sees the [`HsmProvider`] trait;
//! which backend sits behind it is decided once at startup.

mod cached;
mod cloud_kms;
mod error;
mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use zeroize::Zeroizing;

pub use cached::CachedHsm;
pub use cloud_kms::AwsKmsProvider;
pub use error::HsmError;
pub use mock::MockHsmProvider;

use crate::cache::CacheManager;
use crate::config::{HsmBackend, Settings};

/// Plaintext key bytes, zeroized on drop.
pub type KeyMaterial = Zeroizing<Vec<u8>>;

#[async_trait]
pub trait HsmProvider: Send + Sync {
    async fn unwrap(&self, wrapped_key: &[u8], key_id: &str) -> Result<KeyMaterial, HsmError>;

    async fn wrap(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, HsmError>;

    /// SPKI PEM of the public half of `key_id`.
    async fn get_public_key(&self, key_id: &str) -> Result<String, HsmError>;
}

/// Build the configured provider behind the cache decorator.
pub async fn build_provider(
    settings: &Settings,
    cache: Arc<CacheManager>,
) -> Result<Arc<dyn HsmProvider>, HsmError> {
    let backend: Arc<dyn HsmProvider> = match &settings.hsm_backend {
        HsmBackend::Mock { master_key } => {
            info!("Using mock HSM provider");
            match master_key {
                Some(hex_key) => {
                    let bytes = hex::decode(hex_key)
                        .map_err(|e| HsmError::Configuration(format!("MOCK_HSM_MASTER_KEY: {}", e)))?;
                    let master: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                        HsmError::Configuration("MOCK_HSM_MASTER_KEY must be 32 bytes".to_string())
                    })?;
                    Arc::new(MockHsmProvider::new(master))
                }
                None => Arc::new(MockHsmProvider::random()),
            }
        }
        HsmBackend::AwsKms { region } => {
            info!("Using AWS KMS HSM provider");
            Arc::new(AwsKmsProvider::from_env(region.as_deref()).await)
        }
    };
    Ok(Arc::new(CachedHsm::new(backend, cache)))
}
