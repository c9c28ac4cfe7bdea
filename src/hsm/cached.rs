use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::cache::{CacheKey, CacheManager, TtlCategory};
use crate::hsm::{HsmError, HsmProvider, KeyMaterial};

/// Consults the cache before the wrapped provider for unwrap and public
/// key lookups. Wrap results are never cached.
pub struct CachedHsm {
    inner: Arc<dyn HsmProvider>,
    cache: Arc<CacheManager>,
}

impl CachedHsm {
    pub fn new(inner: Arc<dyn HsmProvider>, cache: Arc<CacheManager>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl HsmProvider for CachedHsm {
    async fn unwrap(&self, wrapped_key: &[u8], key_id: &str) -> Result<KeyMaterial, HsmError> {
        let key = CacheKey::unwrap(wrapped_key, key_id);
        if let Some(cached) = self.cache.get(&key).await {
            debug!("Unwrap served from cache for key {}", key_id);
            return Ok(cached);
        }

        let dek = self.inner.unwrap(wrapped_key, key_id).await?;
        self.cache.set(&key, &dek, TtlCategory::UnwrappedKey).await;
        Ok(dek)
    }

    async fn wrap(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, HsmError> {
        self.inner.wrap(plaintext, key_id).await
    }

    async fn get_public_key(&self, key_id: &str) -> Result<String, HsmError> {
        let key = CacheKey::public_key(key_id);
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(pem) = String::from_utf8(cached.to_vec()) {
                return Ok(pem);
            }
        }

        let pem = self.inner.get_public_key(key_id).await?;
        self.cache
            .set(&key, pem.as_bytes(), TtlCategory::PublicKey)
            .await;
        Ok(pem)
    }
}
