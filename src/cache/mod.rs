//! Fail-open cache for unwrapped keys and KAS public keys.
//!
//! Every backend call is bounded by a short timeout. Errors and timeouts
//! are logged and reported as a miss (reads) or a no-op (writes); they
//! never fail the request that triggered them.

mod backend;
mod error;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub use backend::{glob_match, CacheBackend, MemoryBackend, RedisBackend};
pub use error::CacheError;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(100);

/// What a cached value is, which decides its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlCategory {
    UnwrappedKey,
    PublicKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub unwrapped_key: Duration,
    pub public_key: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            unwrapped_key: Duration::from_secs(60),
            public_key: Duration::from_secs(3600),
        }
    }
}

/// Structured cache key. Unwrap entries are namespaced by kid so a key
/// rotation can drop them with `kas:unwrap:{kid}:*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    Unwrap { kid: String, wrapped_digest: String },
    PublicKey { kid: String },
}

impl CacheKey {
    pub fn unwrap(wrapped_key: &[u8], kid: &str) -> Self {
        CacheKey::Unwrap {
            kid: kid.to_string(),
            wrapped_digest: hex::encode(Sha256::digest(wrapped_key)),
        }
    }

    pub fn public_key(kid: &str) -> Self {
        CacheKey::PublicKey {
            kid: kid.to_string(),
        }
    }

    pub fn render(&self) -> String {
        match self {
            CacheKey::Unwrap {
                kid,
                wrapped_digest,
            } => format!("kas:unwrap:{}:{}", kid, wrapped_digest),
            CacheKey::PublicKey { kid } => format!("kas:pubkey:{}", kid),
        }
    }

    /// Pattern matching every unwrap entry for `kid`.
    pub fn unwrap_pattern(kid: &str) -> String {
        format!("kas:unwrap:{}:*", kid)
    }
}

pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
    ttls: CacheTtls,
    timeout: Duration,
}

impl CacheManager {
    pub fn new(backend: Arc<dyn CacheBackend>, ttls: CacheTtls) -> Self {
        Self {
            backend,
            ttls,
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ttl_for(&self, category: TtlCategory) -> Duration {
        match category {
            TtlCategory::UnwrappedKey => self.ttls.unwrapped_key,
            TtlCategory::PublicKey => self.ttls.public_key,
        }
    }

    /// Cached bytes, or `None` on a miss or any backend failure.
    pub async fn get(&self, key: &CacheKey) -> Option<Zeroizing<Vec<u8>>> {
        let rendered = key.render();
        let value = self
            .bounded("get", &rendered, self.backend.get(&rendered))
            .await
            .flatten();
        debug!(
            "Cache {} for {}",
            if value.is_some() { "hit" } else { "miss" },
            rendered
        );
        value.map(Zeroizing::new)
    }

    pub async fn set(&self, key: &CacheKey, value: &[u8], category: TtlCategory) {
        let rendered = key.render();
        let ttl = self.ttl_for(category);
        self.bounded("set", &rendered, self.backend.set(&rendered, value, ttl))
            .await;
    }

    /// Remove entries matching a glob pattern. Returns how many were
    /// removed, zero if the backend is unavailable.
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        self.bounded("invalidate", pattern, self.backend.delete_matching(pattern))
            .await
            .unwrap_or(0)
    }

    /// Increment a windowed counter. `None` means the backend could not
    /// answer and the caller should not count on the result.
    pub async fn incr_counter(&self, key: &str, window: Duration) -> Option<u64> {
        self.bounded("incr", key, self.backend.incr(key, window)).await
    }

    async fn bounded<T>(
        &self,
        op: &str,
        key: &str,
        call: impl Future<Output = Result<T, CacheError>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Cache {} failed for {}, continuing without cache: {}", op, key, e);
                None
            }
            Err(_) => {
                warn!(
                    "Cache {} timed out after {:?} for {}, continuing without cache",
                    op, self.timeout, key
                );
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that fails or stalls on every call.
    pub struct BrokenBackend {
        pub stall: bool,
        pub calls: AtomicUsize,
    }

    impl BrokenBackend {
        pub fn failing() -> Self {
            Self {
                stall: false,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn stalling() -> Self {
            Self {
                stall: true,
                calls: AtomicUsize::new(0),
            }
        }

        async fn fail<T>(&self) -> Result<T, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.fail().await
        }

        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
            self.fail().await
        }

        async fn delete_matching(&self, _pattern: &str) -> Result<u64, CacheError> {
            self.fail().await
        }

        async fn incr(&self, _key: &str, _window: Duration) -> Result<u64, CacheError> {
            self.fail().await
        }
    }
}
