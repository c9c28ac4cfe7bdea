use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::warn;

use crate::cache::CacheManager;
use crate::rewrap::RewrapError;

const WINDOW_SECS: u64 = 60;

/// Fixed one-minute window per source address, counted in the shared
/// cache backend. When the counter cannot be read the request is let
/// through.
pub struct RateLimiter {
    cache: Arc<CacheManager>,
    per_minute: u64,
}

impl RateLimiter {
    /// `per_minute == 0` disables limiting.
    pub fn new(cache: Arc<CacheManager>, per_minute: u64) -> Self {
        Self { cache, per_minute }
    }

    pub fn is_enabled(&self) -> bool {
        self.per_minute > 0
    }

    pub async fn check(&self, source: &str) -> Result<(), RewrapError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let now = Utc::now().timestamp().max(0) as u64;
        let window = now / WINDOW_SECS;
        let key = format!("kas:ratelimit:{}:{}", source, window);

        match self
            .cache
            .incr_counter(&key, Duration::from_secs(WINDOW_SECS))
            .await
        {
            Some(count) if count > self.per_minute => {
                let retry_after = (WINDOW_SECS - now % WINDOW_SECS).max(1);
                warn!(
                    "Rate limit exceeded for {} ({} requests this window)",
                    source, count
                );
                Err(RewrapError::RateLimited { retry_after })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::BrokenBackend;
    use crate::cache::{CacheTtls, MemoryBackend};

    fn limiter(backend: Arc<dyn crate::cache::CacheBackend>, per_minute: u64) -> RateLimiter {
        RateLimiter::new(Arc::new(CacheManager::new(backend, CacheTtls::default())), per_minute)
    }

    #[tokio::test]
    async fn test_budget_is_per_source() {
        let limiter = limiter(Arc::new(MemoryBackend::default()), 2);
        assert!(limiter.check("10.0.0.1").await.is_ok());
        assert!(limiter.check("10.0.0.1").await.is_ok());

        match limiter.check("10.0.0.1").await {
            Err(RewrapError::RateLimited { retry_after }) => assert!((1..=60).contains(&retry_after)),
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert!(limiter.check("10.0.0.2").await.is_ok());
    }

    #[tokio::test]
    async fn test_counter_outage_fails_open() {
        let limiter = limiter(Arc::new(BrokenBackend::failing()), 1);
        for _ in 0..5 {
            assert!(limiter.check("10.0.0.1").await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_zero_disables() {
        let limiter = limiter(Arc::new(MemoryBackend::default()), 0);
        assert!(!limiter.is_enabled());
        for _ in 0..5 {
            assert!(limiter.check("10.0.0.1").await.is_ok());
        }
    }
}
