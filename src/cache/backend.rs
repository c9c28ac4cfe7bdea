//! Storage backends for the shared cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::cache::error::CacheError;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Delete every key matching a glob pattern (`*` and `?`). Returns the
    /// number of keys removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError>;

    /// Increment a counter that expires `window` after its first increment.
    async fn incr(&self, key: &str, window: Duration) -> Result<u64, CacheError>;
}

/// Redis-backed cache shared by all replicas.
pub struct RedisBackend {
    client: redis::Client,
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    pub fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
        })
    }

    /// Get or create the multiplexed connection.
    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        {
            let guard = self.connection.read().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis cache");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop a connection that failed so the next call reconnects.
    async fn reset(&self) {
        *self.connection.write().await = None;
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    warn!("Redis connection lost: {}", e);
                    self.reset().await;
                }
                Err(CacheError::Redis(e))
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.run(|mut conn| async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let seconds = ttl.as_secs().max(1);
        self.run(|mut conn| async move { conn.set_ex(key, value, seconds).await })
            .await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        self.run(|mut conn| async move {
            let mut cursor: u64 = 0;
            let mut removed: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await?;
                if !keys.is_empty() {
                    let deleted: u64 = conn.del(&keys).await?;
                    removed += deleted;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok::<u64, redis::RedisError>(removed)
        })
        .await
    }

    async fn incr(&self, key: &str, window: Duration) -> Result<u64, CacheError> {
        let seconds = window.as_secs().max(1);
        self.run(|mut conn| async move {
            let count: u64 = conn.incr(key, 1u64).await?;
            if count == 1 {
                let _: () = redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(seconds)
                    .query_async(&mut conn)
                    .await?;
            }
            Ok::<u64, redis::RedisError>(count)
        })
        .await
    }
}

#[derive(Clone)]
struct CachedBytes {
    bytes: Arc<Vec<u8>>,
    ttl: Duration,
}

struct PerEntryTtl;

impl moka::Expiry<String, CachedBytes> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedBytes,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedBytes,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache for single-replica deployments and tests. Entries are
/// weighted by size and evicted least-recently-used past `max_bytes`.
pub struct MemoryBackend {
    cache: moka::future::Cache<String, CachedBytes>,
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryBackend {
    pub fn new(max_bytes: u64) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, value: &CachedBytes| {
                u32::try_from(key.len() + value.bytes.len()).unwrap_or(u32::MAX)
            })
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self
            .cache
            .get(key)
            .await
            .map(|entry| entry.bytes.as_ref().clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.cache
            .insert(
                key.to_string(),
                CachedBytes {
                    bytes: Arc::new(value.to_vec()),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let matching: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key)
            .collect();
        for key in &matching {
            self.cache.invalidate(key.as_str()).await;
        }
        Ok(matching.len() as u64)
    }

    async fn incr(&self, key: &str, window: Duration) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| CacheError::Unavailable("counter table poisoned".to_string()))?;
        counters.retain(|_, (_, expires)| *expires > now);
        let entry = counters.entry(key.to_string()).or_insert((0, now + window));
        entry.0 += 1;
        Ok(entry.0)
    }
}

/// Glob match supporting `*` (any run) and `?` (any single character).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
