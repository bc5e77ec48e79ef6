//! Never-fail JSON cache facade.
//!
//! The cache is an optimization, not a correctness dependency: a read error
//! is a miss, a write error is a no-op, and neither is ever propagated. All
//! keys carry a version prefix so a change to any cached shape invalidates
//! itself without manual flushes.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Namespace + schema version for every cache key.
pub const KEY_PREFIX: &str = "booksearch:v1";

/// Build a namespaced cache key from a kind tag and a discriminator.
pub fn cache_key(kind: &str, suffix: &str) -> String {
    format!("{KEY_PREFIX}:{kind}:{suffix}")
}

/// String-keyed cache with TTL semantics. Implementations must swallow all
/// connectivity errors.
#[async_trait]
pub trait JsonCache: Send + Sync {
    /// Fetch the raw serialized value, or `None` on miss or any failure.
    async fn get_raw(&self, key: &str) -> Option<String>;

    /// Store a serialized value with a TTL. Failures are silently dropped.
    async fn set_raw(&self, key: &str, value: String, ttl: Duration);
}

/// Typed read through the facade. Deserialization failures count as misses;
/// a stale shape behind a versioned key should never take the request down.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn JsonCache, key: &str) -> Option<T> {
    let raw = cache.get_raw(key).await?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(key, error = %e, "discarding undecodable cache entry");
            None
        }
    }
}

/// Typed write through the facade.
pub async fn set_json<T: Serialize>(cache: &dyn JsonCache, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_string(value) {
        Ok(raw) => cache.set_raw(key, raw, ttl).await,
        Err(e) => debug!(key, error = %e, "failed to serialize cache value"),
    }
}

/// Redis-backed cache over a shared connection manager.
///
/// `ConnectionManager` reconnects on its own; each operation clones the
/// handle, which is cheap.
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis. This is the only place a cache error surfaces,
    /// so a misconfigured URL fails loudly at startup rather than silently
    /// disabling caching.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl JsonCache for RedisCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        let mut conn = self.manager.clone();
        match redis::AsyncCommands::get::<_, Option<String>>(&mut conn, key).await {
            Ok(v) => v,
            Err(e) => {
                debug!(key, error = %e, "redis get failed, treating as miss");
                None
            }
        }
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) {
        let mut conn = self.manager.clone();
        let res: redis::RedisResult<()> =
            redis::AsyncCommands::set_ex(&mut conn, key, value, ttl.as_secs()).await;
        if let Err(e) = res {
            debug!(key, error = %e, "redis set failed, dropping write");
        }
    }
}

/// Cache that stores nothing. Used when no `REDIS_URL` is configured.
pub struct NoopCache;

#[async_trait]
impl JsonCache for NoopCache {
    async fn get_raw(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set_raw(&self, _key: &str, _value: String, _ttl: Duration) {}
}

/// In-process cache with TTL expiry. Intended for tests and local
/// development; it also doubles as an outage simulator via [`set_failing`].
///
/// [`set_failing`]: MemoryCache::set_failing
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
    failing: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a cache-store outage: reads miss, writes vanish.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JsonCache for MemoryCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((_, Some(expiry))) if *expiry <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) {
        if self.failing.load(Ordering::SeqCst) {
            return;
        }
        let expiry = Instant::now().checked_add(ttl);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), (value, expiry));
        }
    }
}
