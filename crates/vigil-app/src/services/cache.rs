//! Analysis result cache keyed by `(platform, content digest)`.
//!
//! Two backends behind one trait: redis for a shared store and an in-process
//! moka cache as the fallback. The cache is strictly best-effort: a missing
//! or failing backend degrades to miss/no-op with a warning and never fails
//! the pipeline. Entries expire by TTL only; concurrent writers for the same
//! key are last-writer-wins, which is acceptable because values for one key
//! are expected to be byte-identical.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value;

const CACHE_KEY_PREFIX: &str = "analyze";
const MEMORY_CACHE_CAPACITY: u64 = 10_000;

pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Identity of one analysis result. Two uploads with identical bytes and the
/// same target platform always map to the same key; the same bytes for a
/// different platform intentionally do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    platform: String,
    digest: String,
}

impl CacheKey {
    pub fn new(platform: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            digest: digest.into(),
        }
    }

    pub fn render(&self) -> String {
        format!("{CACHE_KEY_PREFIX}:{}:{}", self.platform, self.digest)
    }
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Best-effort lookup. Backend failures degrade to a miss.
    async fn get(&self, key: &CacheKey) -> Option<Value>;

    /// Best-effort store. Backend failures degrade to a no-op.
    async fn put(&self, key: &CacheKey, report: &Value, ttl: Duration);
}

/// Select the configured backend, falling back to the in-memory cache when no
/// shared store is configured or the initial connection fails.
pub async fn connect(redis_url: Option<&str>) -> Arc<dyn ResultCache> {
    match redis_url {
        Some(url) => match RedisResultCache::connect(url).await {
            Ok(cache) => {
                tracing::info!("result cache backed by shared store");
                Arc::new(cache)
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    "result cache store unreachable; using in-memory cache"
                );
                Arc::new(MemoryResultCache::new())
            }
        },
        None => {
            tracing::debug!("no result cache store configured; using in-memory cache");
            Arc::new(MemoryResultCache::new())
        }
    }
}

pub struct RedisResultCache {
    manager: ConnectionManager,
}

impl RedisResultCache {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let mut manager = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut manager).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, key: &CacheKey) -> Option<Value> {
        let rendered = key.render();
        let mut conn = self.manager.clone();
        let payload: Option<String> = match conn.get(&rendered).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(key = %rendered, %error, "cache get failed; treating as miss");
                return None;
            }
        };

        let payload = payload?;
        match serde_json::from_str(&payload) {
            Ok(value) => {
                tracing::info!(key = %rendered, "cache hit");
                Some(value)
            }
            Err(error) => {
                tracing::warn!(key = %rendered, %error, "cached payload unreadable; treating as miss");
                None
            }
        }
    }

    async fn put(&self, key: &CacheKey, report: &Value, ttl: Duration) {
        let rendered = key.render();
        let payload = match serde_json::to_string(report) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(key = %rendered, %error, "failed to serialize report for cache");
                return;
            }
        };

        let mut conn = self.manager.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("SET")
            .arg(&rendered)
            .arg(payload)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        if let Err(error) = result {
            tracing::warn!(key = %rendered, %error, "cache put failed; result not stored");
        }
    }
}

#[derive(Clone)]
struct CachedEntry {
    report: Arc<Value>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct MemoryResultCache {
    cache: Cache<String, CachedEntry>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        let cache = Cache::builder()
            .max_capacity(MEMORY_CACHE_CAPACITY)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

impl Default for MemoryResultCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &CacheKey) -> Option<Value> {
        let entry = self.cache.get(&key.render()).await?;
        Some(entry.report.as_ref().clone())
    }

    async fn put(&self, key: &CacheKey, report: &Value, ttl: Duration) {
        let entry = CachedEntry {
            report: Arc::new(report.clone()),
            ttl,
        };
        self.cache.insert(key.render(), entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_render_includes_platform_and_digest() {
        let key = CacheKey::new("TikTok", "abc123");
        assert_eq!(key.render(), "analyze:TikTok:abc123");
    }

    #[test]
    fn identical_inputs_share_a_key_across_platforms_do_not() {
        let a = CacheKey::new("TikTok", "abc123");
        let b = CacheKey::new("TikTok", "abc123");
        let c = CacheKey::new("YouTube", "abc123");
        assert_eq!(a, b);
        assert_ne!(a.render(), c.render());
    }

    #[tokio::test]
    async fn memory_cache_round_trips_reports() {
        let cache = MemoryResultCache::new();
        let key = CacheKey::new("TikTok", "deadbeef");
        let report = json!({ "platform": "TikTok", "risk_level": "Low", "issues": [] });

        assert!(cache.get(&key).await.is_none());
        cache.put(&key, &report, DEFAULT_RESULT_TTL).await;
        assert_eq!(cache.get(&key).await, Some(report));
    }

    #[tokio::test]
    async fn memory_cache_is_last_writer_wins() {
        let cache = MemoryResultCache::new();
        let key = CacheKey::new("TikTok", "deadbeef");

        cache
            .put(&key, &json!({ "risk_level": "Low" }), DEFAULT_RESULT_TTL)
            .await;
        cache
            .put(&key, &json!({ "risk_level": "High" }), DEFAULT_RESULT_TTL)
            .await;

        assert_eq!(cache.get(&key).await, Some(json!({ "risk_level": "High" })));
    }

    #[tokio::test]
    async fn memory_cache_honors_entry_ttl() {
        let cache = MemoryResultCache::new();
        let key = CacheKey::new("TikTok", "deadbeef");

        cache
            .put(&key, &json!({ "risk_level": "Low" }), Duration::from_millis(50))
            .await;
        assert!(cache.get(&key).await.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get(&key).await.is_none(), "entry must expire by TTL");
    }
}
