use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::users::dto::UserView;

/// Cache key of a user's read model.
pub fn user_key(id: Uuid) -> String {
    format!("user:{id}")
}

/// String key/value cache with per-entry TTL.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("parse redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.context("redis GET")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        // SET EX rejects zero
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, secs)
            .await
            .context("redis SET EX")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.context("redis DEL")?;
        Ok(())
    }
}

/// Best-effort read-model cache for user views. Every call is bounded by a timeout;
/// failures and timeouts are logged and behave like a miss.
#[derive(Clone)]
pub struct UserCache {
    cache: Arc<dyn Cache>,
    ttl: Duration,
    op_timeout: Duration,
}

impl UserCache {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration, op_timeout: Duration) -> Self {
        Self {
            cache,
            ttl,
            op_timeout,
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<UserView> {
        let key = user_key(id);
        let raw = self.bounded("get", &key, self.cache.get(&key)).await??;
        match serde_json::from_str(&raw) {
            Ok(view) => {
                debug!(key = %key, "cache hit");
                Some(view)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "undecodable cache entry ignored");
                None
            }
        }
    }

    pub async fn put(&self, view: &UserView) {
        let key = user_key(view.id);
        let raw = match serde_json::to_string(view) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "user view not cacheable");
                return;
            }
        };
        self.bounded("set", &key, self.cache.set(&key, &raw, self.ttl))
            .await;
    }

    pub async fn invalidate(&self, id: Uuid) {
        let key = user_key(id);
        self.bounded("delete", &key, self.cache.delete(&key)).await;
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        key: &str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(v)) => Some(v),
            Ok(Err(e)) => {
                warn!(op, key, error = %format!("{e:#}"), "cache operation failed");
                None
            }
            Err(_) => {
                warn!(op, key, timeout_ms = self.op_timeout.as_millis() as u64, "cache operation timed out");
                None
            }
        }
    }
}

/// Process-local cache for single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    failing: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail, as a lost cache connection would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stores a raw value, bypassing serialization; used to plant corrupt entries.
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Duration) {
        self.lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "cache unavailable");
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.check()?;
        let mut entries = self.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.check()?;
        self.insert_raw(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.check()?;
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_key_format() {
        let id = Uuid::nil();
        assert_eq!(user_key(id), "user:00000000-0000-0000-0000-000000000000");
    }

    #[tokio::test]
    async fn memory_cache_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.contains("k"));
    }

    fn view() -> UserView {
        UserView::from(crate::users::model::User::provisioned(
            Uuid::new_v4(),
            "a@b.com".into(),
            "A".into(),
            "B".into(),
        ))
    }

    #[tokio::test]
    async fn user_cache_roundtrip_and_invalidate() {
        let raw = Arc::new(MemoryCache::new());
        let cache = UserCache::new(raw.clone(), Duration::from_secs(60), Duration::from_millis(100));
        let v = view();
        assert!(cache.get(v.id).await.is_none());

        cache.put(&v).await;
        assert!(raw.contains(&user_key(v.id)));
        let hit = cache.get(v.id).await.unwrap();
        assert_eq!(hit.id, v.id);
        assert_eq!(hit.email, v.email);

        cache.invalidate(v.id).await;
        assert!(cache.get(v.id).await.is_none());
    }

    #[tokio::test]
    async fn user_cache_degrades_to_miss() {
        let raw = Arc::new(MemoryCache::new());
        let cache = UserCache::new(raw.clone(), Duration::from_secs(60), Duration::from_millis(100));
        let v = view();

        raw.insert_raw(&user_key(v.id), "{not json", Duration::from_secs(60));
        assert!(cache.get(v.id).await.is_none());

        raw.set_failing(true);
        cache.put(&v).await;
        cache.invalidate(v.id).await;
        assert!(cache.get(v.id).await.is_none());
    }

    #[tokio::test]
    async fn failing_cache_errors() {
        let cache = MemoryCache::new();
        cache.set_failing(true);
        assert!(cache.get("k").await.is_err());
        assert!(cache.delete("k").await.is_err());
    }
}
