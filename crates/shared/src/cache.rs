//! Tagged cache
//!
//! A small key/value cache where every entry carries a set of tags and a
//! whole tag can be flushed at once. The permission engine stores its
//! boolean results here and invalidates them by user/organization tag.
//!
//! Two backends:
//! - [`MemoryCache`] for single-instance deployments and tests
//! - [`RedisCache`] which keeps tag membership in Redis sets

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;

/// Maximum in-memory entries before the oldest are evicted
const MAX_MEMORY_ENTRIES: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache backend error: {0}")]
    Backend(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Cache with tag-based invalidation
#[async_trait]
pub trait TaggedCache: Send + Sync {
    /// Fetch a live entry
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store `value` under `key` for `ttl`, registering it under every tag
    async fn put(&self, key: &str, value: &str, ttl: Duration, tags: &[String])
        -> CacheResult<()>;

    /// Drop every entry registered under any of `tags`, returning how many were removed
    async fn flush_tags(&self, tags: &[String]) -> CacheResult<u64>;

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    inserted_at: Instant,
    expires_at: Instant,
    tags: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    tags: HashMap<String, HashSet<String>>,
}

impl MemoryState {
    fn remove_entry(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        true
    }

    fn evict_oldest(&mut self, count: usize) {
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.inserted_at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        for (key, _) in by_age.into_iter().take(count) {
            self.remove_entry(&key);
        }
    }
}

/// Process-local cache backed by a `HashMap`
#[derive(Clone, Default)]
pub struct MemoryCache {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries, returning how many were dropped
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove_entry(key);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaggedCache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        {
            let state = self.state.read().await;
            match state.entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.value.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it under the write lock
        self.state.write().await.remove_entry(key);
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        tags: &[String],
    ) -> CacheResult<()> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        state.remove_entry(key);
        if state.entries.len() >= MAX_MEMORY_ENTRIES {
            // Evict 10% so we don't evict on every insert at the boundary
            state.evict_oldest(MAX_MEMORY_ENTRIES / 10);
            tracing::debug!(
                remaining = state.entries.len(),
                "Memory cache full, evicted oldest entries"
            );
        }

        for tag in tags {
            state
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                inserted_at: now,
                expires_at: now + ttl,
                tags: tags.to_vec(),
            },
        );
        Ok(())
    }

    async fn flush_tags(&self, tags: &[String]) -> CacheResult<u64> {
        let mut state = self.state.write().await;
        let keys: HashSet<String> = tags
            .iter()
            .filter_map(|tag| state.tags.get(tag))
            .flat_map(|keys| keys.iter().cloned())
            .collect();

        let mut removed = 0u64;
        for key in keys {
            if state.remove_entry(&key) {
                removed += 1;
            }
        }
        for tag in tags {
            state.tags.remove(tag);
        }
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed cache. Each tag is a Redis set holding the keys tagged with it.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCache {
    /// Connect using a `redis://` URL
    pub async fn connect(url: &str, prefix: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(prefix = %prefix, "Redis cache connected");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.prefix, tag)
    }
}

#[async_trait]
impl TaggedCache for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.entry_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        tags: &[String],
    ) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let entry_key = self.entry_key(key);
        let seconds = ttl.as_secs().max(1);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&entry_key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .ignore();
        for tag in tags {
            let tag_key = self.tag_key(tag);
            pipe.cmd("SADD").arg(&tag_key).arg(&entry_key).ignore();
            // Tag sets live as long as their newest member
            pipe.cmd("EXPIRE").arg(&tag_key).arg(seconds).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn flush_tags(&self, tags: &[String]) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        let mut removed = 0u64;

        for tag in tags {
            let tag_key = self.tag_key(tag);
            let members: Vec<String> = redis::cmd("SMEMBERS")
                .arg(&tag_key)
                .query_async(&mut conn)
                .await?;

            let mut del = redis::cmd("DEL");
            del.arg(&tag_key);
            for member in &members {
                del.arg(member);
            }
            let deleted: u64 = del.query_async(&mut conn).await?;
            // DEL also counted the tag set itself when it existed
            removed += deleted.saturating_sub(1).min(members.len() as u64);
        }

        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
