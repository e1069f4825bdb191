use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;

/// Key-value cache with per-entry expiry. Backs tokens, sessions and
/// rate-limit counters.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    /// Increments an integer value without touching its expiry.
    async fn incr(&self, key: &str) -> anyhow::Result<i64>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("redis connect")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("redis GET")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("redis SET")?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(1)
            .query_async(&mut conn)
            .await
            .context("redis INCRBY")?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("redis DEL")?;
        Ok(())
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local cache used by tests and as a development fallback.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory cache lock poisoned"))
    }

    /// Remaining lifetime of a live key.
    #[cfg(test)]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.lock().ok()?;
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|at| at - now)
    }

    /// Stored entries, expired ones included.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or_default()
    }

    #[cfg(test)]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if !e.is_live(now) {
                    e.value = "0".into();
                    e.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: "0".into(),
                expires_at: None,
            });
        let next = entry
            .value
            .parse::<i64>()
            .context("value is not an integer")?
            + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
