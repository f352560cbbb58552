//! Balance cache
//!
//! Short-TTL read-through cache of computed balance snapshots. Redis is
//! used when configured and reachable; otherwise (and on any Redis call
//! failure) an in-process map with the same TTL contract serves instead.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::types::{AccountId, BalanceSnapshot};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Cache key prefixes
pub mod keys {
    /// Balance snapshot key prefix
    pub const BALANCE: &str = "balance";
}

fn balance_key(account_id: &AccountId) -> String {
    format!("{}:{}", keys::BALANCE, account_id)
}

/// Cache of balance snapshots keyed by account
#[async_trait]
pub trait BalanceCache: Send + Sync {
    /// Fresh snapshot, or `None` when absent or expired
    async fn get(&self, account_id: &AccountId) -> Option<BalanceSnapshot>;

    /// Insert with a full TTL
    async fn put(&self, snapshot: &BalanceSnapshot);

    /// Overwrite an existing fresh entry, keeping its expiry
    ///
    /// No-op when the entry is absent or expired.
    async fn replace(&self, snapshot: &BalanceSnapshot);

    /// Drop the entry
    async fn invalidate(&self, account_id: &AccountId);

    /// Drop every entry this process owns
    async fn clear(&self);

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

/// In-process cache
pub struct MemoryCache {
    entries: DashMap<AccountId, (BalanceSnapshot, Instant)>,
    ttl: Duration,
}

impl MemoryCache {
    /// Create cache with TTL
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_fresh(&self, inserted_at: Instant) -> bool {
        inserted_at.elapsed() < self.ttl
    }
}

#[async_trait]
impl BalanceCache for MemoryCache {
    async fn get(&self, account_id: &AccountId) -> Option<BalanceSnapshot> {
        let (snapshot, inserted_at) = self.entries.get(account_id).map(|e| e.value().clone())?;
        if self.is_fresh(inserted_at) {
            return Some(snapshot);
        }
        self.entries
            .remove_if(account_id, |_, (_, at)| !self.is_fresh(*at));
        None
    }

    async fn put(&self, snapshot: &BalanceSnapshot) {
        self.entries
            .insert(snapshot.account_id.clone(), (snapshot.clone(), Instant::now()));
    }

    async fn replace(&self, snapshot: &BalanceSnapshot) {
        if let Some(mut entry) = self.entries.get_mut(&snapshot.account_id) {
            let inserted_at = entry.1;
            if self.is_fresh(inserted_at) {
                *entry = (snapshot.clone(), inserted_at);
            }
        }
    }

    async fn invalidate(&self, account_id: &AccountId) {
        self.entries.remove(account_id);
    }

    async fn clear(&self) {
        self.entries.clear();
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed cache with an in-process fallback
pub struct RedisCache {
    redis: ConnectionManager,
    ttl_secs: u64,
    fallback: MemoryCache,
}

impl RedisCache {
    /// Connect within `config.connect_timeout_ms`
    pub async fn connect(url: &str, config: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let redis = tokio::time::timeout(config.connect_timeout(), ConnectionManager::new(client))
            .await
            .map_err(|_| Error::CacheUnavailable(format!("connect to {} timed out", url)))??;

        Ok(Self {
            redis,
            ttl_secs: config.shared_ttl_secs,
            fallback: MemoryCache::new(config.local_ttl()),
        })
    }

    async fn try_get(&self, account_id: &AccountId) -> Result<Option<BalanceSnapshot>> {
        let json: Option<String> = self.redis.clone().get(balance_key(account_id)).await?;
        match json {
            Some(json) => match serde_json::from_str(&json) {
                Ok(snapshot) => Ok(Some(snapshot)),
                Err(e) => {
                    warn!(account_id = %account_id, "Failed to deserialize cached balance: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn try_put(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| Error::CacheUnavailable(format!("serialization: {}", e)))?;
        let _: () = self
            .redis
            .clone()
            .set_ex(balance_key(&snapshot.account_id), json, self.ttl_secs)
            .await?;
        Ok(())
    }

    async fn try_replace(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| Error::CacheUnavailable(format!("serialization: {}", e)))?;
        // XX: only if present, KEEPTTL: leave the expiry alone
        let _: Option<String> = redis::cmd("SET")
            .arg(balance_key(&snapshot.account_id))
            .arg(json)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    async fn try_invalidate(&self, account_id: &AccountId) -> Result<()> {
        let _: () = self.redis.clone().del(balance_key(account_id)).await?;
        Ok(())
    }
}

#[async_trait]
impl BalanceCache for RedisCache {
    async fn get(&self, account_id: &AccountId) -> Option<BalanceSnapshot> {
        match self.try_get(account_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(account_id = %account_id, "Redis get failed, using local cache: {}", e);
                self.fallback.get(account_id).await
            }
        }
    }

    async fn put(&self, snapshot: &BalanceSnapshot) {
        if let Err(e) = self.try_put(snapshot).await {
            warn!(account_id = %snapshot.account_id, "Redis set failed, using local cache: {}", e);
            self.fallback.put(snapshot).await;
        }
    }

    async fn replace(&self, snapshot: &BalanceSnapshot) {
        if let Err(e) = self.try_replace(snapshot).await {
            warn!(account_id = %snapshot.account_id, "Redis replace failed, using local cache: {}", e);
        }
        self.fallback.replace(snapshot).await;
    }

    async fn invalidate(&self, account_id: &AccountId) {
        if let Err(e) = self.try_invalidate(account_id).await {
            warn!(account_id = %account_id, "Redis del failed: {}", e);
        }
        self.fallback.invalidate(account_id).await;
    }

    async fn clear(&self) {
        // Shared entries expire on their own
        self.fallback.clear().await;
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Build the configured cache, degrading to memory when Redis is unreachable
pub async fn connect_cache(config: &CacheConfig) -> Arc<dyn BalanceCache> {
    if let Some(url) = &config.redis_url {
        match RedisCache::connect(url, config).await {
            Ok(cache) => {
                info!(url = %url, ttl_secs = config.shared_ttl_secs, "Using Redis balance cache");
                return Arc::new(cache);
            }
            Err(e) => warn!("Redis unavailable, falling back to in-memory cache: {}", e),
        }
    }
    Arc::new(MemoryCache::new(config.local_ttl()))
}
