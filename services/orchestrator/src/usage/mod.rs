//! Time-bounded cache of provider-reported resource usage.
//!
//! Cache-aside: reads never reach the provider, and a miss means the usage is
//! unknown, not zero. An entry older than the TTL is treated as absent even
//! if the backend still holds it. Backend failures are logged and surface as
//! misses.

mod memory;
mod redis_store;

pub use memory::MemoryUsageStore;
pub use redis_store::RedisUsageStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default entry lifetime.
pub const DEFAULT_USAGE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub used_instances: u32,
    pub used_cores: u32,
    pub used_memory_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCacheEntry {
    pub project_id: String,
    #[serde(flatten)]
    pub usage: ResourceUsage,
    pub fetched_at: DateTime<Utc>,
}

impl UsageCacheEntry {
    /// Time left before the entry expires, or `None` if it already has.
    fn remaining(&self, ttl: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let age = now.signed_duration_since(self.fetched_at);
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        (ttl - age).to_std().ok().filter(|d| !d.is_zero())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt cache entry for {project_id}: {reason}")]
    Corrupt { project_id: String, reason: String },
}

/// Storage behind the usage cache.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get(&self, project_id: &str) -> Result<Option<UsageCacheEntry>, CacheError>;

    /// Writes the entry, replacing any previous one, expiring after `ttl`.
    async fn put(&self, entry: &UsageCacheEntry, ttl: Duration) -> Result<(), CacheError>;

    async fn remove(&self, project_id: &str) -> Result<(), CacheError>;

    /// Project ids that currently have an entry.
    async fn projects(&self) -> Result<Vec<String>, CacheError>;
}

/// The usage cache used by the orchestrator.
#[derive(Clone)]
pub struct UsageCache {
    backend: Arc<dyn UsageStore>,
    ttl: Duration,
}

impl UsageCache {
    pub fn new(backend: Arc<dyn UsageStore>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// In-process cache with the default TTL.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryUsageStore::new()), DEFAULT_USAGE_TTL)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, project_id: &str) -> Option<UsageCacheEntry> {
        let entry = match self.backend.get(project_id).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(project_id, error = %e, "usage cache read failed; treating as miss");
                return None;
            }
        };
        entry.remaining(self.ttl, Utc::now()).map(|_| entry)
    }

    /// Records freshly fetched usage. Last writer wins.
    pub async fn set(&self, project_id: &str, usage: ResourceUsage) -> UsageCacheEntry {
        let entry = UsageCacheEntry {
            project_id: project_id.to_string(),
            usage,
            fetched_at: Utc::now(),
        };
        self.put(&entry).await;
        entry
    }

    /// Stores an entry with its own `fetched_at`; it expires that much
    /// sooner. Entries already past the TTL are dropped.
    pub async fn put(&self, entry: &UsageCacheEntry) {
        let Some(remaining) = entry.remaining(self.ttl, Utc::now()) else {
            return;
        };
        if let Err(e) = self.backend.put(entry, remaining).await {
            warn!(project_id = %entry.project_id, error = %e, "usage cache write failed");
        }
    }

    pub async fn invalidate(&self, project_id: &str) {
        if let Err(e) = self.backend.remove(project_id).await {
            warn!(project_id, error = %e, "usage cache invalidation failed");
        }
    }

    /// Projects with a live entry.
    pub async fn cached_projects(&self) -> Vec<String> {
        match self.backend.projects().await {
            Ok(mut projects) => {
                projects.sort();
                projects
            }
            Err(e) => {
                warn!(error = %e, "usage cache listing failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl UsageStore for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<UsageCacheEntry>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn put(&self, _: &UsageCacheEntry, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn remove(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn projects(&self) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    fn usage(n: u32) -> ResourceUsage {
        ResourceUsage {
            used_instances: n,
            used_cores: n * 2,
            used_memory_mb: u64::from(n) * 4096,
        }
    }

    #[tokio::test]
    async fn entry_within_ttl_is_returned() {
        let cache = UsageCache::in_memory();
        cache.set("proj-1", usage(3)).await;

        let entry = cache.get("proj-1").await.unwrap();
        assert_eq!(entry.usage, usage(3));
        assert!(cache.get("proj-2").await.is_none());
    }

    #[tokio::test]
    async fn entry_older_than_ttl_is_absent() {
        let cache = UsageCache::in_memory();
        let now = Utc::now();

        cache
            .put(&UsageCacheEntry {
                project_id: "fresh".into(),
                usage: usage(1),
                fetched_at: now - chrono::Duration::minutes(4),
            })
            .await;
        cache
            .put(&UsageCacheEntry {
                project_id: "stale".into(),
                usage: usage(1),
                fetched_at: now - chrono::Duration::minutes(6),
            })
            .await;

        assert!(cache.get("fresh").await.is_some());
        assert!(cache.get("stale").await.is_none());
        assert_eq!(cache.cached_projects().await, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn last_writer_wins_and_invalidate_removes() {
        let cache = UsageCache::in_memory();
        cache.set("proj", usage(1)).await;
        cache.set("proj", usage(2)).await;
        assert_eq!(cache.get("proj").await.unwrap().usage, usage(2));

        cache.invalidate("proj").await;
        assert!(cache.get("proj").await.is_none());
    }

    #[tokio::test]
    async fn backend_failure_is_a_miss() {
        let cache = UsageCache::new(Arc::new(BrokenStore), DEFAULT_USAGE_TTL);
        cache.set("proj", usage(1)).await;
        assert!(cache.get("proj").await.is_none());
        assert!(cache.cached_projects().await.is_empty());
    }

    #[test]
    fn entry_serializes_flat() {
        let entry = UsageCacheEntry {
            project_id: "p".into(),
            usage: usage(1),
            fetched_at: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["used_cores"], 2);
        assert_eq!(json["project_id"], "p");
    }
}
