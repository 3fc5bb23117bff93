use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::{CacheError, UsageCacheEntry, UsageStore};

const KEY_PREFIX: &str = "labfleet:usage:";

fn key(project_id: &str) -> String {
    format!("{KEY_PREFIX}{project_id}")
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Usage store backed by Redis `SETEX` keys.
#[derive(Clone)]
pub struct RedisUsageStore {
    conn: ConnectionManager,
}

impl RedisUsageStore {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis usage cache");
        Ok(Self { conn })
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    async fn get(&self, project_id: &str) -> Result<Option<UsageCacheEntry>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key(project_id)).await?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| CacheError::Corrupt {
                project_id: project_id.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn put(&self, entry: &UsageCacheEntry, ttl: Duration) -> Result<(), CacheError> {
        let json = serde_json::to_string(entry).map_err(|e| CacheError::Corrupt {
            project_id: entry.project_id.clone(),
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key(&entry.project_id))
            .arg(ttl.as_secs().max(1))
            .arg(json)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, project_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key(project_id)).await?;
        Ok(())
    }

    async fn projects(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{KEY_PREFIX}*")).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect())
    }
}
