use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheError, UsageCacheEntry, UsageStore};

type Entries = HashMap<String, (UsageCacheEntry, Instant)>;

/// Process-local usage store. Expired entries are dropped on every write and
/// on the read that finds them.
#[derive(Default)]
pub struct MemoryUsageStore {
    entries: RwLock<Entries>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(entries: &mut Entries, now: Instant) {
        entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn get(&self, project_id: &str) -> Result<Option<UsageCacheEntry>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(project_id) {
                None => return Ok(None),
                Some((entry, expires_at)) if *expires_at > now => return Ok(Some(entry.clone())),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        // Re-check: a put may have landed between the two locks.
        if let Some((entry, expires_at)) = entries.get(project_id) {
            if *expires_at > now {
                return Ok(Some(entry.clone()));
            }
            entries.remove(project_id);
        }
        Ok(None)
    }

    async fn put(&self, entry: &UsageCacheEntry, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Self::prune(&mut entries, now);
        entries.insert(entry.project_id.clone(), (entry.clone(), now + ttl));
        Ok(())
    }

    async fn remove(&self, project_id: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(project_id);
        Ok(())
    }

    async fn projects(&self) -> Result<Vec<String>, CacheError> {
        let mut entries = self.entries.write().await;
        Self::prune(&mut entries, Instant::now());
        Ok(entries.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::ResourceUsage;
    use chrono::Utc;

    fn entry(project_id: &str) -> UsageCacheEntry {
        UsageCacheEntry {
            project_id: project_id.to_string(),
            usage: ResourceUsage::default(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn expired_entry_is_removed_on_read() {
        let store = MemoryUsageStore::new();
        store.put(&entry("proj-a"), Duration::ZERO).await.unwrap();

        assert!(store.get("proj-a").await.unwrap().is_none());
        assert!(store.entries.read().await.is_empty());
    }

    #[tokio::test]
    async fn writes_prune_other_expired_entries() {
        let store = MemoryUsageStore::new();
        store.put(&entry("proj-a"), Duration::ZERO).await.unwrap();
        store.put(&entry("proj-b"), Duration::from_secs(60)).await.unwrap();

        let entries = store.entries.read().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("proj-b"));
    }
}
