use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::{CacheEntryRepository, DbError};
use crate::governor::CacheEntry;

/// Concurrent index of cache entry fetch times, keyed by (resource class, resource key).
///
/// Reads never lock across keys. Writes are last-writer-wins per key and go to
/// the repository first when one is configured, so the index never claims a
/// fetch the database does not know about. Writers to the same key are
/// serialized so the index and the repository end on the same entry.
pub struct CacheIndex {
    entries: DashMap<(String, String), CacheEntry>,
    write_locks: DashMap<(String, String), Arc<Mutex<()>>>,
    repo: Option<Arc<dyn CacheEntryRepository>>,
}

impl CacheIndex {
    pub fn new(repo: Option<Arc<dyn CacheEntryRepository>>) -> Self {
        Self {
            entries: DashMap::new(),
            write_locks: DashMap::new(),
            repo,
        }
    }

    /// In-memory only index
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Load persisted entries into the index
    pub async fn warm(&self) -> Result<usize, DbError> {
        let Some(repo) = &self.repo else {
            return Ok(0);
        };

        let entries = repo.get_all().await?;
        let count = entries.len();
        for entry in entries {
            self.entries
                .insert((entry.resource_class.clone(), entry.resource_key.clone()), entry);
        }

        tracing::info!(count, "Cache index warmed from database");
        Ok(count)
    }

    pub fn get(&self, resource_class: &str, resource_key: &str) -> Option<CacheEntry> {
        self.entries
            .get(&(resource_class.to_string(), resource_key.to_string()))
            .map(|e| e.value().clone())
    }

    /// Record a successful upstream fetch
    pub async fn record(&self, entry: CacheEntry) -> Result<(), DbError> {
        let key = (entry.resource_class.clone(), entry.resource_key.clone());
        let lock = Arc::clone(self.write_locks.entry(key.clone()).or_default().value());
        let _guard = lock.lock().await;

        if let Some(repo) = &self.repo {
            repo.upsert(&entry).await?;
        }

        tracing::debug!(
            resource_class = %entry.resource_class,
            resource_key = %entry.resource_key,
            fetched_at = %entry.fetched_at,
            "Cache entry recorded"
        );
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
