use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::governor::CacheEntry;

use super::DbError;

/// Persistence for cache entry fetch times
#[async_trait]
pub trait CacheEntryRepository: Send + Sync {
    async fn get(
        &self,
        resource_class: &str,
        resource_key: &str,
    ) -> Result<Option<CacheEntry>, DbError>;
    async fn get_all(&self) -> Result<Vec<CacheEntry>, DbError>;
    /// Last writer wins
    async fn upsert(&self, entry: &CacheEntry) -> Result<(), DbError>;
}

pub struct SqliteCacheEntryRepository {
    pool: SqlitePool,
}

impl SqliteCacheEntryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CacheEntryRow {
    resource_class: String,
    resource_key: String,
    fetched_at: i64,
}

impl TryFrom<CacheEntryRow> for CacheEntry {
    type Error = DbError;

    fn try_from(row: CacheEntryRow) -> Result<Self, Self::Error> {
        let fetched_at = DateTime::<Utc>::from_timestamp_millis(row.fetched_at)
            .ok_or_else(|| DbError::InvalidData(format!("bad fetched_at {}", row.fetched_at)))?;
        Ok(CacheEntry::new(row.resource_key, row.resource_class, fetched_at))
    }
}

#[async_trait]
impl CacheEntryRepository for SqliteCacheEntryRepository {
    async fn get(
        &self,
        resource_class: &str,
        resource_key: &str,
    ) -> Result<Option<CacheEntry>, DbError> {
        let row: Option<CacheEntryRow> = sqlx::query_as(
            "SELECT resource_class, resource_key, fetched_at FROM cache_entries
             WHERE resource_class = ? AND resource_key = ?",
        )
        .bind(resource_class)
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CacheEntry::try_from).transpose()
    }

    async fn get_all(&self) -> Result<Vec<CacheEntry>, DbError> {
        let rows: Vec<CacheEntryRow> = sqlx::query_as(
            "SELECT resource_class, resource_key, fetched_at FROM cache_entries
             ORDER BY resource_class, resource_key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CacheEntry::try_from).collect()
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO cache_entries (resource_class, resource_key, fetched_at)
             VALUES (?, ?, ?)
             ON CONFLICT(resource_class, resource_key) DO UPDATE SET
                fetched_at = excluded.fetched_at",
        )
        .bind(&entry.resource_class)
        .bind(&entry.resource_key)
        .bind(entry.fetched_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations, DbConfig};
    use chrono::TimeDelta;

    async fn setup_test_db() -> SqlitePool {
        let config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        };
        let pool = create_pool(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let repo = SqliteCacheEntryRepository::new(setup_test_db().await);
        let entry = CacheEntry::new("league:39", "standings", at(1_742_000_000_123));

        repo.upsert(&entry).await.unwrap();

        let loaded = repo.get("standings", "league:39").await.unwrap().unwrap();
        assert_eq!(loaded, entry);
        assert!(repo.get("fixtures", "league:39").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_fetch_time() {
        let repo = SqliteCacheEntryRepository::new(setup_test_db().await);
        let first = at(1_742_000_000_000);

        repo.upsert(&CacheEntry::new("team:33", "squads", first))
            .await
            .unwrap();
        repo.upsert(&CacheEntry::new(
            "team:33",
            "squads",
            first + TimeDelta::hours(3),
        ))
        .await
        .unwrap();

        let all = repo.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].fetched_at, first + TimeDelta::hours(3));
    }
}
