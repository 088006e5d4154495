// Summary cache - SQLite-backed list store with delta patching

use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::records::{DeltaPayload, EntitySummary};

/// Local store for list summaries, one logical list per entity type.
/// A refresh log remembers when each list was last brought up to date
/// so later fetches can ask the server for changes only.
pub struct SummaryCache {
    pool: SqlitePool,
}

impl SummaryCache {
    /// Opens or creates the cache database at `path`. The special
    /// path `:memory:` keeps the cache for the process lifetime only.
    pub async fn open(path: &str) -> AppResult<Self> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        AppError::CacheError(format!("Failed to create cache directory: {}", e))
                    })?;
                }
            }
            format!("sqlite://{}?mode=rwc", path)
        };
        let pool = SqlitePool::connect(&url).await.map_err(|e| {
            AppError::CacheError(format!("Failed to open cache at {}: {}", path, e))
        })?;

        let cache = Self { pool };
        cache.initialize().await?;
        Ok(cache)
    }

    pub async fn open_in_memory() -> AppResult<Self> {
        Self::open(":memory:").await
    }

    async fn initialize(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entity_summaries (
                entity_type TEXT NOT NULL,
                uid TEXT NOT NULL,
                label TEXT NOT NULL,
                real_type TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                deleted_and_has_dependent_nodes INTEGER NOT NULL DEFAULT 0,
                is_merged_item INTEGER NOT NULL DEFAULT 0,
                merged_items TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (entity_type, uid)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::CacheError(format!("Failed to create summaries table: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entity_summaries_listing \
             ON entity_summaries(entity_type, real_type, label)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::CacheError(format!("Failed to create listing index: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS list_refresh_log (
                entity_type TEXT PRIMARY KEY,
                last_refreshed TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::CacheError(format!("Failed to create refresh log: {}", e)))?;

        Ok(())
    }

    /// Upserts a full list response and stamps the refresh log with
    /// the local clock. Rows absent from `items` are left in place;
    /// the server reports removals through deltas.
    pub async fn store_full(&self, entity_type: &str, items: &[EntitySummary]) -> AppResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::CacheError(format!("Failed to begin cache transaction: {}", e))
        })?;

        for item in items {
            upsert_summary(&mut tx, entity_type, item).await?;
        }
        stamp_refreshed(&mut tx, entity_type).await?;

        tx.commit().await.map_err(|e| {
            AppError::CacheError(format!("Failed to commit cache transaction: {}", e))
        })?;
        debug!(entity_type, count = items.len(), "stored full list");
        Ok(())
    }

    /// Applies a delta: upserts changed rows, removes deleted ones,
    /// then stamps the refresh log. Replaying the same delta leaves
    /// the cache unchanged.
    pub async fn apply_delta(&self, entity_type: &str, delta: &DeltaPayload) -> AppResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::CacheError(format!("Failed to begin cache transaction: {}", e))
        })?;

        for item in &delta.created_modified {
            upsert_summary(&mut tx, entity_type, item).await?;
        }
        for removed in &delta.deleted {
            sqlx::query("DELETE FROM entity_summaries WHERE entity_type = ? AND uid = ?")
                .bind(entity_type)
                .bind(&removed.uid)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::CacheError(format!("Failed to remove cached row: {}", e))
                })?;
        }
        stamp_refreshed(&mut tx, entity_type).await?;

        tx.commit().await.map_err(|e| {
            AppError::CacheError(format!("Failed to commit cache transaction: {}", e))
        })?;
        debug!(
            entity_type,
            changed = delta.created_modified.len(),
            removed = delta.deleted.len(),
            "applied delta"
        );
        Ok(())
    }

    /// Cached summaries for a type, ordered by real type then label.
    pub async fn list(&self, entity_type: &str) -> AppResult<Vec<EntitySummary>> {
        let rows = sqlx::query(
            "SELECT uid, label, real_type, is_deleted, deleted_and_has_dependent_nodes, \
                    is_merged_item, merged_items \
             FROM entity_summaries WHERE entity_type = ? \
             ORDER BY real_type, label COLLATE NOCASE",
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::CacheError(format!("Failed to read cached list: {}", e)))?;

        Ok(rows.iter().map(row_to_summary).collect())
    }

    /// Timestamp of the last full or delta refresh for a type.
    pub async fn last_refreshed(&self, entity_type: &str) -> AppResult<Option<String>> {
        let row = sqlx::query("SELECT last_refreshed FROM list_refresh_log WHERE entity_type = ?")
            .bind(entity_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::CacheError(format!("Failed to read refresh log: {}", e)))?;
        Ok(row.map(|r| r.get("last_refreshed")))
    }

    /// Drops everything cached for a type, forcing the next list to
    /// fetch in full.
    pub async fn forget_type(&self, entity_type: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM entity_summaries WHERE entity_type = ?")
            .bind(entity_type)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::CacheError(format!("Failed to clear cached rows: {}", e)))?;
        sqlx::query("DELETE FROM list_refresh_log WHERE entity_type = ?")
            .bind(entity_type)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::CacheError(format!("Failed to clear refresh log: {}", e)))?;
        Ok(())
    }
}

async fn upsert_summary(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entity_type: &str,
    item: &EntitySummary,
) -> AppResult<()> {
    let merged_items = serde_json::to_string(&item.merged_items).map_err(|e| {
        AppError::CacheError(format!("Failed to serialize merged items: {}", e))
    })?;
    sqlx::query(
        r#"
        INSERT INTO entity_summaries
            (entity_type, uid, label, real_type, is_deleted,
             deleted_and_has_dependent_nodes, is_merged_item, merged_items)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (entity_type, uid) DO UPDATE SET
            label = excluded.label,
            real_type = excluded.real_type,
            is_deleted = excluded.is_deleted,
            deleted_and_has_dependent_nodes = excluded.deleted_and_has_dependent_nodes,
            is_merged_item = excluded.is_merged_item,
            merged_items = excluded.merged_items
        "#,
    )
    .bind(entity_type)
    .bind(&item.uid)
    .bind(&item.label)
    .bind(&item.real_type)
    .bind(item.is_deleted)
    .bind(item.deleted_and_has_dependent_nodes)
    .bind(item.is_merged_item)
    .bind(merged_items)
    .execute(&mut **tx)
    .await
    .map_err(|e| AppError::CacheError(format!("Failed to upsert cached row: {}", e)))?;
    Ok(())
}

async fn stamp_refreshed(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entity_type: &str,
) -> AppResult<()> {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    sqlx::query(
        r#"
        INSERT INTO list_refresh_log (entity_type, last_refreshed)
        VALUES (?, ?)
        ON CONFLICT (entity_type) DO UPDATE SET last_refreshed = excluded.last_refreshed
        "#,
    )
    .bind(entity_type)
    .bind(stamp)
    .execute(&mut **tx)
    .await
    .map_err(|e| AppError::CacheError(format!("Failed to stamp refresh log: {}", e)))?;
    Ok(())
}

fn row_to_summary(row: &SqliteRow) -> EntitySummary {
    let merged_raw: String = row.get("merged_items");
    EntitySummary {
        uid: row.get("uid"),
        label: row.get("label"),
        real_type: row.get("real_type"),
        is_deleted: row.get("is_deleted"),
        deleted_and_has_dependent_nodes: row.get("deleted_and_has_dependent_nodes"),
        is_merged_item: row.get("is_merged_item"),
        merged_items: serde_json::from_str(&merged_raw).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DeletedRef;

    fn summary(uid: &str, label: &str, real_type: &str) -> EntitySummary {
        EntitySummary {
            uid: uid.to_string(),
            label: label.to_string(),
            real_type: real_type.to_string(),
            is_deleted: false,
            deleted_and_has_dependent_nodes: false,
            is_merged_item: false,
            merged_items: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_store_full_and_read_back_ordered() {
        let cache = SummaryCache::open_in_memory().await.unwrap();
        cache
            .store_full(
                "person",
                &[
                    summary("u2", "zelda", "personsubtype"),
                    summary("u1", "Ada", "person"),
                    summary("u3", "Bertha", "person"),
                ],
            )
            .await
            .unwrap();

        let items = cache.list("person").await.unwrap();
        let labels: Vec<&str> = items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["Ada", "Bertha", "zelda"]);
        assert!(cache.last_refreshed("person").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_full_upserts_existing_rows() {
        let cache = SummaryCache::open_in_memory().await.unwrap();
        cache
            .store_full("person", &[summary("u1", "Ada", "person")])
            .await
            .unwrap();
        cache
            .store_full("person", &[summary("u1", "Ada Lovelace", "person")])
            .await
            .unwrap();

        let items = cache.list("person").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, "Ada Lovelace");
    }

    #[tokio::test]
    async fn test_apply_delta_is_idempotent() {
        let cache = SummaryCache::open_in_memory().await.unwrap();
        cache
            .store_full(
                "person",
                &[summary("u1", "Ada", "person"), summary("u2", "Bertha", "person")],
            )
            .await
            .unwrap();

        let delta = DeltaPayload {
            created_modified: vec![summary("u1", "Ada Lovelace", "person")],
            deleted: vec![DeletedRef { uid: "u2".to_string() }],
        };
        cache.apply_delta("person", &delta).await.unwrap();
        let first = cache.list("person").await.unwrap();

        cache.apply_delta("person", &delta).await.unwrap();
        let second = cache.list("person").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].label, "Ada Lovelace");
    }

    #[tokio::test]
    async fn test_deltas_keep_types_separate() {
        let cache = SummaryCache::open_in_memory().await.unwrap();
        cache
            .store_full("person", &[summary("u1", "Ada", "person")])
            .await
            .unwrap();
        cache
            .store_full("organisation", &[summary("u1", "Acme", "organisation")])
            .await
            .unwrap();

        let delta = DeltaPayload {
            created_modified: Vec::new(),
            deleted: vec![DeletedRef { uid: "u1".to_string() }],
        };
        cache.apply_delta("person", &delta).await.unwrap();

        assert!(cache.list("person").await.unwrap().is_empty());
        assert_eq!(cache.list("organisation").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forget_type_clears_rows_and_stamp() {
        let cache = SummaryCache::open_in_memory().await.unwrap();
        cache
            .store_full("person", &[summary("u1", "Ada", "person")])
            .await
            .unwrap();
        cache.forget_type("person").await.unwrap();

        assert!(cache.list("person").await.unwrap().is_empty());
        assert!(cache.last_refreshed("person").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merged_items_roundtrip() {
        let cache = SummaryCache::open_in_memory().await.unwrap();
        let mut item = summary("u1", "Ada", "person");
        item.merged_items = vec![summary("u9", "A. Lovelace", "person")];
        cache.store_full("person", &[item]).await.unwrap();

        let items = cache.list("person").await.unwrap();
        assert_eq!(items[0].merged_items.len(), 1);
        assert_eq!(items[0].merged_items[0].uid, "u9");
    }
}
