//! Source roots, file locations, and file versions.

use crate::error::{DbError, Result};
use crate::types::{FileLocation, FileVersion, SourceRoot};
use crate::CasparianDb;
use sqlx::Row;

impl CasparianDb {
    /// Register a watched directory. Idempotent on `path`.
    pub async fn register_source_root(&self, path: &str) -> Result<i64> {
        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM source_roots WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        if let Some((id,)) = existing {
            return Ok(id);
        }

        let result = sqlx::query("INSERT INTO source_roots (path, active) VALUES (?, 1)")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_source_root(&self, id: i64) -> Result<Option<SourceRoot>> {
        let row = sqlx::query("SELECT id, path, active FROM source_roots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| SourceRoot {
            id: r.get("id"),
            path: r.get("path"),
            active: r.get::<i64, _>("active") != 0,
        }))
    }

    /// Record (or refresh `last_seen` for) a discovered location.
    ///
    /// Does not touch `current_version_id` — that is the routing projector's
    /// responsibility exclusively.
    pub async fn upsert_file_location(&self, source_root_id: i64, rel_path: &str) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO file_locations (source_root_id, rel_path, last_seen)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            ON CONFLICT(source_root_id, rel_path) DO UPDATE SET
                last_seen = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            "#,
        )
        .bind(source_root_id)
        .bind(rel_path)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id FROM file_locations WHERE source_root_id = ? AND rel_path = ?",
        )
        .bind(source_root_id)
        .bind(rel_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    pub async fn get_file_location(&self, id: i64) -> Result<Option<FileLocation>> {
        let row = sqlx::query(
            "SELECT id, source_root_id, rel_path, last_seen, current_version_id FROM file_locations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_location).transpose()
    }

    fn row_to_location(row: sqlx::sqlite::SqliteRow) -> Result<FileLocation> {
        let last_seen: String = row.get("last_seen");
        Ok(FileLocation {
            id: row.get("id"),
            source_root_id: row.get("source_root_id"),
            rel_path: row.get("rel_path"),
            last_seen: chrono::DateTime::parse_from_rfc3339(&last_seen)
                .map_err(|e| DbError::InvalidState(format!("bad last_seen timestamp: {e}")))?
                .with_timezone(&chrono::Utc),
            current_version_id: row.get("current_version_id"),
        })
    }

    /// Insert a new immutable [`FileVersion`] and re-point the location's
    /// `current_version_id` at it. Only the routing projector calls this.
    pub async fn insert_file_version(
        &self,
        location_id: i64,
        content_hash: &str,
        size_bytes: i64,
        modified_time: Option<chrono::DateTime<chrono::Utc>>,
        applied_tags: &str,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"INSERT INTO file_versions (location_id, content_hash, size_bytes, modified_time, applied_tags)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(location_id)
        .bind(content_hash)
        .bind(size_bytes)
        .bind(modified_time.map(|t| t.to_rfc3339()))
        .bind(applied_tags)
        .execute(&mut *tx)
        .await?;
        let version_id = result.last_insert_rowid();

        sqlx::query("UPDATE file_locations SET current_version_id = ? WHERE id = ?")
            .bind(version_id)
            .bind(location_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(version_id)
    }

    pub async fn get_file_version(&self, id: i64) -> Result<Option<FileVersion>> {
        let row = sqlx::query_as::<_, FileVersion>(
            "SELECT id, location_id, content_hash, size_bytes, modified_time, applied_tags FROM file_versions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// The current version of a location, if any has been tagged yet.
    pub async fn current_file_version(&self, location_id: i64) -> Result<Option<FileVersion>> {
        let Some(location) = self.get_file_location(location_id).await? else {
            return Ok(None);
        };
        match location.current_version_id {
            Some(version_id) => self.get_file_version(version_id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> CasparianDb {
        CasparianDb::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn inserting_a_version_repoints_current_version() {
        let db = memory_db().await;
        let root_id = db.register_source_root("/data").await.unwrap();
        let loc_id = db.upsert_file_location(root_id, "a.csv").await.unwrap();

        assert!(db.current_file_version(loc_id).await.unwrap().is_none());

        let v1 = db
            .insert_file_version(loc_id, "hash1", 100, None, "auto_csv")
            .await
            .unwrap();
        let current = db.current_file_version(loc_id).await.unwrap().unwrap();
        assert_eq!(current.id, v1);

        let v2 = db
            .insert_file_version(loc_id, "hash2", 120, None, "auto_csv")
            .await
            .unwrap();
        let current = db.current_file_version(loc_id).await.unwrap().unwrap();
        assert_eq!(current.id, v2);

        // v1 itself is never mutated.
        let v1_row = db.get_file_version(v1).await.unwrap().unwrap();
        assert_eq!(v1_row.content_hash, "hash1");
    }

    #[tokio::test]
    async fn source_root_registration_is_idempotent() {
        let db = memory_db().await;
        let id1 = db.register_source_root("/data").await.unwrap();
        let id2 = db.register_source_root("/data").await.unwrap();
        assert_eq!(id1, id2);
    }
}
