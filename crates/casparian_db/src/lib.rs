//! Persistent store for the dispatch core's entities (spec ref: data model).
//!
//! One SQLite database, accessed through `sqlx`, holding file-tracking,
//! plugin-manifest, routing-projection, and job-queue state. Each group of
//! entities gets its own accessor module; `types` is the single source of
//! truth for the row shapes.

pub mod error;
pub mod files;
pub mod manifests;
pub mod queue;
pub mod routing;
mod schema;
pub mod types;

pub use error::{DbError, Result};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// Handle to the persistent store. Cheap to clone (`SqlitePool` is an `Arc`
/// internally).
#[derive(Clone)]
pub struct CasparianDb {
    pool: SqlitePool,
}

impl CasparianDb {
    /// Open (creating if absent) the database at `url` and ensure schema.
    ///
    /// `url` follows sqlx's sqlite URL form, e.g. `sqlite://state.db?mode=rwc`
    /// or `sqlite::memory:` for tests.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await?;
        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Wrap an already-open pool (used by tests that share a connection).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> CasparianDb {
        CasparianDb::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn connect_creates_schema() {
        let db = memory_db().await;
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM processing_jobs")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
