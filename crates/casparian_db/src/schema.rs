//! Database schema creation for every entity in the dispatch core's data model.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::CasparianDb;

impl CasparianDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;

        self.create_file_tracking_tables().await?;
        self.create_manifest_tables().await?;
        self.create_routing_tables().await?;
        self.create_queue_tables().await?;

        Ok(())
    }

    async fn create_file_tracking_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS source_roots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                active INTEGER NOT NULL DEFAULT 1
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS file_locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_root_id INTEGER NOT NULL REFERENCES source_roots(id),
                rel_path TEXT NOT NULL,
                last_seen TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                current_version_id INTEGER,
                UNIQUE(source_root_id, rel_path)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS file_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location_id INTEGER NOT NULL REFERENCES file_locations(id),
                content_hash TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                modified_time TEXT,
                applied_tags TEXT NOT NULL DEFAULT ''
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_file_versions_location ON file_versions(location_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_manifest_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS publishers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                display_name TEXT NOT NULL,
                email TEXT,
                external_identity_oid TEXT UNIQUE
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS plugin_environments (
                env_hash TEXT PRIMARY KEY,
                lockfile_content TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                last_used TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS plugin_manifests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_name TEXT NOT NULL,
                version TEXT NOT NULL,
                source_code TEXT NOT NULL,
                source_hash TEXT NOT NULL UNIQUE,
                env_hash TEXT REFERENCES plugin_environments(env_hash),
                artifact_hash TEXT NOT NULL,
                signature TEXT NOT NULL,
                publisher_id INTEGER REFERENCES publishers(id),
                status TEXT NOT NULL DEFAULT 'PENDING',
                validation_message TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                deployed_at TEXT,
                UNIQUE(plugin_name, version)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_plugin_manifests_name ON plugin_manifests(plugin_name)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_plugin_manifests_status ON plugin_manifests(status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_routing_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS routing_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern TEXT NOT NULL,
                tag TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                UNIQUE(pattern, tag)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS plugin_subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_name TEXT NOT NULL,
                tag TEXT NOT NULL,
                UNIQUE(plugin_name, tag)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS topic_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_name TEXT NOT NULL,
                topic_name TEXT NOT NULL,
                uri TEXT NOT NULL,
                mode TEXT NOT NULL DEFAULT 'append',
                UNIQUE(plugin_name, topic_name)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_routing_rules_priority ON routing_rules(priority DESC)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_queue_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS processing_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_version_id INTEGER NOT NULL REFERENCES file_versions(id),
                plugin_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'QUEUED',
                priority INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                claimed_at TEXT,
                finished_at TEXT,
                error_message TEXT,
                result_summary TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_processing_jobs_status_priority ON processing_jobs(status, priority DESC, id ASC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_processing_jobs_plugin ON processing_jobs(plugin_name)",
        )
        .execute(&self.pool)
        .await?;
        // Enforces "unique per non-terminal instance" for (file_version_id, plugin_name);
        // terminal rows are exempt via the partial predicate so retries can insert siblings.
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_processing_jobs_active_unique
               ON processing_jobs(file_version_id, plugin_name)
               WHERE status IN ('QUEUED', 'RUNNING')"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
