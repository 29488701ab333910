//! Plugin manifests, content-addressed environments, and publishers.

use crate::error::{DbError, Result};
use crate::types::{PluginEnvironment, PluginManifest, PluginStatus, Publisher};
use crate::CasparianDb;
use sqlx::Row;

impl CasparianDb {
    pub async fn get_or_create_publisher(
        &self,
        display_name: &str,
        email: Option<&str>,
        external_identity_oid: Option<&str>,
    ) -> Result<i64> {
        if let Some(oid) = external_identity_oid {
            if let Some((id,)) = sqlx::query_as::<_, (i64,)>(
                "SELECT id FROM publishers WHERE external_identity_oid = ?",
            )
            .bind(oid)
            .fetch_optional(&self.pool)
            .await?
            {
                return Ok(id);
            }
        }

        let result = sqlx::query(
            "INSERT INTO publishers (display_name, email, external_identity_oid) VALUES (?, ?, ?)",
        )
        .bind(display_name)
        .bind(email)
        .bind(external_identity_oid)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Reject the source hash if a manifest already claims it (stage 1 of
    /// the deployment pipeline: `source_hash` is unique across all manifests).
    pub async fn source_hash_exists(&self, source_hash: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM plugin_manifests WHERE source_hash = ?")
                .bind(source_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Insert a manifest row. `status` is typically PENDING or REJECTED;
    /// callers advance it through `set_manifest_status`/`promote_manifest`.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_manifest(
        &self,
        plugin_name: &str,
        version: &str,
        source_code: &str,
        source_hash: &str,
        env_hash: Option<&str>,
        artifact_hash: &str,
        signature: &str,
        publisher_id: Option<i64>,
        status: PluginStatus,
        validation_message: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"INSERT INTO plugin_manifests
               (plugin_name, version, source_code, source_hash, env_hash, artifact_hash,
                signature, publisher_id, status, validation_message)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(plugin_name)
        .bind(version)
        .bind(source_code)
        .bind(source_hash)
        .bind(env_hash)
        .bind(artifact_hash)
        .bind(signature)
        .bind(publisher_id)
        .bind(status.as_str())
        .bind(validation_message)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn set_manifest_status(
        &self,
        manifest_id: i64,
        status: PluginStatus,
        validation_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE plugin_manifests SET status = ?, validation_message = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(validation_message)
        .bind(manifest_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stage 5: promote STAGING → ACTIVE, retiring any prior ACTIVE manifest
    /// of the same plugin name (its `deployed_at` simply stops being the
    /// latest; readers resolve "current" as the newest ACTIVE row).
    ///
    /// Does not project routing entities — callers run that as part of the
    /// same transaction via [`Self::project_routing`] so promotion and
    /// projection stay atomic.
    pub async fn promote_manifest(&self, manifest_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status, plugin_name FROM plugin_manifests WHERE id = ?")
            .bind(manifest_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::not_found(format!("manifest {manifest_id}")))?;

        let status: String = row.get("status");
        if status != PluginStatus::Staging.as_str() {
            return Err(DbError::invalid_state(format!(
                "cannot promote manifest {manifest_id} from status {status}"
            )));
        }

        sqlx::query(
            "UPDATE plugin_manifests SET status = ?, deployed_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
        )
        .bind(PluginStatus::Active.as_str())
        .bind(manifest_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_manifest(&self, id: i64) -> Result<Option<PluginManifest>> {
        let row = sqlx::query_as::<_, PluginManifest>(
            r#"SELECT id, plugin_name, version, source_code, source_hash, env_hash,
                      artifact_hash, signature, publisher_id, status, validation_message,
                      created_at, deployed_at
               FROM plugin_manifests WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// The newest ACTIVE manifest for a plugin name, if any.
    pub async fn active_manifest_for_plugin(
        &self,
        plugin_name: &str,
    ) -> Result<Option<PluginManifest>> {
        let row = sqlx::query_as::<_, PluginManifest>(
            r#"SELECT id, plugin_name, version, source_code, source_hash, env_hash,
                      artifact_hash, signature, publisher_id, status, validation_message,
                      created_at, deployed_at
               FROM plugin_manifests
               WHERE plugin_name = ? AND status = 'ACTIVE'
               ORDER BY deployed_at DESC, id DESC
               LIMIT 1"#,
        )
        .bind(plugin_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Environments
    // ------------------------------------------------------------------

    pub async fn get_environment(&self, env_hash: &str) -> Result<Option<PluginEnvironment>> {
        let row = sqlx::query_as::<_, PluginEnvironment>(
            "SELECT env_hash, lockfile_content, size_bytes, created_at, last_used FROM plugin_environments WHERE env_hash = ?",
        )
        .bind(env_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Record a newly materialized environment. Callers first check
    /// [`Self::get_environment`] to distinguish create from touch.
    pub async fn create_environment(
        &self,
        env_hash: &str,
        lockfile_content: &str,
        size_bytes: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO plugin_environments (env_hash, lockfile_content, size_bytes)
               VALUES (?, ?, ?)
               ON CONFLICT(env_hash) DO UPDATE SET
                   size_bytes = excluded.size_bytes,
                   last_used = strftime('%Y-%m-%dT%H:%M:%fZ','now')"#,
        )
        .bind(env_hash)
        .bind(lockfile_content)
        .bind(size_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_environment(&self, env_hash: &str) -> Result<()> {
        sqlx::query(
            "UPDATE plugin_environments SET last_used = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE env_hash = ?",
        )
        .bind(env_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_environment(&self, env_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM plugin_environments WHERE env_hash = ?")
            .bind(env_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Environments ordered ascending by `last_used`, for LRU eviction.
    pub async fn environments_by_last_used(&self) -> Result<Vec<PluginEnvironment>> {
        let rows = sqlx::query_as::<_, PluginEnvironment>(
            "SELECT env_hash, lockfile_content, size_bytes, created_at, last_used FROM plugin_environments ORDER BY last_used ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Environment hashes currently referenced by a RUNNING job, so the
    /// evictor never reclaims them.
    pub async fn env_hashes_in_use(&self) -> Result<std::collections::HashSet<String>> {
        let rows: Vec<(Option<String>,)> = sqlx::query_as(
            r#"SELECT DISTINCT pm.env_hash
               FROM processing_jobs pj
               JOIN file_versions fv ON fv.id = pj.file_version_id
               JOIN plugin_manifests pm ON pm.plugin_name = pj.plugin_name AND pm.status = 'ACTIVE'
               WHERE pj.status = 'RUNNING'"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(|(h,)| h).collect())
    }
}
