//! Priority job queue: push, claim, complete, fail, with retry/backoff.

use crate::error::Result;
use crate::types::{JobFilter, ProcessingJob, ProcessingStatus};
use crate::CasparianDb;
use sqlx::Row;

/// Re-enqueue attempts beyond this bound are reclassified permanent.
pub const MAX_RETRIES: i64 = 3;
/// Each retry decays effective priority by `retry_count * PRIORITY_DECAY_STEP`
/// so repeatedly-failing jobs don't starve fresh work.
pub const PRIORITY_DECAY_STEP: i64 = 5;

impl CasparianDb {
    /// Insert a QUEUED row. Idempotent on `(file_version_id, plugin_name)`
    /// while a non-terminal row for that pair exists (enforced by the
    /// partial unique index on the table).
    pub async fn push_job(
        &self,
        file_version_id: i64,
        plugin_name: &str,
        priority: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"INSERT INTO processing_jobs (file_version_id, plugin_name, status, priority)
               VALUES (?, ?, 'QUEUED', ?)
               ON CONFLICT(file_version_id, plugin_name) WHERE status IN ('QUEUED', 'RUNNING') DO NOTHING"#,
        )
        .bind(file_version_id)
        .bind(plugin_name)
        .bind(priority)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(result.last_insert_rowid());
        }

        let row = sqlx::query(
            r#"SELECT id FROM processing_jobs
               WHERE file_version_id = ? AND plugin_name = ? AND status IN ('QUEUED', 'RUNNING')"#,
        )
        .bind(file_version_id)
        .bind(plugin_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    /// Atomically select the highest-priority QUEUED row whose plugin name
    /// is in `capabilities` and transition it to RUNNING. FIFO tie-break
    /// within a priority class (lower id first).
    ///
    /// Serializable against concurrent claims: SQLite's default transaction
    /// isolation plus the `UPDATE ... WHERE status = 'QUEUED'` guard means at
    /// most one caller observes the QUEUED→RUNNING transition for a row,
    /// even with multiple pool connections racing.
    ///
    /// `"*"` in `capabilities` is a wildcard meaning "any plugin" and takes
    /// priority over the rest of the list: a worker that declared `["*"]`
    /// (or any capability list containing it) is matched against every
    /// QUEUED job regardless of plugin name.
    pub async fn claim_job(&self, capabilities: &[String]) -> Result<Option<ProcessingJob>> {
        if capabilities.is_empty() {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;

        let candidate = if capabilities.iter().any(|c| c == "*") {
            sqlx::query(
                r#"SELECT id FROM processing_jobs
                   WHERE status = 'QUEUED'
                   ORDER BY priority DESC, id ASC
                   LIMIT 1"#,
            )
            .fetch_optional(&mut *tx)
            .await?
        } else {
            let placeholders = capabilities.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let select_sql = format!(
                r#"SELECT id FROM processing_jobs
                   WHERE status = 'QUEUED' AND plugin_name IN ({placeholders})
                   ORDER BY priority DESC, id ASC
                   LIMIT 1"#
            );
            let mut select = sqlx::query(&select_sql);
            for cap in capabilities {
                select = select.bind(cap);
            }
            select.fetch_optional(&mut *tx).await?
        };

        let Some(candidate_row) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };
        let job_id: i64 = candidate_row.get("id");

        let result = sqlx::query(
            r#"UPDATE processing_jobs SET status = 'RUNNING', claimed_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
               WHERE id = ? AND status = 'QUEUED'"#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the race to a concurrent claim between select and update.
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        self.get_job(job_id).await
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<ProcessingJob>> {
        let row = sqlx::query_as::<_, ProcessingJob>(
            r#"SELECT id, file_version_id, plugin_name, status, priority, retry_count,
                      claimed_at, finished_at, error_message, result_summary, created_at
               FROM processing_jobs WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ProcessingJob>> {
        let mut sql = String::from(
            r#"SELECT id, file_version_id, plugin_name, status, priority, retry_count,
                      claimed_at, finished_at, error_message, result_summary, created_at
               FROM processing_jobs WHERE 1=1"#,
        );
        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND status = '{}'", status.as_str()));
        }
        if let Some(ref plugin) = filter.plugin_name {
            sql.push_str(&format!(" AND plugin_name = '{}'", plugin.replace('\'', "''")));
        }
        sql.push_str(" ORDER BY priority DESC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = sqlx::query_as::<_, ProcessingJob>(&sql).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// RUNNING → COMPLETED. Idempotent: completing an already-COMPLETED job
    /// is a no-op.
    pub async fn complete_job(&self, job_id: i64, summary: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"UPDATE processing_jobs
               SET status = 'COMPLETED', finished_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'), result_summary = ?
               WHERE id = ? AND status != 'COMPLETED'"#,
        )
        .bind(summary)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// RUNNING → FAILED. If `retryable` and the job's retry count is under
    /// [`MAX_RETRIES`], immediately re-enqueues a sibling QUEUED row with
    /// `retry_count + 1` and priority decayed by `PRIORITY_DECAY_STEP`.
    pub async fn fail_job(&self, job_id: i64, message: &str, retryable: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT file_version_id, plugin_name, priority, retry_count FROM processing_jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(());
        };

        sqlx::query(
            r#"UPDATE processing_jobs
               SET status = 'FAILED', finished_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'), error_message = ?
               WHERE id = ?"#,
        )
        .bind(message)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        let retry_count: i64 = row.get("retry_count");
        if retryable && retry_count < MAX_RETRIES {
            let file_version_id: i64 = row.get("file_version_id");
            let plugin_name: String = row.get("plugin_name");
            let priority: i64 = row.get("priority");
            let new_priority = priority - (retry_count + 1) * PRIORITY_DECAY_STEP;

            sqlx::query(
                r#"INSERT INTO processing_jobs
                   (file_version_id, plugin_name, status, priority, retry_count)
                   VALUES (?, ?, 'QUEUED', ?, ?)
                   ON CONFLICT(file_version_id, plugin_name) WHERE status IN ('QUEUED', 'RUNNING') DO NOTHING"#,
            )
            .bind(file_version_id)
            .bind(&plugin_name)
            .bind(new_priority)
            .bind(retry_count + 1)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"SELECT
                   SUM(CASE WHEN status = 'QUEUED' THEN 1 ELSE 0 END) AS queued,
                   SUM(CASE WHEN status = 'RUNNING' THEN 1 ELSE 0 END) AS running,
                   SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END) AS completed,
                   SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END) AS failed
               FROM processing_jobs"#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            queued: row.try_get::<Option<i64>, _>("queued")?.unwrap_or(0),
            running: row.try_get::<Option<i64>, _>("running")?.unwrap_or(0),
            completed: row.try_get::<Option<i64>, _>("completed")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
        })
    }
}

/// Aggregate queue depth by status, used by the broker's idle-tick log line.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobFilter;

    async fn seeded_db() -> (CasparianDb, i64) {
        let db = CasparianDb::connect("sqlite::memory:").await.unwrap();
        let root = db.register_source_root("/data").await.unwrap();
        let loc = db.upsert_file_location(root, "a.csv").await.unwrap();
        let version = db
            .insert_file_version(loc, "hash1", 10, None, "auto_csv")
            .await
            .unwrap();
        (db, version)
    }

    #[tokio::test]
    async fn claim_picks_highest_priority_then_fifo() {
        let (db, version) = seeded_db().await;
        db.push_job(version, "csv_parser", 5).await.unwrap();

        let root2 = db.register_source_root("/data2").await.unwrap();
        let loc2 = db.upsert_file_location(root2, "b.csv").await.unwrap();
        let version2 = db
            .insert_file_version(loc2, "hash2", 10, None, "auto_csv")
            .await
            .unwrap();
        db.push_job(version2, "csv_parser", 10).await.unwrap();

        let claimed = db
            .claim_job(&["csv_parser".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.file_version_id, version2);
        assert_eq!(ProcessingStatus::from(claimed.status), ProcessingStatus::Running);
    }

    #[tokio::test]
    async fn claim_ignores_jobs_outside_capability_set() {
        let (db, version) = seeded_db().await;
        db.push_job(version, "csv_parser", 1).await.unwrap();

        let claimed = db.claim_job(&["other_plugin".to_string()]).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn push_is_idempotent_while_non_terminal() {
        let (db, version) = seeded_db().await;
        let id1 = db.push_job(version, "csv_parser", 1).await.unwrap();
        let id2 = db.push_job(version, "csv_parser", 1).await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn failing_retryable_job_reenqueues_with_decayed_priority() {
        let (db, version) = seeded_db().await;
        db.push_job(version, "csv_parser", 10).await.unwrap();
        let job = db
            .claim_job(&["csv_parser".to_string()])
            .await
            .unwrap()
            .unwrap();

        db.fail_job(job.id, "transient", true).await.unwrap();

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 1);

        let requeued = db
            .list_jobs(&JobFilter {
                status: Some(ProcessingStatus::Queued),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].priority, 10 - PRIORITY_DECAY_STEP);
        assert_eq!(requeued[0].retry_count, 1);
    }

    #[tokio::test]
    async fn failing_permanent_job_does_not_reenqueue() {
        let (db, version) = seeded_db().await;
        db.push_job(version, "csv_parser", 10).await.unwrap();
        let job = db
            .claim_job(&["csv_parser".to_string()])
            .await
            .unwrap()
            .unwrap();

        db.fail_job(job.id, "permanent", false).await.unwrap();

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn retries_stop_at_max_retries() {
        let (db, version) = seeded_db().await;
        db.push_job(version, "csv_parser", 10).await.unwrap();

        for _ in 0..=MAX_RETRIES {
            let job = db
                .claim_job(&["csv_parser".to_string()])
                .await
                .unwrap()
                .unwrap();
            db.fail_job(job.id, "transient", true).await.unwrap();
        }

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.failed, (MAX_RETRIES + 1) as i64);
    }
}
