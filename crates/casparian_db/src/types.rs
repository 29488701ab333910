//! Typed views over the entities the dispatch core reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Source roots / file tracking
// ============================================================================

/// A watched directory. Created by configuration; never mutated by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRoot {
    pub id: i64,
    pub path: String,
    pub active: bool,
}

/// A (root, relative-path) pair discovered by the scanner.
///
/// `current_version_id` is nullable until first tagging and is mutated only
/// by the routing projector, never by the scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLocation {
    pub id: i64,
    pub source_root_id: i64,
    pub rel_path: String,
    pub last_seen: DateTime<Utc>,
    pub current_version_id: Option<i64>,
}

/// An immutable observation of a location's contents.
///
/// `applied_tags` is an ordered, comma-separated string for stable diffing.
/// Once inserted, no field is ever mutated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileVersion {
    pub id: i64,
    pub location_id: i64,
    pub content_hash: String,
    pub size_bytes: i64,
    pub modified_time: Option<DateTime<Utc>>,
    pub applied_tags: String,
}

impl FileVersion {
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.applied_tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

// ============================================================================
// Plugin manifests / environments / publishers
// ============================================================================

/// `PluginManifest` lifecycle, re-exported from the protocol crate so the
/// store and the wire protocol never disagree on the vocabulary.
pub use casparian_protocol::PluginStatus;

/// A deployed (or rejected/staged) artifact record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PluginManifest {
    pub id: i64,
    pub plugin_name: String,
    pub version: String,
    pub source_code: String,
    pub source_hash: String,
    pub env_hash: Option<String>,
    pub artifact_hash: String,
    pub signature: String,
    pub publisher_id: Option<i64>,
    #[sqlx(try_from = "String")]
    pub status: PluginStatusRow,
    pub validation_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
}

/// `sqlx::FromRow` needs a concrete owned conversion; this newtype bridges
/// the stored `TEXT` column and [`PluginStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginStatusRow(pub PluginStatus);

impl TryFrom<String> for PluginStatusRow {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map(PluginStatusRow)
    }
}

impl From<PluginStatusRow> for PluginStatus {
    fn from(value: PluginStatusRow) -> Self {
        value.0
    }
}

/// A content-addressed execution environment, keyed by `env_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PluginEnvironment {
    pub env_hash: String,
    pub lockfile_content: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// An identity that produced a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Publisher {
    pub id: i64,
    pub display_name: String,
    pub email: Option<String>,
    pub external_identity_oid: Option<String>,
}

// ============================================================================
// Routing projection
// ============================================================================

/// A derived pattern→tag mapping, projected from manifest metadata.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoutingRule {
    pub id: i64,
    pub pattern: String,
    pub tag: String,
    pub priority: i64,
}

/// A plugin→tag binding: which tags a plugin consumes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PluginSubscription {
    pub id: i64,
    pub plugin_name: String,
    pub tag: String,
}

/// A plugin→(topic, sink URI, write mode) binding.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopicConfig {
    pub id: i64,
    pub plugin_name: String,
    pub topic_name: String,
    pub uri: String,
    pub mode: String,
}

// ============================================================================
// Processing queue
// ============================================================================

pub use casparian_protocol::ProcessingStatus;

/// `sqlx::FromRow` bridge, mirroring [`PluginStatusRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingStatusRow(pub ProcessingStatus);

impl TryFrom<String> for ProcessingStatusRow {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map(ProcessingStatusRow)
    }
}

impl From<ProcessingStatusRow> for ProcessingStatus {
    fn from(value: ProcessingStatusRow) -> Self {
        value.0
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessingJob {
    pub id: i64,
    pub file_version_id: i64,
    pub plugin_name: String,
    #[sqlx(try_from = "String")]
    pub status: ProcessingStatusRow,
    pub priority: i64,
    pub retry_count: i64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<ProcessingStatus>,
    pub plugin_name: Option<String>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_version_tags_splits_and_trims() {
        let fv = FileVersion {
            id: 1,
            location_id: 1,
            content_hash: "abc".into(),
            size_bytes: 10,
            modified_time: None,
            applied_tags: "auto_csv, manual_override".into(),
        };
        let tags: Vec<&str> = fv.tags().collect();
        assert_eq!(tags, vec!["auto_csv", "manual_override"]);
    }

    #[test]
    fn plugin_status_row_round_trips() {
        let row: PluginStatusRow = "ACTIVE".to_string().try_into().unwrap();
        assert_eq!(PluginStatus::from(row), PluginStatus::Active);
    }
}
