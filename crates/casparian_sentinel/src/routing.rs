//! Routing projector and Tagger (spec's file-routing subsystem).
//!
//! Two halves of the same pipeline:
//! - the projector turns an ACTIVE manifest's declared `(pattern, topic,
//!   subscriptions)` into `RoutingRule`/`PluginSubscription`/`TopicConfig`
//!   rows (just a thin re-export of [`casparian_db::CasparianDb::project_routing`]);
//! - the Tagger runs whenever a location's contents change: it matches the
//!   file name against every routing rule, unions the matches with any
//!   manually-applied tags already on the location, and writes a new
//!   `FileVersion` only when the resulting tag set or content fingerprint
//!   actually differs from the current one.

use casparian_db::error::Result;
use casparian_db::types::FileVersion;
use casparian_db::CasparianDb;
use chrono::{DateTime, Utc};
use globset::Glob;
use std::collections::BTreeSet;

pub use casparian_db::routing::ManifestRouting;

/// Tags auto-derived from routing rules carry this prefix so a re-tag can
/// tell them apart from tags a human applied directly to the location.
const AUTO_TAG_PREFIX: &str = "auto_";

fn manual_tags(version: &FileVersion) -> BTreeSet<String> {
    version
        .tags()
        .filter(|t| !t.starts_with(AUTO_TAG_PREFIX))
        .map(str::to_string)
        .collect()
}

fn format_tags(tags: &BTreeSet<String>) -> String {
    tags.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Match `file_name` against every routing rule (priority-descending, though
/// since every match contributes its tag the ordering only affects which
/// rule a reader would cite first) and return the union of matched tags.
async fn auto_tags_for(db: &CasparianDb, file_name: &str) -> Result<BTreeSet<String>> {
    let rules = db.routing_rules_by_priority().await?;
    let mut tags = BTreeSet::new();
    for rule in rules {
        let glob = match Glob::new(&rule.pattern) {
            Ok(g) => g.compile_matcher(),
            Err(_) => continue,
        };
        if glob.is_match(file_name) {
            tags.insert(rule.tag);
        }
    }
    Ok(tags)
}

/// Re-tag a location whose contents may have changed. `file_name` is the
/// base name used for glob matching; `content_hash`/`size_bytes` describe
/// the observation the scanner made.
///
/// Returns the new `FileVersion` id, or `None` if nothing changed (the
/// tag set and the content fingerprint both matched the current version,
/// so no new version was written and nothing was enqueued).
pub async fn retag_location(
    db: &CasparianDb,
    location_id: i64,
    file_name: &str,
    content_hash: &str,
    size_bytes: i64,
    modified_time: Option<DateTime<Utc>>,
) -> Result<Option<i64>> {
    let current = db.current_file_version(location_id).await?;
    let manual = current.as_ref().map(manual_tags).unwrap_or_default();
    let auto = auto_tags_for(db, file_name).await?;

    let mut next_tags = manual;
    next_tags.extend(auto);
    let next_tag_str = format_tags(&next_tags);

    if let Some(current) = &current {
        if current.content_hash == content_hash && current.applied_tags == next_tag_str {
            return Ok(None);
        }
    }

    let version_id = db
        .insert_file_version(location_id, content_hash, size_bytes, modified_time, &next_tag_str)
        .await?;

    for tag in &next_tags {
        for plugin_name in db.plugins_subscribed_to(tag).await? {
            db.push_job(version_id, &plugin_name, 0).await?;
        }
    }

    Ok(Some(version_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> CasparianDb {
        CasparianDb::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn first_observation_tags_and_enqueues() {
        let db = memory_db().await;
        db.project_routing(&ManifestRouting {
            plugin_name: "csv_parser".into(),
            pattern: "*.csv".into(),
            topic: "output".into(),
            sink_uri: "parquet://out".into(),
        })
        .await
        .unwrap();

        let root = db.register_source_root("/data").await.unwrap();
        let loc = db.upsert_file_location(root, "sales.csv").await.unwrap();

        let version_id = retag_location(&db, loc, "sales.csv", "hash1", 100, None)
            .await
            .unwrap()
            .expect("first observation always produces a version");

        let version = db.get_file_version(version_id).await.unwrap().unwrap();
        assert_eq!(version.applied_tags, "auto_csv_parser");

        let jobs = db
            .list_jobs(&casparian_db::types::JobFilter::default())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].plugin_name, "csv_parser");
    }

    #[tokio::test]
    async fn unchanged_content_and_tags_is_a_noop() {
        let db = memory_db().await;
        db.project_routing(&ManifestRouting {
            plugin_name: "csv_parser".into(),
            pattern: "*.csv".into(),
            topic: "output".into(),
            sink_uri: "parquet://out".into(),
        })
        .await
        .unwrap();

        let root = db.register_source_root("/data").await.unwrap();
        let loc = db.upsert_file_location(root, "sales.csv").await.unwrap();
        retag_location(&db, loc, "sales.csv", "hash1", 100, None)
            .await
            .unwrap();

        let second = retag_location(&db, loc, "sales.csv", "hash1", 100, None)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn changed_content_produces_new_version_and_rematches() {
        let db = memory_db().await;
        let root = db.register_source_root("/data").await.unwrap();
        let loc = db.upsert_file_location(root, "sales.csv").await.unwrap();
        retag_location(&db, loc, "sales.csv", "hash1", 100, None)
            .await
            .unwrap();

        let second = retag_location(&db, loc, "sales.csv", "hash2", 200, None)
            .await
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn manual_tags_survive_retagging() {
        let db = memory_db().await;
        let root = db.register_source_root("/data").await.unwrap();
        let loc = db.upsert_file_location(root, "sales.csv").await.unwrap();
        db.insert_file_version(loc, "hash1", 100, None, "reviewed")
            .await
            .unwrap();

        db.project_routing(&ManifestRouting {
            plugin_name: "csv_parser".into(),
            pattern: "*.csv".into(),
            topic: "output".into(),
            sink_uri: "parquet://out".into(),
        })
        .await
        .unwrap();

        let version_id = retag_location(&db, loc, "sales.csv", "hash2", 200, None)
            .await
            .unwrap()
            .unwrap();
        let version = db.get_file_version(version_id).await.unwrap().unwrap();
        let tags: Vec<&str> = version.tags().collect();
        assert!(tags.contains(&"reviewed"));
        assert!(tags.contains(&"auto_csv_parser"));
    }
}
