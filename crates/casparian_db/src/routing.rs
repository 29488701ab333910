//! Routing projection: pattern→tag→plugin-subscription derivation.

use crate::error::Result;
use crate::types::{PluginSubscription, RoutingRule, TopicConfig};
use crate::CasparianDb;

/// What an ACTIVE manifest's extracted `MANIFEST` declares, used to project
/// the derived routing entities.
#[derive(Debug, Clone)]
pub struct ManifestRouting {
    pub plugin_name: String,
    pub pattern: String,
    pub topic: String,
    pub sink_uri: String,
}

impl CasparianDb {
    /// Project one ACTIVE manifest's routing triple atomically: a
    /// RoutingRule, a PluginSubscription, and a TopicConfig, all keyed by
    /// plugin name so a later ACTIVE version overwrites rather than
    /// duplicates.
    pub async fn project_routing(&self, routing: &ManifestRouting) -> Result<()> {
        let tag = format!("auto_{}", routing.plugin_name);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO routing_rules (pattern, tag, priority) VALUES (?, ?, 0)
               ON CONFLICT(pattern, tag) DO NOTHING"#,
        )
        .bind(&routing.pattern)
        .bind(&tag)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO plugin_subscriptions (plugin_name, tag) VALUES (?, ?)
               ON CONFLICT(plugin_name, tag) DO NOTHING"#,
        )
        .bind(&routing.plugin_name)
        .bind(&tag)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO topic_configs (plugin_name, topic_name, uri, mode)
               VALUES (?, ?, ?, 'append')
               ON CONFLICT(plugin_name, topic_name) DO UPDATE SET uri = excluded.uri"#,
        )
        .bind(&routing.plugin_name)
        .bind(&routing.topic)
        .bind(&routing.sink_uri)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// All routing rules, highest priority first, for the Tagger to match
    /// file names against.
    pub async fn routing_rules_by_priority(&self) -> Result<Vec<RoutingRule>> {
        let rows = sqlx::query_as::<_, RoutingRule>(
            "SELECT id, pattern, tag, priority FROM routing_rules ORDER BY priority DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Plugins subscribed to a tag, used to decide which jobs to enqueue for
    /// a newly tagged FileVersion.
    pub async fn plugins_subscribed_to(&self, tag: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT plugin_name FROM plugin_subscriptions WHERE tag = ?")
                .bind(tag)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    pub async fn subscriptions_for_plugin(&self, plugin_name: &str) -> Result<Vec<PluginSubscription>> {
        let rows = sqlx::query_as::<_, PluginSubscription>(
            "SELECT id, plugin_name, tag FROM plugin_subscriptions WHERE plugin_name = ?",
        )
        .bind(plugin_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn topic_configs_for_plugin(&self, plugin_name: &str) -> Result<Vec<TopicConfig>> {
        let rows = sqlx::query_as::<_, TopicConfig>(
            "SELECT id, plugin_name, topic_name, uri, mode FROM topic_configs WHERE plugin_name = ?",
        )
        .bind(plugin_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> CasparianDb {
        CasparianDb::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn projection_overwrites_rows_keyed_by_plugin_name() {
        let db = memory_db().await;
        let routing = ManifestRouting {
            plugin_name: "csv_parser".into(),
            pattern: "*.csv".into(),
            topic: "rows".into(),
            sink_uri: "parquet://./out/v1/".into(),
        };
        db.project_routing(&routing).await.unwrap();

        let mut updated = routing.clone();
        updated.sink_uri = "parquet://./out/v2/".into();
        db.project_routing(&updated).await.unwrap();

        let topics = db.topic_configs_for_plugin("csv_parser").await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].uri, "parquet://./out/v2/");

        let subs = db.subscriptions_for_plugin("csv_parser").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].tag, "auto_csv_parser");
    }

    #[tokio::test]
    async fn plugins_subscribed_to_tag_finds_matches() {
        let db = memory_db().await;
        db.project_routing(&ManifestRouting {
            plugin_name: "csv_parser".into(),
            pattern: "*.csv".into(),
            topic: "rows".into(),
            sink_uri: "parquet://./out/".into(),
        })
        .await
        .unwrap();

        let plugins = db.plugins_subscribed_to("auto_csv_parser").await.unwrap();
        assert_eq!(plugins, vec!["csv_parser".to_string()]);
    }
}
