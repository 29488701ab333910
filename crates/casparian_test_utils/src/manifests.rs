//! Sample plugins, environments, and publishers for exercising the
//! deployment pipeline and dispatch loop without hand-building rows.

use casparian_db::routing::ManifestRouting;
use casparian_db::CasparianDb;
use casparian_protocol::PluginStatus;
use casparian_security::signing::{compute_artifact_hash, sha256};

/// A manifest built by [`sample_manifest`], already inserted and promoted
/// to ACTIVE, with everything a dispatch test needs to assign a job.
pub struct SampleManifest {
    pub manifest_id: i64,
    pub publisher_id: i64,
    pub plugin_name: String,
    pub env_hash: String,
    pub source_hash: String,
    pub artifact_hash: String,
}

/// Insert a content-addressed environment row for `lockfile_content`,
/// returning its hash. Reuses an existing row if the lockfile is unchanged.
pub async fn sample_environment(db: &CasparianDb, lockfile_content: &str) -> String {
    let env_hash = sha256(lockfile_content.as_bytes());
    if db.get_environment(&env_hash).await.unwrap().is_none() {
        db.create_environment(&env_hash, lockfile_content, lockfile_content.len() as i64)
            .await
            .unwrap();
    }
    env_hash
}

/// Insert an ACTIVE manifest for `plugin_name`, its publisher, and a
/// matching environment, so callers can immediately exercise dispatch or
/// routing projection against it.
pub async fn sample_manifest(db: &CasparianDb, plugin_name: &str) -> SampleManifest {
    let source_code = format!("# sample plugin: {plugin_name}\n");
    let lockfile_content = "polars==1.0.0\n";
    let env_hash = sample_environment(db, lockfile_content).await;

    let source_hash = sha256(source_code.as_bytes());
    let artifact_hash = compute_artifact_hash(&source_code, lockfile_content, "{}", "{}");
    let signature = sha256(artifact_hash.as_bytes());

    let publisher_id = db
        .get_or_create_publisher("test-publisher", Some("test@example.com"), None)
        .await
        .unwrap();

    let manifest_id = db
        .insert_manifest(
            plugin_name,
            "1.0.0",
            &source_code,
            &source_hash,
            Some(&env_hash),
            &artifact_hash,
            &signature,
            Some(publisher_id),
            PluginStatus::Pending,
            None,
        )
        .await
        .unwrap();

    db.set_manifest_status(manifest_id, PluginStatus::Staging, None)
        .await
        .unwrap();
    db.promote_manifest(manifest_id).await.unwrap();

    db.project_routing(&ManifestRouting {
        plugin_name: plugin_name.to_string(),
        pattern: format!("*{plugin_name}*"),
        topic: "output".to_string(),
        sink_uri: format!("parquet://./{plugin_name}.parquet"),
    })
    .await
    .unwrap();

    SampleManifest {
        manifest_id,
        publisher_id,
        plugin_name: plugin_name.to_string(),
        env_hash,
        source_hash,
        artifact_hash,
    }
}
