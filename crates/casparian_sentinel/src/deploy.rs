//! The five-stage artifact deployment pipeline: ingest, gate, verify
//! signature, provision environment, promote.
//!
//! Each stage can reject the artifact; a rejection is a successful pipeline
//! run that persists a `REJECTED` manifest row and reports failure in the
//! [`DeployResponse`], not an `Err`. `Err` is reserved for infrastructure
//! failure (a database error, a broken environment provisioner).

use casparian_db::error::{DbError, Result as DbResult};
use casparian_db::routing::ManifestRouting;
use casparian_db::CasparianDb;
use casparian_protocol::types::{DeployCommand, DeployResponse};
use casparian_protocol::PluginStatus;
use casparian_security::gatekeeper::{extract_manifest, Gatekeeper, ManifestValue};
use casparian_security::signing::{compute_artifact_hash, sha256, IdentityProvider};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("environment provisioning failed: {0}")]
    Provisioning(#[source] anyhow::Error),
}

/// Hook for materializing a content-addressed execution environment.
///
/// Implemented in production by something that shells out to the
/// environment builder (uv/venv) the way `casparian_worker`'s
/// `VenvManager` does for eager `PREPARE_ENV` requests; the pipeline
/// itself only needs the resulting on-disk size to track against the
/// byte budget, so it's abstracted behind this trait rather than linked
/// directly against worker internals.
pub trait EnvironmentProvisioner {
    fn materialize(&self, env_hash: &str, lockfile_content: &str) -> anyhow::Result<i64>;
}

/// A provisioner that assumes the environment is materialized lazily by a
/// worker on first dispatch; the pipeline only records the lockfile and a
/// zero size until that happens.
pub struct LazyProvisioner;

impl EnvironmentProvisioner for LazyProvisioner {
    fn materialize(&self, _env_hash: &str, _lockfile_content: &str) -> anyhow::Result<i64> {
        Ok(0)
    }
}

/// Evict least-recently-used environments until total size drops below 80%
/// of `byte_bound`. Never evicts an environment referenced by a RUNNING job.
pub async fn evict_environments(db: &CasparianDb, byte_bound: i64) -> DbResult<()> {
    let envs = db.environments_by_last_used().await?;
    let total: i64 = envs.iter().map(|e| e.size_bytes).sum();
    if total < byte_bound {
        return Ok(());
    }

    let in_use = db.env_hashes_in_use().await?;
    let target = (byte_bound as f64 * 0.8) as i64;
    let mut remaining = total;
    for env in envs {
        if remaining < target {
            break;
        }
        if in_use.contains(&env.env_hash) {
            continue;
        }
        db.delete_environment(&env.env_hash).await?;
        remaining -= env.size_bytes;
    }
    Ok(())
}

async fn reject(
    db: &CasparianDb,
    cmd: &DeployCommand,
    publisher_id: Option<i64>,
    source_hash: &str,
    reason: String,
) -> DbResult<DeployResponse> {
    let manifest_id = db
        .insert_manifest(
            &cmd.plugin_name,
            &cmd.version,
            &cmd.source_code,
            source_hash,
            None,
            &cmd.artifact_hash,
            &cmd.signature,
            publisher_id,
            PluginStatus::Rejected,
            Some(&reason),
        )
        .await?;
    Ok(DeployResponse {
        success: false,
        message: reason,
        manifest_id: Some(manifest_id),
    })
}

/// Run the full pipeline for one `DEPLOY` command.
pub async fn deploy_artifact(
    db: &CasparianDb,
    identity: &dyn IdentityProvider,
    provisioner: &dyn EnvironmentProvisioner,
    env_byte_bound: i64,
    cmd: &DeployCommand,
) -> Result<DeployResponse, DeployError> {
    // Stage 1: ingest. Hash checks are pure and need no persisted state on
    // failure: a resubmission with corrected bytes just recomputes cleanly.
    let computed_artifact_hash = compute_artifact_hash(&cmd.source_code, &cmd.lockfile_content, "", "");
    if computed_artifact_hash != cmd.artifact_hash {
        return Ok(DeployResponse {
            success: false,
            message: format!(
                "artifact hash mismatch: expected {}, computed {}",
                cmd.artifact_hash, computed_artifact_hash
            ),
            manifest_id: None,
        });
    }

    let source_hash = sha256(cmd.source_code.as_bytes());
    if db.source_hash_exists(&source_hash).await? {
        return Ok(DeployResponse {
            success: false,
            message: "an artifact with this exact source already exists".to_string(),
            manifest_id: None,
        });
    }

    let publisher_id = Some(
        db.get_or_create_publisher(
            &cmd.publisher_name,
            cmd.publisher_email.as_deref(),
            cmd.external_identity_oid.as_deref(),
        )
        .await?,
    );

    // Stage 2: gate. Static analysis only; the source is never executed.
    let gatekeeper = Gatekeeper::new();
    let report = match gatekeeper.analyze(&cmd.source_code) {
        Ok(report) => report,
        Err(e) => {
            return Ok(reject(db, cmd, publisher_id, &source_hash, e.to_string()).await?);
        }
    };
    if !report.errors.is_empty() {
        let reason = report.errors.join("; ");
        return Ok(reject(db, cmd, publisher_id, &source_hash, reason).await?);
    }

    let manifest_spec = match extract_manifest(&cmd.source_code) {
        Ok(spec) => spec,
        Err(e) => {
            return Ok(reject(db, cmd, publisher_id, &source_hash, e.to_string()).await?);
        }
    };
    let Some(pattern) = manifest_spec.pattern().map(str::to_string) else {
        return Ok(reject(
            db,
            cmd,
            publisher_id,
            &source_hash,
            "MANIFEST is missing required field 'pattern'".to_string(),
        )
        .await?);
    };
    let Some(topic) = manifest_spec.topic().map(str::to_string) else {
        return Ok(reject(
            db,
            cmd,
            publisher_id,
            &source_hash,
            "MANIFEST is missing required field 'topic'".to_string(),
        )
        .await?);
    };
    let sink_uri = manifest_spec
        .fields
        .get("sink_uri")
        .and_then(ManifestValue::as_str)
        .unwrap_or(casparian_protocol::defaults::DEFAULT_SINK_URI)
        .to_string();

    // Stage 3: signature verification.
    match identity.verify(&cmd.artifact_hash, &cmd.signature) {
        Ok(true) => {}
        Ok(false) => {
            return Ok(reject(
                db,
                cmd,
                publisher_id,
                &source_hash,
                "signature does not match artifact_hash".to_string(),
            )
            .await?);
        }
        Err(e) => {
            return Ok(reject(db, cmd, publisher_id, &source_hash, e.to_string()).await?);
        }
    }

    // Stage 4: environment provisioning, content-addressed by the lockfile.
    let env_hash = if cmd.lockfile_content.trim().is_empty() {
        None
    } else {
        let hash = sha256(cmd.lockfile_content.as_bytes());
        match db.get_environment(&hash).await? {
            Some(_) => {
                db.touch_environment(&hash).await?;
            }
            None => {
                let size_bytes = provisioner
                    .materialize(&hash, &cmd.lockfile_content)
                    .map_err(DeployError::Provisioning)?;
                db.create_environment(&hash, &cmd.lockfile_content, size_bytes)
                    .await?;
                evict_environments(db, env_byte_bound).await?;
            }
        }
        Some(hash)
    };

    // Stage 5: promote. Insert STAGING, then promote to ACTIVE and project
    // routing; a sandbox probe between the two is a Non-goal here (no guest
    // runtime is available on the broker side to run one against).
    let manifest_id = db
        .insert_manifest(
            &cmd.plugin_name,
            &cmd.version,
            &cmd.source_code,
            &source_hash,
            env_hash.as_deref(),
            &cmd.artifact_hash,
            &cmd.signature,
            publisher_id,
            PluginStatus::Staging,
            None,
        )
        .await?;
    db.promote_manifest(manifest_id).await?;
    db.project_routing(&ManifestRouting {
        plugin_name: cmd.plugin_name.clone(),
        pattern,
        topic,
        sink_uri,
    })
    .await?;

    Ok(DeployResponse {
        success: true,
        message: format!("{} v{} is now ACTIVE", cmd.plugin_name, cmd.version),
        manifest_id: Some(manifest_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use casparian_security::signing::LocalIdentity;

    fn sample_source() -> &'static str {
        r#"
MANIFEST = PluginManifest(
    pattern="*.csv",
    topic="sales",
    subscriptions=["auto_csv_parser"],
)

class Handler:
    def execute(self, file_path):
        return None
"#
    }

    fn signed_command(identity: &LocalIdentity, source: &str, lockfile: &str) -> DeployCommand {
        let artifact_hash = compute_artifact_hash(source, lockfile, "", "");
        let signed = identity.sign(&artifact_hash).unwrap();
        DeployCommand {
            plugin_name: "csv_parser".to_string(),
            version: "1.0.0".to_string(),
            source_code: source.to_string(),
            lockfile_content: lockfile.to_string(),
            artifact_hash,
            signature: signed.signature,
            publisher_name: "alice".to_string(),
            publisher_email: None,
            external_identity_oid: None,
        }
    }

    async fn memory_db() -> CasparianDb {
        CasparianDb::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn happy_path_activates_and_projects_routing() {
        let db = memory_db().await;
        let identity = LocalIdentity::new(b"shared-secret".to_vec(), "alice");
        let cmd = signed_command(&identity, sample_source(), "requests==2.0");

        let response = deploy_artifact(&db, &identity, &LazyProvisioner, 1_000_000, &cmd)
            .await
            .unwrap();

        assert!(response.success, "{}", response.message);
        let manifest = db.get_manifest(response.manifest_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(PluginStatus::from(manifest.status), PluginStatus::Active);

        let rules = db.routing_rules_by_priority().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pattern, "*.csv");
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let db = memory_db().await;
        let identity = LocalIdentity::new(b"shared-secret".to_vec(), "alice");
        let mut cmd = signed_command(&identity, sample_source(), "requests==2.0");
        cmd.signature = "00".repeat(32);

        let response = deploy_artifact(&db, &identity, &LazyProvisioner, 1_000_000, &cmd)
            .await
            .unwrap();

        assert!(!response.success);
        let manifest = db.get_manifest(response.manifest_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(PluginStatus::from(manifest.status), PluginStatus::Rejected);
    }

    #[tokio::test]
    async fn banned_import_is_rejected_before_signature_check() {
        let db = memory_db().await;
        let identity = LocalIdentity::new(b"shared-secret".to_vec(), "alice");
        let source = "import os\nMANIFEST = PluginManifest(pattern=\"*.csv\", topic=\"t\")\n";
        let cmd = signed_command(&identity, source, "");

        let response = deploy_artifact(&db, &identity, &LazyProvisioner, 1_000_000, &cmd)
            .await
            .unwrap();

        assert!(!response.success);
        assert!(response.message.contains("os") || response.message.to_lowercase().contains("import"));
    }

    #[tokio::test]
    async fn duplicate_source_hash_is_rejected() {
        let db = memory_db().await;
        let identity = LocalIdentity::new(b"shared-secret".to_vec(), "alice");
        let cmd = signed_command(&identity, sample_source(), "requests==2.0");

        let first = deploy_artifact(&db, &identity, &LazyProvisioner, 1_000_000, &cmd)
            .await
            .unwrap();
        assert!(first.success);

        let mut second_cmd = cmd.clone();
        second_cmd.version = "1.0.1".to_string();
        let second = deploy_artifact(&db, &identity, &LazyProvisioner, 1_000_000, &second_cmd)
            .await
            .unwrap();
        assert!(!second.success);
        assert!(second.message.contains("already exists"));
    }
}
