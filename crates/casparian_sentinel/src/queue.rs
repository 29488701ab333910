//! Dispatch selection over the job queue: which idle worker gets the next
//! claimable job.
//!
//! [`casparian_db::queue`] already gives atomic, priority-ordered claiming
//! against a fixed capability set. What it can't see is the worker
//! registry, so this module adds the other half of spec's dispatch policy:
//! pick, among several idle workers, the one that has gone longest without
//! a dispatch, and only claim a job whose plugin lies in that worker's
//! capability set.

use casparian_db::error::Result;
use casparian_db::types::ProcessingJob;
use casparian_db::CasparianDb;

/// A worker eligible to receive the next dispatch: its identity frame, its
/// capability set, and the last time it was handed a job (`None` if never).
pub struct DispatchCandidate<'a> {
    pub identity: &'a [u8],
    pub capabilities: &'a [String],
    pub last_dispatched_at: Option<f64>,
}

/// One claimed job paired with the worker it should be sent to.
pub struct Dispatch {
    pub identity: Vec<u8>,
    pub job: ProcessingJob,
}

/// Try to claim one job for the idle worker pool.
///
/// First finds the single highest-priority QUEUED job whose plugin is in
/// the union of every idle candidate's capability set (a `"*"` capability
/// covers any plugin). If none exists, nothing is claimed. Otherwise, among
/// the candidates actually capable of running that job, the one that has
/// gone longest without a dispatch is chosen to receive it.
pub async fn claim_for_idle_workers(
    db: &CasparianDb,
    mut candidates: Vec<DispatchCandidate<'_>>,
) -> Result<Option<Dispatch>> {
    candidates.retain(|c| !c.capabilities.is_empty());
    if candidates.is_empty() {
        return Ok(None);
    }

    let union: Vec<String> = if candidates
        .iter()
        .any(|c| c.capabilities.iter().any(|cap| cap == "*"))
    {
        vec!["*".to_string()]
    } else {
        let mut seen = std::collections::HashSet::new();
        for c in &candidates {
            seen.extend(c.capabilities.iter().cloned());
        }
        seen.into_iter().collect()
    };

    let Some(job) = db.claim_job(&union).await? else {
        return Ok(None);
    };

    candidates.sort_by(|a, b| {
        a.last_dispatched_at
            .unwrap_or(f64::NEG_INFINITY)
            .partial_cmp(&b.last_dispatched_at.unwrap_or(f64::NEG_INFINITY))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let capable = candidates
        .into_iter()
        .find(|c| c.capabilities.iter().any(|cap| cap == "*" || cap == &job.plugin_name));

    Ok(capable.map(|candidate| Dispatch {
        identity: candidate.identity.to_vec(),
        job,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> CasparianDb {
        CasparianDb::connect("sqlite::memory:").await.unwrap()
    }

    async fn seed_job(db: &CasparianDb, plugin: &str, priority: i64) -> i64 {
        let root = db.register_source_root("/data").await.unwrap();
        let loc = db.upsert_file_location(root, "a.csv").await.unwrap();
        let version = db
            .insert_file_version(loc, "hash", 10, None, "")
            .await
            .unwrap();
        db.push_job(version, plugin, priority).await.unwrap()
    }

    #[tokio::test]
    async fn claims_from_least_recently_dispatched_capable_worker() {
        let db = memory_db().await;
        seed_job(&db, "csv_parser", 10).await;

        let candidates = vec![
            DispatchCandidate {
                identity: b"recent",
                capabilities: &["csv_parser".to_string()],
                last_dispatched_at: Some(100.0),
            },
            DispatchCandidate {
                identity: b"stale",
                capabilities: &["csv_parser".to_string()],
                last_dispatched_at: Some(1.0),
            },
        ];

        let dispatch = claim_for_idle_workers(&db, candidates)
            .await
            .unwrap()
            .expect("a job should be claimed");
        assert_eq!(dispatch.identity, b"stale");
    }

    #[tokio::test]
    async fn skips_workers_without_the_right_capability() {
        let db = memory_db().await;
        seed_job(&db, "csv_parser", 10).await;

        let candidates = vec![DispatchCandidate {
            identity: b"json-only",
            capabilities: &["json_parser".to_string()],
            last_dispatched_at: None,
        }];

        let dispatch = claim_for_idle_workers(&db, candidates).await.unwrap();
        assert!(dispatch.is_none(), "no capable worker, job should stay QUEUED");
    }

    #[tokio::test]
    async fn no_idle_workers_leaves_job_queued() {
        let db = memory_db().await;
        seed_job(&db, "csv_parser", 10).await;

        let dispatch = claim_for_idle_workers(&db, vec![]).await.unwrap();
        assert!(dispatch.is_none());
    }

    #[tokio::test]
    async fn prefers_highest_priority_job_across_the_capability_union() {
        let db = memory_db().await;
        seed_job(&db, "plugin_low", 1).await;
        seed_job(&db, "plugin_high", 100).await;

        // The worker capable of the low-priority job is the more stale of
        // the two, but the high-priority job must still win the claim.
        let candidates = vec![
            DispatchCandidate {
                identity: b"low-capable-stale",
                capabilities: &["plugin_low".to_string()],
                last_dispatched_at: Some(1.0),
            },
            DispatchCandidate {
                identity: b"high-capable-recent",
                capabilities: &["plugin_high".to_string()],
                last_dispatched_at: Some(100.0),
            },
        ];

        let dispatch = claim_for_idle_workers(&db, candidates)
            .await
            .unwrap()
            .expect("a job should be claimed");
        assert_eq!(dispatch.job.plugin_name, "plugin_high");
        assert_eq!(dispatch.identity, b"high-capable-recent");
    }

    #[tokio::test]
    async fn wildcard_capability_matches_any_plugin() {
        let db = memory_db().await;
        seed_job(&db, "csv_parser", 10).await;

        let candidates = vec![DispatchCandidate {
            identity: b"generic",
            capabilities: &["*".to_string()],
            last_dispatched_at: None,
        }];

        let dispatch = claim_for_idle_workers(&db, candidates)
            .await
            .unwrap()
            .expect("wildcard worker should claim any queued job");
        assert_eq!(dispatch.identity, b"generic");
    }
}
