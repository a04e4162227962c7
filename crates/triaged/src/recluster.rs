use anyhow::{Context, Result, bail};
use serde::Serialize;
use triage_clustering::{AlgorithmRegistry, cluster};
use triage_rules::RulesCache;
use triage_store::{ClusteringStateStore, StaleChunkQuery, StoreError};

pub const DEFAULT_RECLUSTER_BATCH_SIZE: usize = 100;

/// Counts from one pass over the stale chunks of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclusterSummary {
    pub project: String,
    pub algorithms_version: i64,
    pub rules_version: String,
    /// Stale chunks visited.
    pub scanned: usize,
    /// Chunks whose clustering was rewritten.
    pub updated: usize,
    /// Chunks whose clustering was already current.
    pub unchanged: usize,
    /// Chunks clustered by a newer algorithms version, left as they are.
    pub newer_algorithms: usize,
    /// Chunks written concurrently by someone else; retried on the next pass.
    pub conflicts: usize,
}

/// Brings every stale chunk of `project` up to date with `registry` and the
/// project's current rules. Chunks are visited in chunk ID order,
/// `batch_size` at a time.
pub fn recluster_project(
    store: &impl ClusteringStateStore,
    registry: &AlgorithmRegistry,
    rules: &RulesCache,
    project: &str,
    batch_size: usize,
) -> Result<ReclusterSummary> {
    if batch_size == 0 {
        bail!("batch size must be positive");
    }

    let ruleset = rules
        .ruleset(project, None)
        .with_context(|| format!("failed to load rules of project {project}"))?;
    let mut summary = ReclusterSummary {
        project: project.to_owned(),
        algorithms_version: registry.algorithms_version(),
        rules_version: ruleset.version().to_rfc3339(),
        ..ReclusterSummary::default()
    };

    let mut query = StaleChunkQuery {
        project: project.to_owned(),
        after_chunk_id: String::new(),
        algorithms_version: registry.algorithms_version(),
        rules_version: ruleset.version(),
        limit: batch_size,
    };

    loop {
        let page = store
            .read_next_stale(&query)
            .with_context(|| format!("failed to read stale chunks of project {project}"))?;
        let exhausted = page.len() < batch_size;

        for entry in &page {
            summary.scanned += 1;
            if entry.clustering.algorithms_version > registry.algorithms_version() {
                summary.newer_algorithms += 1;
                continue;
            }

            let updated = cluster(registry, &ruleset, &entry.clustering, &entry.failures);
            if updated == entry.clustering {
                summary.unchanged += 1;
                continue;
            }

            match store.update_clustering(entry, &updated) {
                Ok(_) => summary.updated += 1,
                Err(StoreError::Conflict(message)) => {
                    tracing::warn!(
                        project,
                        chunk_id = %entry.chunk_id,
                        %message,
                        "chunk changed while re-clustering, skipping"
                    );
                    summary.conflicts += 1;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to update clustering of chunk {}", entry.chunk_id)
                    });
                }
            }
        }

        match page.last() {
            Some(last) if !exhausted => query.after_chunk_id = last.chunk_id.clone(),
            _ => break,
        }
    }

    tracing::info!(
        project,
        scanned = summary.scanned,
        updated = summary.updated,
        unchanged = summary.unchanged,
        newer_algorithms = summary.newer_algorithms,
        conflicts = summary.conflicts,
        "re-clustering pass complete"
    );
    Ok(summary)
}
