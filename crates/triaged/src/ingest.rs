use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use triage_clustering::{AlgorithmRegistry, cluster};
use triage_core::{ClusterResults, Entry, Failure};
use triage_rules::RulesCache;
use triage_store::{ClusteringStateEntry, ClusteringStateStore, StoreError, Transactor};

/// What ingesting one build's failures wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub build_id: String,
    pub failures: usize,
    /// Chunks created by this call.
    pub created_chunks: Vec<String>,
    /// Chunks that already existed, e.g. from an earlier attempt.
    pub existing_chunks: Vec<String>,
}

/// The ID of the `index`th chunk of a build. Deterministic, so retrying an
/// ingestion finds the chunks it already wrote.
pub fn chunk_id(project: &str, build_id: &str, index: usize) -> String {
    let digest = Sha256::digest(format!("{project}/{build_id}/{index}").as_bytes());
    hex::encode(&digest[..16])
}

/// Splits `failures` into chunks of at most `chunk_size`, clusters each from
/// scratch against the current ruleset and stores the result.
#[allow(clippy::too_many_arguments)]
pub fn ingest_failures(
    store: &impl ClusteringStateStore,
    registry: &AlgorithmRegistry,
    rules: &RulesCache,
    project: &str,
    build_id: &str,
    partition_time: DateTime<Utc>,
    failures: Vec<Failure>,
    chunk_size: usize,
) -> Result<IngestSummary> {
    if chunk_size == 0 {
        bail!("chunk size must be positive");
    }

    let ruleset = rules
        .ruleset(project, None)
        .with_context(|| format!("failed to load rules of project {project}"))?;

    let mut summary = IngestSummary {
        build_id: build_id.to_owned(),
        failures: failures.len(),
        ..IngestSummary::default()
    };

    for (index, chunk) in failures.chunks(chunk_size).enumerate() {
        let clustering = cluster(registry, &ruleset, &ClusterResults::default(), chunk);
        let entry = ClusteringStateEntry {
            project: project.to_owned(),
            chunk_id: chunk_id(project, build_id, index),
            partition_time,
            failures: chunk.to_vec(),
            clustering,
            last_updated: None,
        };

        match store.create_state(&entry) {
            Ok(created) => {
                tracing::debug!(
                    project,
                    build_id,
                    chunk_id = %created.chunk_id,
                    failures = created.failures.len(),
                    "stored clustering chunk"
                );
                summary.created_chunks.push(created.chunk_id);
            }
            Err(StoreError::Conflict(_)) => {
                tracing::warn!(
                    project,
                    build_id,
                    chunk_id = %entry.chunk_id,
                    "chunk already ingested, skipping"
                );
                summary.existing_chunks.push(entry.chunk_id);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to store chunk {} of build {build_id}", index));
            }
        }
    }

    tracing::info!(
        project,
        build_id,
        failures = summary.failures,
        created = summary.created_chunks.len(),
        existing = summary.existing_chunks.len(),
        "ingested build failures"
    );
    Ok(summary)
}

/// Ingests the failures of a build whose control record is ready. The
/// partition time is the build's creation time.
pub fn ingest_ready_build<S>(
    store: &S,
    registry: &AlgorithmRegistry,
    rules: &RulesCache,
    project: &str,
    build_id: &str,
    failures: Vec<Failure>,
    chunk_size: usize,
) -> Result<IngestSummary>
where
    S: Transactor + ClusteringStateStore,
{
    let entry = store
        .read(project, &[build_id.to_owned()])
        .with_context(|| format!("failed to read control record of build {build_id}"))?
        .pop()
        .flatten();
    let Some(entry) = entry else {
        bail!("build {build_id} has no control record in project {project}");
    };
    if !entry.is_ready() {
        bail!("build {build_id} is not ready for ingestion: {}", pending_reason(&entry));
    }

    let partition_time = entry
        .build_result
        .as_ref()
        .and_then(|result| result.creation_time)
        .or(entry.creation_time)
        .unwrap_or_else(Utc::now);
    ingest_failures(
        store,
        registry,
        rules,
        project,
        build_id,
        partition_time,
        failures,
        chunk_size,
    )
}

fn pending_reason(entry: &Entry) -> &'static str {
    if entry.awaiting_build_result() {
        "awaiting build result"
    } else {
        "awaiting presubmit result"
    }
}
