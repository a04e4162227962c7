use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use triage_core::{ClusterId, ClusterResults, Failure, is_valid_chunk_id, is_valid_project};

use crate::{SqliteStore, StoreError, from_micros, to_micros};

/// Upper bound of the chunk ID keyspace. `read_next_stale` never returns a
/// chunk after it.
pub const END_OF_TABLE: &str = "ffffffffffffffffffffffffffffffff";

/// The failures of one chunk and how they are currently clustered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringStateEntry {
    pub project: String,
    /// 32 lowercase hexadecimal characters.
    pub chunk_id: String,
    pub partition_time: DateTime<Utc>,
    pub failures: Vec<Failure>,
    pub clustering: ClusterResults,
    /// Commit time of the last write. Output only.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Selects chunks clustered with an older algorithms version or an older
/// rules version than the given ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleChunkQuery {
    pub project: String,
    /// Exclusive lower bound on the chunk ID. Empty to start from the
    /// beginning.
    pub after_chunk_id: String,
    pub algorithms_version: i64,
    pub rules_version: DateTime<Utc>,
    pub limit: usize,
}

pub trait ClusteringStateStore {
    /// Creates a new entry. Fails if the chunk already exists.
    fn create_state(&self, entry: &ClusteringStateEntry) -> Result<ClusteringStateEntry, StoreError>;

    /// Replaces the clustering of `previous` with `clustering`, provided the
    /// stored entry has not been written since `previous` was read.
    fn update_clustering(
        &self,
        previous: &ClusteringStateEntry,
        clustering: &ClusterResults,
    ) -> Result<ClusteringStateEntry, StoreError>;

    fn read_state(
        &self,
        project: &str,
        chunk_id: &str,
    ) -> Result<Option<ClusteringStateEntry>, StoreError>;

    /// Stale chunks in chunk ID order, at most `query.limit` of them.
    fn read_next_stale(
        &self,
        query: &StaleChunkQuery,
    ) -> Result<Vec<ClusteringStateEntry>, StoreError>;
}

fn validate_clustering(failures: usize, clustering: &ClusterResults) -> Result<(), StoreError> {
    clustering
        .validate()
        .map_err(|err| StoreError::InvalidInput(format!("clustering: {err}")))?;
    if clustering.clusters.len() != failures {
        return Err(StoreError::InvalidInput(format!(
            "clustering: {} cluster lists for {failures} failures",
            clustering.clusters.len()
        )));
    }
    Ok(())
}

fn validate_state(entry: &ClusteringStateEntry) -> Result<(), StoreError> {
    if !is_valid_project(&entry.project) {
        return Err(StoreError::InvalidInput("project must be valid".to_owned()));
    }
    if !is_valid_chunk_id(&entry.chunk_id) {
        return Err(StoreError::InvalidInput(
            "chunk ID must be 32 lowercase hexadecimal characters".to_owned(),
        ));
    }
    validate_clustering(entry.failures.len(), &entry.clustering)
}

/// Cluster lists and the algorithm names are stored together as one JSON
/// document; the versions get their own columns so staleness is queryable.
#[derive(Serialize, Deserialize)]
struct StoredClusters {
    algorithms: Vec<String>,
    clusters: Vec<Vec<ClusterId>>,
}

fn encode_clusters(clustering: &ClusterResults) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&StoredClusters {
        algorithms: clustering.algorithms.iter().cloned().collect(),
        clusters: clustering.clusters.clone(),
    })?)
}

const STATE_COLUMNS: &str = "project, chunk_id, partition_time, failures, algorithms_version, \
                             rules_version, clusters, last_updated";

struct RawState {
    project: String,
    chunk_id: String,
    partition_time: i64,
    failures: String,
    algorithms_version: i64,
    rules_version: Option<i64>,
    clusters: String,
    last_updated: i64,
}

impl RawState {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project: row.get(0)?,
            chunk_id: row.get(1)?,
            partition_time: row.get(2)?,
            failures: row.get(3)?,
            algorithms_version: row.get(4)?,
            rules_version: row.get(5)?,
            clusters: row.get(6)?,
            last_updated: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<ClusteringStateEntry, StoreError> {
        let stored: StoredClusters = serde_json::from_str(&self.clusters)?;
        let rules_version = self.rules_version.map(from_micros).transpose()?;
        Ok(ClusteringStateEntry {
            project: self.project,
            chunk_id: self.chunk_id,
            partition_time: from_micros(self.partition_time)?,
            failures: serde_json::from_str(&self.failures)?,
            clustering: ClusterResults {
                algorithms_version: self.algorithms_version,
                rules_version,
                algorithms: stored.algorithms.into_iter().collect(),
                clusters: stored.clusters,
            },
            last_updated: Some(from_micros(self.last_updated)?),
        })
    }
}

fn read_state_row(
    conn: &rusqlite::Connection,
    project: &str,
    chunk_id: &str,
) -> Result<Option<ClusteringStateEntry>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {STATE_COLUMNS} FROM clustering_state WHERE project = ?1 AND chunk_id = ?2"),
            params![project, chunk_id],
            RawState::from_row,
        )
        .optional()?;
    raw.map(RawState::into_entry).transpose()
}

impl ClusteringStateStore for SqliteStore {
    fn create_state(&self, entry: &ClusteringStateEntry) -> Result<ClusteringStateEntry, StoreError> {
        validate_state(entry)?;

        let failures = serde_json::to_string(&entry.failures)?;
        let clusters = encode_clusters(&entry.clustering)?;
        let last_updated = self.now();

        let conn = self.connection()?;
        let inserted = conn.execute(
            r#"
            INSERT INTO clustering_state (
                project, chunk_id, partition_time, failures, algorithms_version,
                rules_version, clusters, last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(project, chunk_id) DO NOTHING
            "#,
            params![
                entry.project,
                entry.chunk_id,
                to_micros(entry.partition_time),
                failures,
                entry.clustering.algorithms_version,
                entry.clustering.rules_version.map(to_micros),
                clusters,
                to_micros(last_updated),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "chunk {}/{} already exists",
                entry.project, entry.chunk_id
            )));
        }

        let mut created = entry.clone();
        created.last_updated = Some(last_updated);
        Ok(created)
    }

    fn update_clustering(
        &self,
        previous: &ClusteringStateEntry,
        clustering: &ClusterResults,
    ) -> Result<ClusteringStateEntry, StoreError> {
        validate_clustering(previous.failures.len(), clustering)?;
        let Some(previous_update) = previous.last_updated else {
            return Err(StoreError::InvalidInput(
                "previous entry must have been read from the store".to_owned(),
            ));
        };

        let clusters = encode_clusters(clustering)?;
        // Every write must move last_updated forward, or a concurrent writer
        // in the same clock tick would pass the check below.
        let last_updated = self.now().max(previous_update + Duration::microseconds(1));

        let conn = self.connection()?;
        let updated = conn.execute(
            r#"
            UPDATE clustering_state
            SET algorithms_version = ?1, rules_version = ?2, clusters = ?3, last_updated = ?4
            WHERE project = ?5 AND chunk_id = ?6 AND last_updated = ?7
            "#,
            params![
                clustering.algorithms_version,
                clustering.rules_version.map(to_micros),
                clusters,
                to_micros(last_updated),
                previous.project,
                previous.chunk_id,
                to_micros(previous_update),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::Conflict(format!(
                "chunk {}/{} was modified or removed since it was read",
                previous.project, previous.chunk_id
            )));
        }

        let mut entry = previous.clone();
        entry.clustering = clustering.clone();
        entry.last_updated = Some(last_updated);
        Ok(entry)
    }

    fn read_state(
        &self,
        project: &str,
        chunk_id: &str,
    ) -> Result<Option<ClusteringStateEntry>, StoreError> {
        let conn = self.connection()?;
        read_state_row(&conn, project, chunk_id)
    }

    fn read_next_stale(
        &self,
        query: &StaleChunkQuery,
    ) -> Result<Vec<ClusteringStateEntry>, StoreError> {
        let limit = i64::try_from(query.limit)
            .map_err(|_| StoreError::InvalidInput("limit out of range".to_owned()))?;

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {STATE_COLUMNS}
            FROM clustering_state
            WHERE project = ?1
              AND chunk_id > ?2
              AND chunk_id <= ?3
              AND (
                algorithms_version < ?4
                OR rules_version IS NULL
                OR rules_version < ?5
              )
            ORDER BY chunk_id
            LIMIT ?6
            "#
        ))?;
        let rows = stmt.query_map(
            params![
                query.project,
                query.after_chunk_id,
                END_OF_TABLE,
                query.algorithms_version,
                to_micros(query.rules_version),
                limit,
            ],
            RawState::from_row,
        )?;
        let raw = rows.collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawState::into_entry).collect()
    }
}
