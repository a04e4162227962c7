use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;
use triage_core::{Clock, SystemClock, ValidationError};

mod control;
mod memory;
mod rules;
mod state;

pub use control::{ControlStatsSource, ControlTransaction, Transactor};
pub use memory::MemoryControlStore;
pub use rules::RuleStore;
pub use state::{ClusteringStateEntry, ClusteringStateStore, END_OF_TABLE, StaleChunkQuery};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("duplicate build ID {0}")]
    DuplicateBuildId(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// SQLite-backed store for ingestion control records, failure association
/// rules and clustering state.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

pub(crate) fn to_micros(value: DateTime<Utc>) -> i64 {
    value.timestamp_micros()
}

pub(crate) fn from_micros(value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {value} out of range")))
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_control (
            project TEXT NOT NULL,
            build_id TEXT NOT NULL,
            build_result TEXT,
            is_presubmit INTEGER NOT NULL DEFAULT 0,
            presubmit_result TEXT,
            last_updated INTEGER NOT NULL,
            creation_time INTEGER NOT NULL,
            PRIMARY KEY (project, build_id)
        );

        CREATE INDEX IF NOT EXISTS ingestion_control_by_is_presubmit
            ON ingestion_control (is_presubmit, creation_time);

        CREATE TABLE IF NOT EXISTS failure_association_rules (
            project TEXT NOT NULL,
            rule_id TEXT NOT NULL,
            definition TEXT NOT NULL,
            is_active INTEGER NOT NULL,
            creation_time INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            source_cluster_algorithm TEXT,
            source_cluster_id TEXT,
            PRIMARY KEY (project, rule_id)
        );

        CREATE INDEX IF NOT EXISTS failure_association_rules_by_last_updated
            ON failure_association_rules (project, last_updated);

        CREATE TABLE IF NOT EXISTS clustering_state (
            project TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            partition_time INTEGER NOT NULL,
            failures TEXT NOT NULL,
            algorithms_version INTEGER NOT NULL,
            rules_version INTEGER,
            clusters TEXT NOT NULL,
            last_updated INTEGER NOT NULL,
            PRIMARY KEY (project, chunk_id)
        );
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn open_creates_database_and_is_reopenable() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join(".triage").join("triage.sqlite");

        let store = SqliteStore::open(&path).expect("open store");
        assert!(path.exists());
        assert_eq!(store.path(), path.as_path());
        drop(store);

        SqliteStore::open(&path).expect("reopen store");
    }

    #[test]
    fn micros_round_trip() {
        let now = Utc::now();
        let back = from_micros(to_micros(now)).expect("in range");
        assert_eq!(back.timestamp_micros(), now.timestamp_micros());
    }
}
