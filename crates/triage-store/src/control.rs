use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use triage_core::{Entry, validate_entry};

use crate::{SqliteStore, StoreError, from_micros, to_micros};

/// Reads and writes of ingestion control records inside one atomic
/// transaction. Reads observe writes made earlier in the same transaction.
pub trait ControlTransaction {
    /// Reads the records for `build_ids`. Element `i` of the result is the
    /// record for `build_ids[i]`, or `None` if there is none. Duplicate IDs
    /// are rejected.
    fn read(&self, project: &str, build_ids: &[String]) -> Result<Vec<Option<Entry>>, StoreError>;

    /// Validates `entry` and upserts it keyed by `(project, build_id)`.
    /// `last_updated` is set to the commit time; `creation_time` is set on
    /// insert and preserved on update.
    fn insert_or_update(&mut self, entry: &Entry) -> Result<(), StoreError>;

    fn commit_time(&self) -> DateTime<Utc>;
}

/// A store that can run a read-modify-write over ingestion control records
/// atomically. Writers to the same build ID are serialized; if `f` fails
/// nothing it wrote is committed.
pub trait Transactor {
    fn read_then_write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut dyn ControlTransaction) -> Result<T, E>;

    /// Single-shot read outside of a caller-managed transaction.
    fn read(&self, project: &str, build_ids: &[String]) -> Result<Vec<Option<Entry>>, StoreError> {
        self.read_then_write(|tx| tx.read(project, build_ids))
    }
}

/// Read-only scans used for operational statistics.
pub trait ControlStatsSource {
    /// Presubmit records created at or after `since`, across all projects.
    fn presubmit_entries_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Entry>, StoreError>;
}

/// A build's `is_presubmit` flag is fixed by its first write.
pub(crate) fn ensure_presubmit_unchanged(
    stored: Option<bool>,
    entry: &Entry,
) -> Result<(), StoreError> {
    match stored {
        Some(is_presubmit) if is_presubmit != entry.is_presubmit => {
            Err(StoreError::Conflict(format!(
                "build {} has is_presubmit = {is_presubmit}, cannot change it to {}",
                entry.build_id, entry.is_presubmit
            )))
        }
        _ => Ok(()),
    }
}

pub(crate) fn ensure_unique(build_ids: &[String]) -> Result<(), StoreError> {
    let mut seen = HashSet::with_capacity(build_ids.len());
    for build_id in build_ids {
        if !seen.insert(build_id.as_str()) {
            return Err(StoreError::DuplicateBuildId(build_id.clone()));
        }
    }
    Ok(())
}

struct SqliteControlTransaction<'a> {
    conn: &'a Connection,
    commit_time: DateTime<Utc>,
}

struct RawEntry {
    project: String,
    build_id: String,
    build_result: Option<String>,
    is_presubmit: bool,
    presubmit_result: Option<String>,
    last_updated: i64,
    creation_time: i64,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project: row.get(0)?,
            build_id: row.get(1)?,
            build_result: row.get(2)?,
            is_presubmit: row.get(3)?,
            presubmit_result: row.get(4)?,
            last_updated: row.get(5)?,
            creation_time: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<Entry, StoreError> {
        let build_result = self
            .build_result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let presubmit_result = self
            .presubmit_result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Entry {
            project: self.project,
            build_id: self.build_id,
            build_result,
            is_presubmit: self.is_presubmit,
            presubmit_result,
            last_updated: Some(from_micros(self.last_updated)?),
            creation_time: Some(from_micros(self.creation_time)?),
        })
    }
}

const ENTRY_COLUMNS: &str = "project, build_id, build_result, is_presubmit, presubmit_result, \
                             last_updated, creation_time";

impl ControlTransaction for SqliteControlTransaction<'_> {
    fn read(&self, project: &str, build_ids: &[String]) -> Result<Vec<Option<Entry>>, StoreError> {
        ensure_unique(build_ids)?;

        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ingestion_control WHERE project = ?1 AND build_id = ?2"
        ))?;

        let mut entries = Vec::with_capacity(build_ids.len());
        for build_id in build_ids {
            let raw = stmt
                .query_row(params![project, build_id], RawEntry::from_row)
                .optional()?;
            entries.push(raw.map(RawEntry::into_entry).transpose()?);
        }
        Ok(entries)
    }

    fn insert_or_update(&mut self, entry: &Entry) -> Result<(), StoreError> {
        validate_entry(entry)?;
        let stored: Option<bool> = self
            .conn
            .query_row(
                "SELECT is_presubmit FROM ingestion_control WHERE project = ?1 AND build_id = ?2",
                params![entry.project, entry.build_id],
                |row| row.get(0),
            )
            .optional()?;
        ensure_presubmit_unchanged(stored, entry)?;

        let build_result = entry
            .build_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let presubmit_result = entry
            .presubmit_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let commit_time = to_micros(self.commit_time);

        self.conn.execute(
            r#"
            INSERT INTO ingestion_control (
                project, build_id, build_result, is_presubmit, presubmit_result,
                last_updated, creation_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(project, build_id) DO UPDATE SET
                build_result = excluded.build_result,
                presubmit_result = excluded.presubmit_result,
                last_updated = excluded.last_updated
            "#,
            params![
                entry.project,
                entry.build_id,
                build_result,
                entry.is_presubmit,
                presubmit_result,
                commit_time,
            ],
        )?;

        Ok(())
    }

    fn commit_time(&self) -> DateTime<Utc> {
        self.commit_time
    }
}

impl Transactor for SqliteStore {
    fn read_then_write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut dyn ControlTransaction) -> Result<T, E>,
    {
        let mut conn = self.connection()?;
        // IMMEDIATE takes the write lock up front so a concurrent writer
        // cannot commit between our read and our write.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let value = {
            let mut control = SqliteControlTransaction {
                conn: &tx,
                commit_time: self.now(),
            };
            f(&mut control)?
        };

        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }
}

impl ControlStatsSource for SqliteStore {
    fn presubmit_entries_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Entry>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ingestion_control
            WHERE is_presubmit = 1 AND creation_time >= ?1
            ORDER BY project, build_id
            "#
        ))?;

        let rows = stmt.query_map(params![to_micros(since)], RawEntry::from_row)?;
        let raw = rows.collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawEntry::into_entry).collect()
    }
}
