//! SQLite run journal.
//!
//! Records every run with two tables:
//! - runs: date, mode, store, counts, duration
//! - failures: run_id, kind, instance, target, message
//!
//! Audit trail only. Planning never reads it: every run is computed from a
//! fresh enumeration of the images that actually exist.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;

use crate::platform;
use crate::run::{RunMode, RunReport};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("could not determine data directory")]
    NoDataDir,

    #[error("failed to create {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Run metadata stored in database
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: i64,
    pub run_date: String,
    pub mode: String,
    pub store: String,
    pub instances: u64,
    pub created: u64,
    pub deleted: u64,
    pub failures: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub kind: String,
    pub entity: String,
    pub target: String,
    pub message: String,
}

/// ~/.local/share/ami-keeper/history.db or platform equivalent
fn db_path() -> Result<PathBuf, HistoryError> {
    let data_dir = platform::data_dir().ok_or(HistoryError::NoDataDir)?;
    std::fs::create_dir_all(&data_dir).map_err(|source| HistoryError::Io {
        path: data_dir.display().to_string(),
        source,
    })?;
    Ok(data_dir.join("history.db"))
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at INTEGER NOT NULL,
            run_date TEXT NOT NULL,
            mode TEXT NOT NULL,
            store TEXT NOT NULL,
            instances INTEGER NOT NULL,
            created INTEGER NOT NULL,
            deleted INTEGER NOT NULL,
            failures INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS failures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            entity TEXT NOT NULL,
            target TEXT NOT NULL,
            message TEXT NOT NULL,
            FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_failures_run_id ON failures(run_id)",
        [],
    )?;

    Ok(())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn mode_str(mode: RunMode) -> &'static str {
    match mode {
        RunMode::DryRun => "dry-run",
        RunMode::Execute => "execute",
    }
}

/// Database handle. Open once per command, reuse across all operations.
pub struct History {
    conn: Connection,
}

impl History {
    pub fn open() -> Result<Self, HistoryError> {
        History::open_at(&db_path()?)
    }

    pub fn open_at(path: &Path) -> Result<Self, HistoryError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(History { conn })
    }

    pub fn record(&mut self, report: &RunReport) -> Result<i64, HistoryError> {
        let started_at = chrono::Utc::now().timestamp();
        let failures: Vec<_> = report.failures().collect();

        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO runs (started_at, run_date, mode, store, instances, created, deleted, failures, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                started_at,
                report.today.to_string(),
                mode_str(report.mode),
                report.store,
                to_i64(report.entities.len() as u64),
                to_i64(report.created_count() as u64),
                to_i64(report.deleted_count() as u64),
                to_i64(failures.len() as u64),
                to_i64(report.duration_ms),
            ],
        )?;

        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO failures (run_id, kind, entity, target, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for failure in failures {
                stmt.execute(params![
                    run_id,
                    failure.kind.as_str(),
                    failure.entity,
                    failure.target,
                    failure.message
                ])?;
            }
        }

        tx.commit()?;
        Ok(run_id)
    }

    /// All runs, newest first
    pub fn list_runs(&self) -> Result<Vec<RunRecord>, HistoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, run_date, mode, store, instances, created, deleted, failures, duration_ms
             FROM runs
             ORDER BY id DESC",
        )?;

        let runs = stmt
            .query_map([], row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    pub fn get_run(&self, id: i64) -> Result<Option<RunRecord>, HistoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, run_date, mode, store, instances, created, deleted, failures, duration_ms
             FROM runs
             WHERE id = ?1",
        )?;

        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_run(row)?)),
            None => Ok(None),
        }
    }

    pub fn load_failures(&self, run_id: i64) -> Result<Vec<FailureRecord>, HistoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, entity, target, message
             FROM failures
             WHERE run_id = ?1
             ORDER BY id",
        )?;

        let failures = stmt
            .query_map(params![run_id], |row| {
                Ok(FailureRecord {
                    kind: row.get(0)?,
                    entity: row.get(1)?,
                    target: row.get(2)?,
                    message: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(failures)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        run_date: row.get(2)?,
        mode: row.get(3)?,
        store: row.get(4)?,
        instances: row.get::<_, i64>(5)?.max(0) as u64,
        created: row.get::<_, i64>(6)?.max(0) as u64,
        deleted: row.get::<_, i64>(7)?.max(0) as u64,
        failures: row.get::<_, i64>(8)?.max(0) as u64,
        duration_ms: row.get::<_, i64>(9)?.max(0) as u64,
    })
}
