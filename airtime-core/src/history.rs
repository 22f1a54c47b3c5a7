use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::Serialize;
use thiserror::Error;

use crate::broadcaster::controller::RunOutcome;
use crate::broadcaster::types::DestinationStatus;
use crate::notify::RunStatus;

const RUNS_SCHEMA: &str = include_str!("../../sql/runs.sql");

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to open run ledger {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on run ledger: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("run ledger path not configured")]
    MissingStore,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationRecord {
    pub position: i64,
    pub url: String,
    pub status: DestinationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub attempt_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub total_duration_s: Option<f64>,
    pub elapsed_s: i64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub destinations: Vec<DestinationRecord>,
}

impl RunRecord {
    /// Destination URLs are stored redacted.
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        Self {
            attempt_id: outcome.attempt_id.to_string(),
            run_id: outcome.notification_id(),
            status: outcome.status(),
            exit_code: outcome.engine_exit,
            total_duration_s: outcome.total_duration,
            elapsed_s: outcome.streamed_seconds as i64,
            error_kind: outcome.failure.as_ref().map(|failure| failure.kind.to_string()),
            error_message: outcome.failure.as_ref().map(|failure| failure.message.clone()),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at.unwrap_or_else(Utc::now),
            destinations: outcome
                .destinations
                .entries()
                .iter()
                .enumerate()
                .map(|(position, entry)| DestinationRecord {
                    position: position as i64,
                    url: entry.destination.redacted(),
                    status: entry.status,
                })
                .collect(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            attempt_id: row.get("attempt_id")?,
            run_id: row.get("run_id")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(RunStatus::Error),
            exit_code: row.get("exit_code")?,
            total_duration_s: row.get("total_duration_s")?,
            elapsed_s: row.get::<_, Option<i64>>("elapsed_s")?.unwrap_or(0),
            error_kind: row.get("error_kind")?,
            error_message: row.get("error_message")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            destinations: Vec::new(),
        })
    }

    pub fn started_destinations(&self) -> usize {
        self.destinations
            .iter()
            .filter(|destination| destination.status == DestinationStatus::Started)
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RunLedgerBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for RunLedgerBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl RunLedgerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> HistoryResult<RunLedger> {
        let path = self.path.ok_or(HistoryError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(RunLedger { path, flags })
    }
}

/// SQLite record of every transmission attempt.
#[derive(Debug, Clone)]
pub struct RunLedger {
    path: PathBuf,
    flags: OpenFlags,
}

impl RunLedger {
    pub fn builder() -> RunLedgerBuilder {
        RunLedgerBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> HistoryResult<Self> {
        RunLedgerBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> HistoryResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            HistoryError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| HistoryError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> HistoryResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        conn.execute_batch(RUNS_SCHEMA)?;
        Ok(())
    }

    /// Writes the outcome on the blocking pool so the runtime is not stalled by SQLite.
    pub async fn record(&self, outcome: &RunOutcome) -> HistoryResult<()> {
        let ledger = self.clone();
        let record = RunRecord::from_outcome(outcome);
        tokio::task::spawn_blocking(move || ledger.record_entry(&record))
            .await
            .map_err(|err| HistoryError::Io(io::Error::other(err)))?
    }

    pub fn record_entry(&self, record: &RunRecord) -> HistoryResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO runs (
                attempt_id, run_id, status, exit_code, total_duration_s, elapsed_s,
                error_kind, error_message, started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &record.attempt_id,
                &record.run_id,
                record.status.as_str(),
                record.exit_code,
                record.total_duration_s,
                record.elapsed_s,
                &record.error_kind,
                &record.error_message,
                record.started_at,
                record.finished_at,
            ],
        )?;
        tx.execute(
            "DELETE FROM run_destinations WHERE attempt_id = ?1",
            params![&record.attempt_id],
        )?;
        for destination in &record.destinations {
            tx.execute(
                "INSERT INTO run_destinations (attempt_id, position, url, status)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    &record.attempt_id,
                    destination.position,
                    &destination.url,
                    destination.status.as_str(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent attempts first.
    pub fn list(&self, filter: &RunFilter) -> HistoryResult<Vec<RunRecord>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM runs");
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" WHERE status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY finished_at DESC, started_at DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            values.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(RunRecord::from_row(row)?);
        }
        drop(rows);
        drop(stmt);

        let mut destinations = conn.prepare(
            "SELECT position, url, status FROM run_destinations
             WHERE attempt_id = ?1 ORDER BY position ASC",
        )?;
        for record in &mut records {
            let mut rows = destinations.query(params![&record.attempt_id])?;
            while let Some(row) = rows.next()? {
                record.destinations.push(DestinationRecord {
                    position: row.get(0)?,
                    url: row.get(1)?,
                    status: row
                        .get::<_, String>(2)?
                        .parse()
                        .unwrap_or(DestinationStatus::NotStarted),
                });
            }
        }
        Ok(records)
    }
}
