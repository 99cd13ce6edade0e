use std::path::{Path, PathBuf};

use rusqlite::{named_params, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use super::models::{RunComparison, RunFilter, SweepRunRecord};
use super::{HistoryError, HistoryResult};

const HISTORY_SCHEMA: &str = include_str!("../../../sql/sweep_runs.sql");

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

#[derive(Debug, Clone)]
pub struct SqliteSweepStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSweepStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSweepStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> HistoryResult<SqliteSweepStore> {
        let path = self.path.ok_or(HistoryError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteSweepStore { path, flags })
    }
}

/// Run history of finished tuning sessions.
///
/// Every call opens its own connection, so the store is cheap to clone
/// and safe to move onto blocking tasks.
#[derive(Debug, Clone)]
pub struct SqliteSweepStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSweepStore {
    pub fn builder() -> SqliteSweepStoreBuilder {
        SqliteSweepStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> HistoryResult<Self> {
        SqliteSweepStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> HistoryResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            HistoryError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| HistoryError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> HistoryResult<()> {
        let conn = self.open()?;
        conn.execute_batch(HISTORY_SCHEMA)?;
        Ok(())
    }

    /// Inserts `record`, replacing any earlier row with the same run id.
    pub fn record_run(&self, record: &SweepRunRecord) -> HistoryResult<()> {
        let conn = self.open()?;
        conn.execute_batch(HISTORY_SCHEMA)?;
        let recommendation = record
            .recommendation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO sweep_runs (
                run_id, target, mode, termination, started_at, ended_at, rounds_completed,
                best_score, request_json, recommendation_json, rounds_json, error
            ) VALUES (
                :run_id, :target, :mode, :termination, :started_at, :ended_at, :rounds_completed,
                :best_score, :request_json, :recommendation_json, :rounds_json, :error
            )
            ON CONFLICT(run_id) DO UPDATE SET
                termination = excluded.termination,
                ended_at = excluded.ended_at,
                rounds_completed = excluded.rounds_completed,
                best_score = excluded.best_score,
                recommendation_json = excluded.recommendation_json,
                rounds_json = excluded.rounds_json,
                error = excluded.error",
            named_params! {
                ":run_id": &record.run_id,
                ":target": &record.target,
                ":mode": record.mode.as_str(),
                ":termination": record.termination.as_str(),
                ":started_at": record.started_at.naive_utc(),
                ":ended_at": record.ended_at.naive_utc(),
                ":rounds_completed": record.rounds_completed() as i64,
                ":best_score": record.best_score,
                ":request_json": serde_json::to_string(&record.request)?,
                ":recommendation_json": recommendation,
                ":rounds_json": serde_json::to_string(&record.rounds)?,
                ":error": &record.error,
            },
        )?;
        debug!(
            target: "sweep.history",
            run = %record.run_id,
            device = %record.target,
            termination = record.termination.as_str(),
            "sweep run recorded"
        );
        Ok(())
    }

    pub fn fetch_run(&self, run_id: &str) -> HistoryResult<Option<SweepRunRecord>> {
        let conn = self.open()?;
        let record = conn
            .prepare("SELECT * FROM sweep_runs WHERE run_id = ?1")?
            .query_row([run_id], |row| SweepRunRecord::from_row(row))
            .optional()?;
        Ok(record)
    }

    /// Most recent runs first.
    pub fn list_runs(&self, filter: &RunFilter) -> HistoryResult<Vec<SweepRunRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM sweep_runs
             WHERE (?1 IS NULL OR target = ?1)
               AND (?2 IS NULL OR termination = ?2)
             ORDER BY started_at DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                (
                    filter.target.as_deref(),
                    filter.termination.map(|termination| termination.as_str()),
                    filter.limit as i64,
                ),
                |row| SweepRunRecord::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn compare_runs(&self, left: &str, right: &str) -> HistoryResult<RunComparison> {
        let fetch = |run_id: &str| -> HistoryResult<SweepRunRecord> {
            self.fetch_run(run_id)?.ok_or_else(|| HistoryError::NotFound {
                run_id: run_id.to_string(),
            })
        };
        let left = fetch(left)?;
        let right = fetch(right)?;
        Ok(RunComparison::between(&left, &right))
    }
}
