//! Durable build history on SQLite.
//!
//! Two tables: `build_attempts` is the append-only audit log of every build
//! attempt, and `built_packages` holds the latest successful version per
//! package. Both are written in one transaction per attempt, so a crash can
//! never leave an attempt without its `built_packages` update or vice versa.

pub mod models;

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::HistoryError;
use crate::version::VersionString;

pub use models::{
    AttemptOutcome, AttemptRecord, BuildAttempt, BuildStatus, BuiltPackage, FailureKind,
};

/// Latest successful version per package, read in one statement.
pub type HistorySnapshot = BTreeMap<String, VersionString>;

/// Async-safe handle to the history database.
///
/// Wraps `HistoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off the async worker threads.
#[derive(Clone)]
pub struct HistoryHandle {
    inner: Arc<std::sync::Mutex<HistoryDb>>,
}

impl HistoryHandle {
    pub fn new(db: HistoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, HistoryError>
    where
        F: FnOnce(&HistoryDb) -> Result<R, HistoryError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| HistoryError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|_| HistoryError::TaskPanicked)?
    }

    /// Acquire the database synchronously (CLI queries and tests).
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, HistoryDb>, HistoryError> {
        self.inner.lock().map_err(|_| HistoryError::LockPoisoned)
    }

    pub async fn record(&self, attempt: BuildAttempt) -> Result<i64, HistoryError> {
        self.call(move |db| db.record(&attempt)).await
    }

    pub async fn latest_successful(
        &self,
        name: &str,
    ) -> Result<Option<VersionString>, HistoryError> {
        let name = name.to_string();
        self.call(move |db| db.latest_successful(&name)).await
    }

    pub async fn snapshot(&self) -> Result<HistorySnapshot, HistoryError> {
        self.call(|db| db.snapshot()).await
    }
}

pub struct HistoryDb {
    conn: Connection,
}

impl HistoryDb {
    /// Open (or create) the database file and initialize the schema.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.configure()?;
        db.initialize_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.configure()?;
        db.initialize_schema()?;
        Ok(db)
    }

    fn configure(&self) -> Result<(), HistoryError> {
        // journal_mode answers with the resulting mode, so it needs a query.
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        self.conn
            .execute_batch("PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    /// Create tables and indexes if absent. Safe to call on every startup.
    pub fn initialize_schema(&self) -> Result<(), HistoryError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS build_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                target TEXT NOT NULL,
                package TEXT NOT NULL,
                version TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('success', 'failure')),
                failure_kind TEXT,
                exit_code INTEGER,
                stdout BLOB,
                stderr BLOB
            );

            CREATE TABLE IF NOT EXISTS built_packages (
                name TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                attempt_id INTEGER NOT NULL REFERENCES build_attempts(id),
                built_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_build_attempts_package ON build_attempts(package, id);
            ",
        )?;
        Ok(())
    }

    /// Append one attempt. Returns its sequence id.
    pub fn record(&self, attempt: &BuildAttempt) -> Result<i64, HistoryError> {
        // Use unchecked_transaction so both tables change atomically.
        let tx = self.conn.unchecked_transaction()?;

        let failure = attempt.outcome.failure();
        tx.execute(
            "INSERT INTO build_attempts
                (timestamp, target, package, version, status, failure_kind, exit_code, stdout, stderr)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                attempt.timestamp.to_rfc3339(),
                attempt.target,
                attempt.package,
                attempt.version.as_str(),
                attempt.outcome.status().as_str(),
                failure.map(|f| f.as_str()),
                failure.and_then(|f| f.exit_code()),
                attempt.stdout,
                attempt.stderr,
            ],
        )?;
        let id = tx.last_insert_rowid();

        if attempt.outcome.is_success() {
            tx.execute(
                "INSERT INTO built_packages (name, version, attempt_id, built_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    version = excluded.version,
                    attempt_id = excluded.attempt_id,
                    built_at = excluded.built_at",
                params![
                    attempt.package,
                    attempt.version.as_str(),
                    id,
                    attempt.timestamp.to_rfc3339()
                ],
            )?;
        }

        tx.commit()?;
        Ok(id)
    }

    /// Version of the most recent successful attempt for `name`.
    pub fn latest_successful(&self, name: &str) -> Result<Option<VersionString>, HistoryError> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT attempt_id, version FROM built_packages WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(id, version)| parse_version(id, &version))
            .transpose()
    }

    /// All built packages in one read, for a consistent planning baseline.
    pub fn snapshot(&self) -> Result<HistorySnapshot, HistoryError> {
        Ok(self
            .list_built()?
            .into_iter()
            .map(|b| (b.name, b.version))
            .collect())
    }

    pub fn list_built(&self) -> Result<Vec<BuiltPackage>, HistoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, version, attempt_id, built_at FROM built_packages ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut built = Vec::new();
        for row in rows {
            let (name, version, attempt_id, built_at) = row?;
            built.push(BuiltPackage {
                name,
                version: parse_version(attempt_id, &version)?,
                attempt_id,
                built_at: parse_timestamp(attempt_id, &built_at)?,
            });
        }
        Ok(built)
    }

    /// Recorded attempts, newest first, optionally for one package.
    pub fn list_attempts(
        &self,
        package: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AttemptRecord>, HistoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, target, package, version, status, failure_kind, exit_code, stdout, stderr
             FROM build_attempts
             WHERE ?1 IS NULL OR package = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![package, limit], RawAttempt::from_row)?;

        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?.into_record()?);
        }
        Ok(attempts)
    }

    pub fn attempt_count(&self) -> Result<i64, HistoryError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM build_attempts", [], |row| row.get(0))?)
    }
}

struct RawAttempt {
    id: i64,
    timestamp: String,
    target: String,
    package: String,
    version: String,
    status: String,
    failure_kind: Option<String>,
    exit_code: Option<i32>,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
}

impl RawAttempt {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            target: row.get(2)?,
            package: row.get(3)?,
            version: row.get(4)?,
            status: row.get(5)?,
            failure_kind: row.get(6)?,
            exit_code: row.get(7)?,
            stdout: row.get(8)?,
            stderr: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<AttemptRecord, HistoryError> {
        let id = self.id;
        let corrupt = |reason: String| HistoryError::CorruptRow { id, reason };
        let status = BuildStatus::from_str(&self.status).map_err(corrupt)?;
        let outcome = match status {
            BuildStatus::Success => AttemptOutcome::Success,
            BuildStatus::Failure => {
                let kind = self.failure_kind.as_deref().unwrap_or("build_failed");
                AttemptOutcome::Failure(
                    FailureKind::from_parts(kind, self.exit_code).map_err(corrupt)?,
                )
            }
        };

        Ok(AttemptRecord {
            id: self.id,
            attempt: BuildAttempt {
                timestamp: parse_timestamp(self.id, &self.timestamp)?,
                target: self.target,
                package: self.package,
                version: parse_version(self.id, &self.version)?,
                outcome,
                stdout: self.stdout,
                stderr: self.stderr,
            },
        })
    }
}

fn parse_version(id: i64, raw: &str) -> Result<VersionString, HistoryError> {
    VersionString::parse(raw).map_err(|e| HistoryError::CorruptRow {
        id,
        reason: e.to_string(),
    })
}

fn parse_timestamp(id: i64, raw: &str) -> Result<DateTime<Utc>, HistoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HistoryError::CorruptRow {
            id,
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}
