//! Append-only SQLite audit log.
//!
//! Every pipeline decision lands here as one row. The store exposes `record`
//! and read-only queries; there is no update or delete path.

pub mod query;
pub mod record;

pub use query::{AuditFilter, AuditStats, SourceCount};
pub use record::{AuditRecord, EventType};

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::SecondsFormat;
use log::{debug, error};
use rusqlite::{Connection, OpenFlags, params};

/// Errors from the audit store.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create audit directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    source TEXT NOT NULL,
    input TEXT NOT NULL,
    suggestion TEXT,
    extracted_command TEXT,
    approved INTEGER,
    executed INTEGER,
    result_summary TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_source ON audit_log(source);
CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_log(event_type);
";

/// The audit store. One connection; appends are serialized by its mutex.
pub struct AuditLog {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("path", &self.path).finish()
    }
}

impl AuditLog {
    /// Open (or create) the audit database at `path`.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| AuditError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        // WAL lets reporting tools read while the orchestrator appends.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// A throwaway in-memory store.
    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Open an existing database without write access, for reporting.
    pub fn open_read_only(path: &Path) -> Result<Self, AuditError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record. Failures are logged, never propagated.
    pub fn record(&self, record: &AuditRecord) {
        match self.try_record(record) {
            Ok(id) => debug!(
                "audit #{id}: {} from {} ({})",
                record.event_type, record.source, record.request_id
            ),
            Err(e) => error!(
                "failed to write audit record {} ({}): {e}",
                record.request_id, record.event_type
            ),
        }
    }

    /// Append a record, returning its row id.
    pub fn try_record(&self, record: &AuditRecord) -> Result<i64, AuditError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (
                request_id, timestamp, event_type, source, input, suggestion,
                extracted_command, approved, executed, result_summary
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.request_id.to_string(),
                record
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
                record.event_type.as_str(),
                record.source,
                record.input,
                record.suggestion,
                record.extracted_command,
                record.approved,
                record.executed,
                record.result_summary,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Records matching `filter`, newest first unless `filter.ascending`.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        query::run_query(&self.conn(), filter)
    }

    /// Aggregate counts, optionally restricted to rows at or after `since`.
    pub fn stats(
        &self,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<AuditStats, AuditError> {
        query::run_stats(&self.conn(), since)
    }

    /// Total number of rows.
    pub fn count(&self) -> Result<i64, AuditError> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?)
    }
}
