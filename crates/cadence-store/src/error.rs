use rusqlite::ErrorCode;
use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write collided with the uniqueness index. Routine under concurrent
    /// scheduling; the caller decides how to recover.
    #[error("duplicate job identity")]
    DuplicateKey,

    /// The `jobs` table does not exist. The schema upgrade has not run.
    #[error("jobs table is missing; run `cadence upgrade` to create it")]
    SchemaMissing,

    /// A persisted row could not be turned back into a [`crate::Job`].
    #[error("corrupt job row {id}: {reason}")]
    Decode { id: i64, reason: String },

    /// The database could not be reached or stayed locked past the busy timeout.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job status only moves forward through [`crate::JobStore::update`]:
    /// waiting → running → done. Finishing a recurring job re-arms it as
    /// `waiting`, see [`crate::JobStore::finish`].
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    /// A schema migration step failed; the whole upgrade was rolled back.
    #[error("migration to version {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: Box<StoreError>,
    },

    /// The database was written by a newer release.
    #[error("schema version {found} is newer than the supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

impl StoreError {
    /// Fatal conditions that operator tooling reports as hard errors.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::SchemaMissing | StoreError::Unavailable(_) | StoreError::Migration { .. }
        )
    }
}

/// Classify SQLite failures by their structured result code so that
/// uniqueness races surface as [`StoreError::DuplicateKey`] instead of
/// a generic database error.
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, ref message) = err {
            match failure.code {
                ErrorCode::ConstraintViolation
                    if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    return StoreError::DuplicateKey;
                }
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase => {
                    return StoreError::Unavailable(err.to_string());
                }
                _ => {}
            }
            if message
                .as_deref()
                .is_some_and(|m| m.starts_with("no such table"))
            {
                return StoreError::SchemaMissing;
            }
        }
        StoreError::Database(err)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn unique_violation_is_duplicate_key() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT NOT NULL UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
        assert!(matches!(StoreError::from(err), StoreError::DuplicateKey));
    }

    #[test]
    fn missing_table_is_schema_missing() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn.prepare("SELECT * FROM jobs").unwrap_err();
        assert!(matches!(StoreError::from(err), StoreError::SchemaMissing));
    }

    #[test]
    fn other_failures_stay_database_errors() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn.execute("NOT EVEN SQL", []).unwrap_err();
        let classified = StoreError::from(err);
        assert!(matches!(classified, StoreError::Database(_)));
        assert!(!classified.is_fatal());
    }
}
