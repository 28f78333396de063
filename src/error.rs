//! Error types shared across the reader, store and ingestion layers.

use thiserror::Error;

/// Failures of the streaming reader. Only these abort an archive.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reader used after close")]
    Closed,
}

/// Why a line was skipped instead of becoming a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReason {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("object has no `id` field")]
    MissingId,

    #[error("record rejected: {0}")]
    Invalid(String),
}

/// A raw object that could not be turned into a typed record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid {kind} record: {source}")]
    Invalid {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors reported by a [`crate::store::Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The uniqueness constraint on the record identifier was violated.
    #[error("identifier already exists: {id}")]
    UniqueViolation { id: String },

    #[error("store has no staged record to flush")]
    NothingStaged,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// The ingestion error taxonomy surfaced to callers.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed line {line}: {reason}")]
    MalformedLine { line: u64, reason: MalformedReason },

    #[error("identifier collision on {id} (attempt {attempt})")]
    IdentifierCollision { id: String, attempt: u32 },

    #[error("record {id} abandoned: {reason}")]
    RecordAbandoned { id: String, reason: String },

    #[error("batch {batch} failed to commit: {source}")]
    BatchCommitFailed {
        batch: u64,
        #[source]
        source: StoreError,
    },

    #[error("decompression failed after line {line}: {source}")]
    Decompression {
        line: u64,
        #[source]
        source: ReaderError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: i32, message: &str) -> StoreError {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            ffi::Error::new(code),
            Some(message.to_string()),
        ))
    }

    #[test]
    fn unique_violation_is_detected() {
        let err = StoreError::UniqueViolation { id: "abc".into() };
        assert!(err.is_unique_violation());
        assert!(!sqlite_failure(ffi::SQLITE_FULL, "disk full").is_unique_violation());
    }

    #[test]
    fn messages_carry_context() {
        let err = IngestError::MalformedLine {
            line: 7,
            reason: MalformedReason::MissingId,
        };
        assert_eq!(err.to_string(), "malformed line 7: object has no `id` field");

        let err = IngestError::BatchCommitFailed {
            batch: 3,
            source: sqlite_failure(ffi::SQLITE_BUSY, "database is locked"),
        };
        assert_eq!(
            err.to_string(),
            "batch 3 failed to commit: database error: database is locked"
        );
    }
}
