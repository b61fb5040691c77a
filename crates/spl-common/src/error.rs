//! Error types for the SPL warehouse loader.
//!
//! Each variant corresponds to one row of the failure policy: the kind
//! decides whether a file is quarantined, an archive retried, or the whole
//! run aborted, and the CLI maps kinds to process exit codes.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for the ETL pipeline
#[derive(Error, Debug)]
pub enum EtlError {
    /// Settings are missing or invalid; nothing has touched disk or the
    /// database yet when this is raised.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The acquisition collaborator gave up after exhausting its retries
    #[error("Acquisition of '{source_name}' failed: {reason}")]
    Acquisition { source_name: String, reason: String },

    /// A source XML file was rejected by the parser; the file is moved to
    /// quarantine and the run continues.
    #[error("Malformed SPL document '{path}': {detail}")]
    MalformedDocument { path: PathBuf, detail: String },

    /// Writing an intermediate chunk file failed; the current archive is
    /// aborted.
    #[error("Intermediate write failed: {0}")]
    Writer(String),

    /// Bulk ingest into staging tables failed; staging is truncated and the
    /// run is closed as FAILED.
    #[error("Staging load failed: {0}")]
    Staging(String),

    /// The merge transaction failed and was rolled back; production tables
    /// are unchanged.
    #[error("Merge failed: {0}")]
    Merge(String),

    /// A post-merge invariant check failed inside the merge transaction
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// A retryable database condition (connection drop, pool timeout)
    /// observed while executing the named operation.
    #[error("Transient database error during {operation}: {source}")]
    TransientDb {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// Another load run holds the RUNNING guard; concurrent runs against the
    /// same target are not supported.
    #[error("Load run {run_id} is already RUNNING against this database")]
    ConcurrentRun { run_id: i64 },

    /// An archive's bytes do not match the recorded checksum
    #[error("Checksum mismatch for '{file}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// The run was canceled cooperatively (signal or cancel flag)
    #[error("Run canceled")]
    Canceled,

    /// Database error outside the transient category
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File system operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EtlError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an acquisition error
    pub fn acquisition(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Acquisition {
            source_name: source.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed-document error for the given source file
    pub fn malformed(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::MalformedDocument {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a writer error
    pub fn writer(message: impl Into<String>) -> Self {
        Self::Writer(message.into())
    }

    /// Create a staging error
    pub fn staging(message: impl Into<String>) -> Self {
        Self::Staging(message.into())
    }

    /// Create a merge error
    pub fn merge(message: impl Into<String>) -> Self {
        Self::Merge(message.into())
    }

    /// Create an integrity violation error
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::IntegrityViolation(message.into())
    }

    /// Create a checksum mismatch error
    pub fn checksum_mismatch(
        file: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            file: file.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientDb { .. } => true,
            Self::Database(e) => matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut),
            _ => false,
        }
    }

    /// Process exit code for this error kind.
    ///
    /// 1 = configuration, 130 = canceled, 2 = everything else. The partial
    /// failure code 3 is not an error: a run that quarantines files still
    /// completes and reports it through its outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Canceled => 130,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(EtlError::configuration("bad port").exit_code(), 1);
        assert_eq!(EtlError::Canceled.exit_code(), 130);
        assert_eq!(EtlError::merge("boom").exit_code(), 2);
        assert_eq!(EtlError::malformed("a.xml", "truncated").exit_code(), 2);
    }

    #[test]
    fn test_transient_classification() {
        let transient = EtlError::TransientDb {
            operation: "merge".to_string(),
            source: sqlx::Error::PoolTimedOut,
        };
        assert!(transient.is_transient());
        assert!(EtlError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!EtlError::merge("constraint violated").is_transient());
    }

    #[test]
    fn test_malformed_message_includes_path() {
        let err = EtlError::malformed("labels/bad.xml", "missing <setId>");
        let msg = err.to_string();
        assert!(msg.contains("labels/bad.xml"));
        assert!(msg.contains("missing <setId>"));
    }
}
