//! Error types for arvo-corpus operations.
//!
//! Defines error types for the major subsystems:
//! - Metadata lookups (database and metadata repository)
//! - Docker environment management
//! - Source tree extraction
//! - Corpus assembly and the on-disk index

use std::time::Duration;

use thiserror::Error;

/// Errors raised while resolving case metadata.
///
/// Every variant is a flavour of "metadata unavailable": the case cannot be
/// processed because its record cannot be read.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Case {0} not found in metadata database or metadata repository")]
    CaseNotFound(u64),

    #[error("Metadata database unavailable at '{path}': {reason}")]
    DatabaseUnavailable { path: String, reason: String },

    #[error("Metadata repository unavailable at '{path}': {reason}")]
    RepositoryUnavailable { path: String, reason: String },

    #[error("Metadata database has no usable case table: {0}")]
    NoCaseTable(String),

    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Malformed metadata document '{path}': {reason}")]
    MalformedDocument { path: String, reason: String },

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Image '{image}' not available: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("Failed to create container from '{image}': {reason}")]
    CreateFailed { image: String, reason: String },

    #[error("Path '{path}' not found in container '{id}'")]
    PathNotFound { id: String, path: String },

    #[error("Failed to copy '{path}' out of container '{id}': {reason}")]
    CopyFailed {
        id: String,
        path: String,
        reason: String,
    },

    #[error("Failed to remove container '{id}': {reason}")]
    RemoveFailed { id: String, reason: String },

    #[error("Unsafe archive entry '{0}'")]
    UnsafeArchiveEntry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that make one side (pre-fix or post-fix) of a case unusable.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Environment '{reference}' could not be instantiated: {reason}")]
    Instantiation { reference: String, reason: String },

    #[error("No candidate path yielded a source tree in '{reference}' (tried: {})", tried.join(", "))]
    NoCandidate {
        reference: String,
        tried: Vec<String>,
    },

    #[error("Environment '{reference}' exceeded its {limit:?} deadline")]
    Timeout { reference: String, limit: Duration },

    #[error("IO error while extracting '{reference}': {source}")]
    Io {
        reference: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractionError {
    /// The environment reference this failure belongs to.
    pub fn reference(&self) -> &str {
        match self {
            ExtractionError::Instantiation { reference, .. }
            | ExtractionError::NoCandidate { reference, .. }
            | ExtractionError::Timeout { reference, .. }
            | ExtractionError::Io { reference, .. } => reference,
        }
    }
}

/// Errors that can occur while assembling the corpus or touching its index.
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("Corpus index error: {0}")]
    Index(#[from] sqlx::Error),

    #[error("Corrupt index row for case {case_id}: {reason}")]
    CorruptIndex { case_id: u64, reason: String },

    #[error("Failed to write case {case_id}: {reason}")]
    WriteFailed { case_id: u64, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_candidate_lists_tried_paths() {
        let err = ExtractionError::NoCandidate {
            reference: "n132/arvo:1-vul".to_string(),
            tried: vec!["/src".to_string(), "/work/src".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("/src, /work/src"));
        assert_eq!(err.reference(), "n132/arvo:1-vul");
    }

    #[test]
    fn test_timeout_shows_sub_second_limit() {
        let err = ExtractionError::Timeout {
            reference: "n132/arvo:5-vul".to_string(),
            limit: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("50ms deadline"), "{err}");
    }

    #[test]
    fn test_metadata_error_display() {
        let err = MetadataError::CaseNotFound(25402);
        assert!(err.to_string().contains("25402"));

        let err = MetadataError::DatabaseUnavailable {
            path: "data/arvo/arvo.db".to_string(),
            reason: "missing".to_string(),
        };
        assert!(err.to_string().contains("data/arvo/arvo.db"));
    }
}
