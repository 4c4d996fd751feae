//! Error taxonomy for the memory engine.
//!
//! Index errors are contract violations and surface immediately. Model call
//! errors come out of the retry layer; [`ModelCallError::Exhausted`] marks an
//! operation that has used its whole retry budget and must degrade.

use crate::chapter::ChapterNumber;
use crate::model::CallPurpose;
use thiserror::Error;

/// Errors from the chapter index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("Chapter {number} not found (index holds {count} chapters)")]
    NotFound { number: ChapterNumber, count: usize },

    #[error("Invalid chapter range {start}..={end} (index holds {count} chapters)")]
    InvalidRange {
        start: ChapterNumber,
        end: ChapterNumber,
        count: usize,
    },

    #[error("Chapter out of sequence: {reason}")]
    OutOfSequence { reason: String },
}

/// Errors from a model call, after classification by the retry layer.
#[derive(Debug, Error)]
pub enum ModelCallError {
    /// Network, timeout or rate limit failure. Worth retrying.
    #[error("Transient model failure: {0}")]
    Transient(#[source] claude::Error),

    /// A failure that retrying will not fix (bad credentials, bad request).
    #[error("Model call rejected: {0}")]
    Permanent(#[source] claude::Error),

    /// The model answered but the answer did not have the expected shape.
    #[error("Malformed model output: {0}")]
    Malformed(String),

    /// The retry budget ran out. Terminal for this operation only.
    #[error("{purpose} failed after {attempts} attempts: {last}")]
    Exhausted {
        purpose: CallPurpose,
        attempts: u32,
        last: String,
    },

    #[error("Model call cancelled")]
    Cancelled,
}

impl ModelCallError {
    /// Classify a raw client error.
    pub fn from_client(err: claude::Error) -> Self {
        if err.is_transient() {
            ModelCallError::Transient(err)
        } else {
            ModelCallError::Permanent(err)
        }
    }

    /// Whether another attempt with the same prompt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelCallError::Transient(_) | ModelCallError::Malformed(_))
    }
}

/// Errors from persisting chapters.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Top-level error for the memory orchestrator.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Model error: {0}")]
    Model(#[from] ModelCallError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller cancelled the operation; no partial result is returned.
    #[error("Operation cancelled")]
    Cancelled,
}
