//! Crate-wide error taxonomy.
//!
//! Library code returns [`CoreError`] so callers can match on category;
//! the diagnostics binary converts into `anyhow::Error` at its outermost
//! boundary, the same split the rest of this codebase uses between its
//! library surface and its CLI entry point.

use std::io;

/// The error categories a batch execution, pool operation, or codec call
/// can surface.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A send/receive on a transport endpoint failed, or the peer is gone.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame was malformed, or its operation count didn't match its body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A storage backend collaborator rejected the request.
    #[error("backend error: {0}")]
    Backend(String),

    /// The requested object, key, or row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A range lock could not be acquired within the retry budget.
    #[error("lock conflict: {0}")]
    Conflict(String),

    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The pool or endpoint is shutting down and can't accept new work.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Per-operation outcome recorded against a batch result.
#[derive(Debug, Clone)]
pub struct OperationError {
    /// Index of the failing operation within its originating batch.
    pub operation_index: usize,
    pub kind: String,
    pub message: String,
}

impl OperationError {
    pub fn new(operation_index: usize, kind: impl Into<String>, err: &CoreError) -> Self {
        Self {
            operation_index,
            kind: kind.into(),
            message: err.to_string(),
        }
    }
}
