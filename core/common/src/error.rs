//! Common error types for the backup pipeline.

use thiserror::Error;

/// Top-level error type for Worldback operations.
///
/// Variants are grouped by the component that raises them. Only
/// [`Error::Network`] is considered transient; everything else either
/// needs a job-level retry or a human.
#[derive(Debug, Error)]
pub enum Error {
    /// Source directory missing or unreadable.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// I/O operation failed (disk full, permission denied, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A file kept changing while it was being captured.
    #[error("Inconsistent read: {0}")]
    InconsistentRead(String),

    /// No stored credential; an interactive authorization is needed.
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// The refresh token was rejected by the token endpoint.
    #[error("Refresh denied: {0}")]
    RefreshDenied(String),

    /// Transient network failure (timeout, 5xx, connection reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The remote store rejected the access token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The resumable upload session is gone on the remote side.
    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    /// Upload gave up after exhausting its retry budget.
    #[error("Upload failed after {attempts} attempts: {source}")]
    UploadFailed {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Retention could not remove one or more versions.
    #[error("Prune failure: {0}")]
    PruneFailure(String),

    /// Operation was cancelled by the host.
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether the failure is worth retrying locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Whether the failure came from a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Upload failure wrapping its last underlying cause.
    pub fn upload_failed(attempts: u32, cause: Error) -> Self {
        Error::UploadFailed {
            attempts,
            source: Box::new(cause),
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
