//! Error types for the unmerge engine.

use thiserror::Error;

/// Result type alias for unmerge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the unmerge engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed task descriptor. Never retried.
    #[error("invalid unmerge arguments: {0}")]
    Argument(String),

    /// A collaborator store failed. The whole page is retried.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Cross-page state contradicts itself (e.g. a destination key that
    /// changes its group). Never retried.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Descriptor encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A page kept failing with retryable errors.
    #[error("page failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether re-running the same page from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(e) => e.is_transient(),
            Error::Internal(_) => true,
            Error::Argument(_)
            | Error::Invariant(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::RetriesExhausted { .. } => false,
        }
    }

    /// Short label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Argument(_) => "argument",
            Error::Store(_) => "store",
            Error::Invariant(_) => "invariant",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::Internal(_) => "internal",
        }
    }
}

/// Failures reported by the external collaborators (event source, hash
/// lock table, stream snapshots, activity log, group store).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or rejected the call.
    #[error("{store} unavailable: {reason}")]
    Unavailable { store: &'static str, reason: String },

    /// The call did not complete in time.
    #[error("{store} timed out")]
    Timeout { store: &'static str },

    /// The store does not know the referenced object.
    #[error("{store}: not found: {what}")]
    NotFound { store: &'static str, what: String },
}

impl StoreError {
    /// Whether this failure is expected to clear up on its own.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
