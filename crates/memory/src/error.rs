use thiserror::Error;

/// Stable error taxonomy shared by every component in this crate.
///
/// Callers that sit above the core (the CLI, an eventual MCP transport) are
/// expected to branch on this enum rather than on formatted messages:
/// `Transient` is safe to retry, `Invalid`/`NotFound`/`Conflict` are not,
/// and `Fatal` means the process should stop trusting its own state.
#[derive(Debug, Error)]
pub enum ContextdError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ContextdError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether a caller following the spec's retry policy should retry this
    /// error with exponential backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<redb::Error> for ContextdError {
    fn from(err: redb::Error) -> Self {
        Self::fatal(err.to_string())
    }
}

impl From<redb::DatabaseError> for ContextdError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::fatal(err.to_string())
    }
}

impl From<redb::TransactionError> for ContextdError {
    fn from(err: redb::TransactionError) -> Self {
        Self::fatal(err.to_string())
    }
}

impl From<redb::TableError> for ContextdError {
    fn from(err: redb::TableError) -> Self {
        Self::fatal(err.to_string())
    }
}

impl From<redb::StorageError> for ContextdError {
    fn from(err: redb::StorageError) -> Self {
        Self::fatal(err.to_string())
    }
}

impl From<redb::CommitError> for ContextdError {
    fn from(err: redb::CommitError) -> Self {
        Self::fatal(err.to_string())
    }
}

impl From<std::io::Error> for ContextdError {
    fn from(err: std::io::Error) -> Self {
        Self::transient(err.to_string())
    }
}

impl From<serde_json::Error> for ContextdError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for ContextdError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::fatal(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for ContextdError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::fatal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ContextdError>;
