//! Error types for attrix.

use thiserror::Error;

use crate::models::{JobStatus, ResourceRef};

/// Result type alias using attrix's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by the retry policy and by
/// callers that need to branch on the failure class without matching on
/// message payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    ImageQualityRejected,
    MalformedResponse,
    SchemaValidationFailed,
    PreconditionMissing,
    InvalidTransition,
    UnknownKey,
    UpstreamRejected,
    NotFound,
    UnknownResource,
    RunInProgress,
    Persistence,
    Config,
    InvalidInput,
    Internal,
}

/// Core error type for attrix operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Network-level failure talking to the vision service (retryable).
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// The vision service asked us to slow down (retryable).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The vision service refused the image as unusable.
    #[error("Image quality rejected: {0}")]
    ImageQualityRejected(String),

    /// The response body was not parseable JSON.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The response parsed but does not match the schema shape.
    #[error("Schema validation failed: {0}")]
    SchemaValidationFailed(String),

    /// A job could not be admitted because something it needs is gone.
    #[error("Precondition missing: {0}")]
    PreconditionMissing(String),

    /// Attempted a job state transition the state machine forbids.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Schema key does not exist or has the wrong type for the operation.
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// Non-retryable non-2xx response from the vision service.
    #[error("Upstream rejected request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    /// Job not found
    #[error("Job not found: {0}")]
    NotFound(uuid::Uuid),

    /// Resource reference not tracked by the registry
    #[error("Unknown resource: {0}")]
    UnknownResource(ResourceRef),

    /// Another extraction run is already active
    #[error("Extraction run already in progress")]
    RunInProgress,

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransientNetwork(_) => ErrorKind::TransientNetwork,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::ImageQualityRejected(_) => ErrorKind::ImageQualityRejected,
            Error::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Error::SchemaValidationFailed(_) => ErrorKind::SchemaValidationFailed,
            Error::PreconditionMissing(_) => ErrorKind::PreconditionMissing,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::UnknownKey(_) => ErrorKind::UnknownKey,
            Error::UpstreamRejected { .. } => ErrorKind::UpstreamRejected,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::UnknownResource(_) => ErrorKind::UnknownResource,
            Error::RunInProgress => ErrorKind::RunInProgress,
            Error::Database(_) | Error::Serialization(_) | Error::Io(_) => ErrorKind::Persistence,
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the extraction client may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientNetwork | ErrorKind::RateLimited
        )
    }

    /// Whether this error is a rate-limit signal.
    pub fn is_rate_limited(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        // Connection resets, DNS failures and timeouts are all worth another try.
        Error::TransientNetwork(e.to_string())
    }
}
