use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Infrastructure error types for gavel.
///
/// Per-listing pipeline failures are not represented here; those travel as
/// [`FetchError`] values so the orchestrator can decide what to do with them.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP client could not be built or a non-listing request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration is missing or malformed. Fatal at startup.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A job state change that the state machine does not allow.
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: String,
        to: String,
    },

    /// No job with this id exists.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// An external scorer (price prediction or shipping) failed.
    #[error("Analysis unavailable: {0}")]
    AnalysisUnavailable(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Classification of a single fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network hiccup, timeout or upstream 5xx. Retryable.
    Transient,
    /// Bot wall, 403 or 429. Retryable with a different identity.
    Blocked,
    /// The listing is gone. Terminal.
    NotFound,
    /// The page could not be parsed into a listing. Terminal.
    Malformed,
    /// Every identity is cooling down or retired. Retryable, backpressure.
    NoIdentityAvailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Blocked => "blocked",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Malformed => "malformed",
            ErrorKind::NoIdentityAvailable => "no_identity_available",
        }
    }

    /// Returns true if a job failing with this kind may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Blocked | ErrorKind::NoIdentityAvailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "blocked" => Ok(ErrorKind::Blocked),
            "not_found" => Ok(ErrorKind::NotFound),
            "malformed" => Ok(ErrorKind::Malformed),
            "no_identity_available" => Ok(ErrorKind::NoIdentityAvailable),
            _ => Err(format!("Unknown error kind: {s}")),
        }
    }
}

/// A classified failure of one fetch, returned as data to the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Blocked, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    pub fn no_identity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoIdentityAvailable, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
