use crate::job::{JobId, JobStatus};

use thiserror::Error;

/// Errors surfaced to callers of the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The submission named an unknown profile or mode, or an inconsistent combination.
    /// Maps to **HTTP 400 Bad Request**. Not retried.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The owner already has `limit` jobs in flight.
    /// Maps to **HTTP 429 Too Many Requests**. Callers should back off and retry.
    #[error("Quota exceeded: {owner} already has {limit} active jobs")]
    QuotaExceeded { owner: String, limit: usize },

    /// The job does not exist, or was evicted after its retention window.
    /// Maps to **HTTP 404 Not Found**.
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// The requester is not allowed to act on the job.
    /// Maps to **HTTP 403 Forbidden**.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A state machine edge that does not exist was requested.
    /// Maps to **HTTP 409 Conflict**.
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The engine is shutting down and no longer accepts work.
    /// Maps to **HTTP 503 Service Unavailable**.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Errors reported by a [`SandboxRuntime`](crate::traits::SandboxRuntime).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// The runtime rejected the sandbox spec (e.g. unknown image, bad limits).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The sandbox no longer exists.
    #[error("Sandbox {0} not found")]
    NotFound(String),

    /// The runtime cannot be reached at all.
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    /// A failure that is expected to clear up on retry (timeouts, busy daemon).
    #[error("Transient runtime failure: {0}")]
    Transient(String),

    /// Any other runtime failure.
    #[error("Runtime failure: {0}")]
    System(String),
}

impl SandboxError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unavailable(_))
    }
}

/// Failures of the per-job log channels.
///
/// Both variants indicate an engine bug when they happen on the supervisor's publish path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogHubError {
    #[error("No log channel for job {0}")]
    NotFound(JobId),

    #[error("Log channel for job {0} is closed")]
    Closed(JobId),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// The credentials are invalid.
    /// Maps to **HTTP 401 Unauthorized**.
    #[error("Unauthorized: Credentials invalid")]
    Invalid,

    /// The credentials are missing.
    /// Maps to **HTTP 401**.
    #[error("Unauthorized: Credentials missing")]
    Missing,

    /// The user is authenticated but lacks the required scope.
    /// Maps to **HTTP 403 Forbidden**.
    #[error("Insufficient permissions: {0}")]
    Forbidden(String),

    /// Provider failure.
    /// Maps to **HTTP 500 Internal Server Error**.
    #[error("Auth system failure: {0}")]
    System(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}
