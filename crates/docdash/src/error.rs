use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocdashError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Errors that abort an entire batch before any job exists.
///
/// These are the only failures surfaced as a batch-level error state;
/// per-file and per-job problems are captured as failure records instead.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Failed to create HTTP client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },

    #[error("Batch upload request failed: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
    },

    #[error("Batch upload rejected ({status}): {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Failed to encode or decode submission payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Outcome of a single status check against the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// The status request itself failed (timeout, connection reset, 5xx).
    /// The job's last known status is retained and the check is retried
    /// on the next tick; this never marks the job as failed.
    #[error("Status request failed: {0}")]
    Transport(String),

    /// The backend no longer knows the batch session. Terminal for the
    /// whole batch, not just one job.
    #[error("Batch session not found")]
    SessionNotFound,

    #[error("Malformed status payload: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, DocdashError>;
