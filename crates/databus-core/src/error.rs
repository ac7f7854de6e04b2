//! Error types for the databus core.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The subscription does not exist or has expired.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    /// The table filter condition could not be parsed.
    #[error("invalid condition: {0}")]
    InvalidCondition(#[from] databus_condition::ConditionError),

    /// A required argument was absent or empty.
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// An argument was present but out of range or malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A replay was requested from further back than history is retained.
    #[error("since timestamp {since} is outside the replay window of {window_secs}s; use no 'since' to replay all retained events")]
    ReplayWindowExceeded {
        since: DateTime<Utc>,
        window_secs: u64,
    },

    /// No job with this id exists (or it aged out of retention).
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// The backend is temporarily unable to serve the request.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Any other storage failure.
    #[error("storage error: {0}")]
    Storage(rusqlite::Error),

    /// A stored JSON column could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking storage task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl BusError {
    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<rusqlite::Error> for BusError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                Self::StorageUnavailable(e.to_string())
            }
            _ => Self::Storage(e),
        }
    }
}

impl From<r2d2::Error> for BusError {
    fn from(e: r2d2::Error) -> Self {
        Self::StorageUnavailable(format!("connection pool: {e}"))
    }
}

impl From<tokio::task::JoinError> for BusError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

/// Runs a storage operation, retrying transient failures up to `attempts`
/// times with linear backoff.
///
/// Must only be called from a blocking context; it sleeps the thread
/// between attempts.
pub(crate) fn with_retry<T>(
    operation: &'static str,
    attempts: u32,
    backoff: Duration,
    mut f: impl FnMut() -> Result<T, BusError>,
) -> Result<T, BusError> {
    let mut attempt = 1;
    loop {
        match f() {
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(operation, attempt, error = %e, "transient storage failure, retrying");
                std::thread::sleep(backoff * attempt);
                attempt += 1;
            }
            other => return other,
        }
    }
}
