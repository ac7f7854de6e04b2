//! Asynchronous administrative jobs: move and replay.
//!
//! Jobs run in batches. Each batch commits together with the job's cursor,
//! so a job interrupted by a crash resumes exactly where the last committed
//! batch left off once [`JobRunner::resume_pending`] picks it up again.

mod move_job;
mod replay;
mod runner;
pub(crate) mod service;

use std::time::Duration;

pub use move_job::run_move_batch;
pub use replay::run_replay_batch;
pub use runner::JobRunner;
pub use service::{JobService, SqliteJobService};

/// Outcome of a single job batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    /// Events moved or injected by this batch.
    pub processed: usize,
    /// `true` when there is nothing left to do.
    pub done: bool,
}

/// Batch sizing and retry budget for job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    pub move_batch_size: usize,
    pub replay_batch_size: usize,
    /// Attempts per batch before a transient storage failure fails the job.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            move_batch_size: 500,
            replay_batch_size: 500,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}
