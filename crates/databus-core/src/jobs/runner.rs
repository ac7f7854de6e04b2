//! Drives submitted jobs to completion on the tokio runtime.

use std::sync::Arc;

use databus_db::DbPool;
use databus_types::{JobRecord, JobSpec};
use tokio::task::JoinHandle;

use super::{run_move_batch, run_replay_batch, BatchProgress, JobService, JobSettings};
use crate::clock::Clock;
use crate::conditions::ConditionCache;
use crate::error::{with_retry, BusError};
use crate::longpoll::LongPollCoordinator;

/// Executes move and replay jobs, one tokio task per job.
///
/// Batches run on the blocking pool. A batch that hits a transient storage
/// error is retried within the configured budget; any other error fails the
/// job with its cursor left at the last committed batch.
pub struct JobRunner {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    jobs: Arc<dyn JobService>,
    coordinator: Arc<LongPollCoordinator>,
    conditions: Arc<ConditionCache>,
    settings: JobSettings,
}

impl JobRunner {
    pub fn new(
        pool: DbPool,
        clock: Arc<dyn Clock>,
        jobs: Arc<dyn JobService>,
        coordinator: Arc<LongPollCoordinator>,
        conditions: Arc<ConditionCache>,
        settings: JobSettings,
    ) -> Self {
        Self {
            pool,
            clock,
            jobs,
            coordinator,
            conditions,
            settings,
        }
    }

    /// Starts running `record` in the background.
    pub fn spawn(self: &Arc<Self>, record: JobRecord) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.run(record).await })
    }

    /// Re-spawns every job left in `ACCEPTED` or `RUNNING` state, typically
    /// by a previous process that stopped mid-job.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, BusError> {
        let jobs = Arc::clone(&self.jobs);
        let pending = tokio::task::spawn_blocking(move || jobs.unfinished()).await??;

        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "resuming unfinished jobs");
        }
        Ok(pending.into_iter().map(|record| self.spawn(record)).collect())
    }

    /// Runs a job to a terminal state. Failures are recorded on the job, not
    /// returned.
    pub async fn run(&self, record: JobRecord) {
        match self.drive(&record).await {
            Ok(processed) => {
                tracing::info!(
                    job_id = %record.id,
                    kind = %record.spec.kind(),
                    processed,
                    "job complete"
                );
            }
            Err(e) => {
                tracing::error!(job_id = %record.id, kind = %record.spec.kind(), error = %e, "job failed");
                let jobs = Arc::clone(&self.jobs);
                let id = record.id.clone();
                let message = e.to_string();
                match tokio::task::spawn_blocking(move || jobs.mark_failed(&id, &message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(job_id = %record.id, error = %e, "failed to record job failure")
                    }
                    Err(e) => {
                        tracing::error!(job_id = %record.id, error = %e, "failed to record job failure")
                    }
                }
            }
        }
    }

    async fn drive(&self, record: &JobRecord) -> Result<u64, BusError> {
        let jobs = Arc::clone(&self.jobs);
        let id = record.id.clone();
        tokio::task::spawn_blocking(move || jobs.mark_running(&id)).await??;

        let wake = match &record.spec {
            JobSpec::Move { to, .. } => to.as_str(),
            JobSpec::Replay { subscription, .. } => subscription.as_str(),
        };

        let mut processed = record.processed;
        loop {
            let progress = self.run_batch(record).await?;
            processed += progress.processed as u64;
            if progress.processed > 0 {
                self.coordinator.notify(wake);
            }
            if progress.done {
                break;
            }
        }

        let jobs = Arc::clone(&self.jobs);
        let id = record.id.clone();
        tokio::task::spawn_blocking(move || jobs.mark_complete(&id)).await??;
        Ok(processed)
    }

    async fn run_batch(&self, record: &JobRecord) -> Result<BatchProgress, BusError> {
        let pool = self.pool.clone();
        let clock = Arc::clone(&self.clock);
        let conditions = Arc::clone(&self.conditions);
        let settings = self.settings;
        let id = record.id.clone();
        let spec = record.spec.clone();

        tokio::task::spawn_blocking(move || {
            with_retry(
                "job batch",
                settings.max_attempts,
                settings.retry_backoff,
                || {
                    let conn = pool.get()?;
                    let now_ms = clock.now_ms();
                    match &spec {
                        JobSpec::Move { from, to } => run_move_batch(
                            &conn,
                            &id,
                            from,
                            to,
                            settings.move_batch_size,
                            now_ms,
                        ),
                        JobSpec::Replay {
                            subscription,
                            since,
                            until_mutation_id,
                        } => run_replay_batch(
                            &conn,
                            &conditions,
                            &id,
                            subscription,
                            *since,
                            *until_mutation_id,
                            settings.replay_batch_size,
                            now_ms,
                        ),
                    }
                },
            )
        })
        .await?
    }
}
