//! The [`Databus`] facade: every request-facing operation in one place.
//!
//! Storage work runs on tokio's blocking pool. Only [`Databus::poll`] may
//! suspend for longer than a storage round trip, and only while waiting
//! for events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use databus_db::DbPool;
use databus_types::{
    datetime_from_ms, Event, JobRecord, JobSpec, MoveStatus, Mutation, ReplayStatus, Subscription,
    DEFAULT_CLAIM_TTL_SECS, DEFAULT_LIMIT, REPLAY_TTL_SECS,
};
use rusqlite::Connection;

use crate::claims;
use crate::clock::{secs_to_ms, Clock};
use crate::conditions::ConditionCache;
use crate::error::{with_retry, BusError};
use crate::jobs::{JobRunner, JobService, JobSettings, SqliteJobService};
use crate::longpoll::{LongPollCoordinator, LongPollSettings};
use crate::registry::{self, SubscribeParams, SubscriptionIter};
use crate::store;

/// Tunables for a [`Databus`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSettings {
    pub long_poll: LongPollSettings,
    pub jobs: JobSettings,
    /// Attempts for single-key claim operations hitting a busy database.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    /// How long finished jobs stay queryable.
    pub job_retention: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            long_poll: LongPollSettings::default(),
            jobs: JobSettings::default(),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
            job_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Options for [`Databus::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub claim_ttl_secs: u64,
    pub limit: usize,
    /// Return immediately even when nothing is available.
    pub ignore_long_poll: bool,
    /// Caller's wait budget; capped at the configured maximum.
    pub max_wait: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            claim_ttl_secs: DEFAULT_CLAIM_TTL_SECS,
            limit: DEFAULT_LIMIT,
            ignore_long_poll: false,
            max_wait: None,
        }
    }
}

/// Rows removed by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub subscriptions: usize,
    pub events: usize,
    pub mutations: usize,
    pub jobs: usize,
}

/// Handle to the bus. Cheap to clone.
#[derive(Clone)]
pub struct Databus {
    inner: Arc<Inner>,
}

struct Inner {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    coordinator: Arc<LongPollCoordinator>,
    conditions: Arc<ConditionCache>,
    jobs: Arc<dyn JobService>,
    runner: Arc<JobRunner>,
    settings: BusSettings,
}

impl Databus {
    /// Creates a bus whose jobs are tracked in the same database.
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>, settings: BusSettings) -> Self {
        let jobs: Arc<dyn JobService> =
            Arc::new(SqliteJobService::new(pool.clone(), Arc::clone(&clock)));
        Self::with_job_service(pool, clock, jobs, settings)
    }

    pub fn with_job_service(
        pool: DbPool,
        clock: Arc<dyn Clock>,
        jobs: Arc<dyn JobService>,
        settings: BusSettings,
    ) -> Self {
        let coordinator = Arc::new(LongPollCoordinator::new(settings.long_poll));
        let conditions = Arc::new(ConditionCache::new());
        let runner = Arc::new(JobRunner::new(
            pool.clone(),
            Arc::clone(&clock),
            Arc::clone(&jobs),
            Arc::clone(&coordinator),
            Arc::clone(&conditions),
            settings.jobs,
        ));
        Self {
            inner: Arc::new(Inner {
                pool,
                clock,
                coordinator,
                conditions,
                jobs,
                runner,
                settings,
            }),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.inner.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn coordinator(&self) -> &Arc<LongPollCoordinator> {
        &self.inner.coordinator
    }

    pub fn settings(&self) -> &BusSettings {
        &self.inner.settings
    }

    pub fn conditions(&self) -> &Arc<ConditionCache> {
        &self.inner.conditions
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, BusError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, i64) -> Result<T, BusError> + Send + 'static,
    {
        let pool = self.inner.pool.clone();
        let clock = Arc::clone(&self.inner.clock);
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn, clock.now_ms())
        })
        .await?
    }

    async fn blocking_with_retry<T, F>(&self, operation: &'static str, mut f: F) -> Result<T, BusError>
    where
        T: Send + 'static,
        F: FnMut(&Connection, i64) -> Result<T, BusError> + Send + 'static,
    {
        let pool = self.inner.pool.clone();
        let clock = Arc::clone(&self.inner.clock);
        let attempts = self.inner.settings.retry_attempts;
        let backoff = self.inner.settings.retry_backoff;
        tokio::task::spawn_blocking(move || {
            with_retry(operation, attempts, backoff, || {
                let conn = pool.get()?;
                f(&conn, clock.now_ms())
            })
        })
        .await?
    }

    pub async fn subscribe(&self, params: SubscribeParams) -> Result<Subscription, BusError> {
        let conditions = Arc::clone(&self.inner.conditions);
        self.blocking(move |conn, now| {
            let (subscription, condition) = registry::subscribe_parsed(conn, &params, now)?;
            conditions.insert(&subscription, condition);
            Ok(subscription)
        })
        .await
    }

    /// Removes a subscription and its events. Unknown names succeed.
    pub async fn unsubscribe(&self, name: &str) -> Result<(), BusError> {
        let owned = name.to_string();
        self.blocking(move |conn, _| registry::unsubscribe(conn, &owned).map(|_| ()))
            .await?;
        self.inner.conditions.forget(name);
        Ok(())
    }

    pub async fn get_subscription(&self, name: &str) -> Result<Subscription, BusError> {
        let name = name.to_string();
        self.blocking(move |conn, now| registry::get_subscription(conn, &name, now))
            .await
    }

    /// Lists active subscriptions in name order, starting after
    /// `from_exclusive`. The returned iterator does blocking storage calls.
    pub fn list_subscriptions(
        &self,
        from_exclusive: Option<String>,
        limit: usize,
    ) -> Result<SubscriptionIter, BusError> {
        SubscriptionIter::new(
            self.inner.pool.clone(),
            Arc::clone(&self.inner.clock),
            from_exclusive,
            limit,
        )
    }

    pub async fn event_count(&self, name: &str) -> Result<u64, BusError> {
        let name = name.to_string();
        self.blocking(move |conn, now| store::event_count(conn, &name, now))
            .await
    }

    pub async fn event_count_up_to(&self, name: &str, limit: u64) -> Result<u64, BusError> {
        let name = name.to_string();
        self.blocking(move |conn, now| store::event_count_up_to(conn, &name, limit, now))
            .await
    }

    pub async fn claim_count(&self, name: &str) -> Result<u64, BusError> {
        let name = name.to_string();
        self.blocking(move |conn, now| store::claim_count(conn, &name, now))
            .await
    }

    pub async fn peek(&self, name: &str, limit: usize) -> Result<Vec<Event>, BusError> {
        let name = name.to_string();
        self.blocking(move |conn, now| claims::peek(conn, &name, limit, now))
            .await
    }

    /// Claims available events, waiting for some to arrive unless
    /// `ignore_long_poll` is set.
    pub async fn poll(&self, name: &str, options: PollOptions) -> Result<Vec<Event>, BusError> {
        if options.limit == 0 {
            return Err(BusError::InvalidParameter(
                "limit must be greater than zero".to_string(),
            ));
        }
        let bus = self;
        self.inner
            .coordinator
            .poll(name, options.ignore_long_poll, options.max_wait, move || {
                bus.claim_once(name, options.claim_ttl_secs, options.limit)
            })
            .await
    }

    async fn claim_once(
        &self,
        name: &str,
        claim_ttl_secs: u64,
        limit: usize,
    ) -> Result<Vec<Event>, BusError> {
        let name = name.to_string();
        self.blocking_with_retry("poll", move |conn, now| {
            claims::poll(conn, &name, claim_ttl_secs, limit, now)
        })
        .await
    }

    /// Extends live claims. Returns how many were extended.
    pub async fn renew(
        &self,
        name: &str,
        event_keys: Vec<String>,
        claim_ttl_secs: u64,
    ) -> Result<usize, BusError> {
        let name = name.to_string();
        self.blocking_with_retry("renew", move |conn, now| {
            claims::renew(conn, &name, &event_keys, claim_ttl_secs, now)
        })
        .await
    }

    /// Deletes claimed events. Returns how many were removed.
    pub async fn acknowledge(
        &self,
        name: &str,
        event_keys: Option<Vec<String>>,
    ) -> Result<usize, BusError> {
        let event_keys = event_keys.ok_or(BusError::MissingParameter("eventKeys"))?;
        let name = name.to_string();
        self.blocking_with_retry("acknowledge", move |conn, _| {
            claims::acknowledge(conn, &name, Some(event_keys.as_slice()))
        })
        .await
    }

    pub async fn unclaim_all(&self, name: &str) -> Result<usize, BusError> {
        let owned = name.to_string();
        let released = self
            .blocking(move |conn, _| claims::unclaim_all(conn, &owned))
            .await?;
        if released > 0 {
            self.inner.coordinator.notify(name);
        }
        Ok(released)
    }

    pub async fn purge(&self, name: &str) -> Result<usize, BusError> {
        let name = name.to_string();
        self.blocking(move |conn, _| store::purge(conn, &name)).await
    }

    /// Injects one untagged event, subject to the subscription's filter.
    pub async fn inject_event(&self, name: &str, table: &str, key: &str) -> Result<bool, BusError> {
        if table.is_empty() {
            return Err(BusError::MissingParameter("table"));
        }
        if key.is_empty() {
            return Err(BusError::MissingParameter("key"));
        }
        let (owned, table, key) = (name.to_string(), table.to_string(), key.to_string());
        let conditions = Arc::clone(&self.inner.conditions);
        let injected = self
            .blocking(move |conn, now| {
                store::inject_event(conn, &conditions, &owned, &table, &key, now)
            })
            .await?;
        if injected {
            self.inner.coordinator.notify(name);
        }
        Ok(injected)
    }

    /// Records a committed mutation and fans it out to matching
    /// subscriptions, waking their long-pollers.
    ///
    /// A busy database is retried within the configured budget before the
    /// error is returned.
    pub async fn apply_mutation(&self, mutation: Mutation) -> Result<Vec<String>, BusError> {
        let conditions = Arc::clone(&self.inner.conditions);
        let delivered = self
            .blocking_with_retry("apply_mutation", move |conn, now| {
                store::apply_mutation(conn, &conditions, &mutation, now)
            })
            .await?;
        for name in &delivered {
            self.inner.coordinator.notify(name);
        }
        Ok(delivered)
    }

    /// Starts moving every event of `from` to `to`. Returns the job id.
    pub async fn move_async(&self, from: &str, to: &str) -> Result<String, BusError> {
        if from.is_empty() {
            return Err(BusError::MissingParameter("from"));
        }
        if to.is_empty() {
            return Err(BusError::MissingParameter("to"));
        }
        if from == to {
            return Err(BusError::InvalidParameter(
                "cannot move a subscription to itself".to_string(),
            ));
        }

        let spec = JobSpec::Move {
            from: from.to_string(),
            to: to.to_string(),
        };
        self.submit(spec).await
    }

    /// Starts re-evaluating retained mutations committed at or after `since`
    /// (all retained mutations if `None`) against `name`'s current filter.
    /// Returns the job id.
    ///
    /// # Errors
    ///
    /// `ReplayWindowExceeded` if `since` is older than the retained history;
    /// `UnknownSubscription` if `name` is not active. No job is created in
    /// either case.
    pub async fn replay_async_since(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, BusError> {
        registry::validate_name(name)?;
        if let Some(since) = since {
            let oldest = datetime_from_ms(
                self.inner
                    .clock
                    .now_ms()
                    .saturating_sub(secs_to_ms(REPLAY_TTL_SECS)),
            );
            if since < oldest {
                return Err(BusError::ReplayWindowExceeded {
                    since,
                    window_secs: REPLAY_TTL_SECS,
                });
            }
        }

        let owned = name.to_string();
        let until_mutation_id = self
            .blocking(move |conn, now| {
                registry::get_subscription(conn, &owned, now)?;
                store::latest_mutation_id(conn)
            })
            .await?;

        let spec = JobSpec::Replay {
            subscription: name.to_string(),
            since,
            until_mutation_id,
        };
        self.submit(spec).await
    }

    async fn submit(&self, spec: JobSpec) -> Result<String, BusError> {
        let jobs = Arc::clone(&self.inner.jobs);
        let record = tokio::task::spawn_blocking(move || jobs.submit(spec)).await??;
        let id = record.id.clone();
        self.inner.runner.spawn(record);
        Ok(id)
    }

    async fn job(&self, id: &str) -> Result<JobRecord, BusError> {
        let jobs = Arc::clone(&self.inner.jobs);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || jobs.status(&id)).await?
    }

    /// # Errors
    ///
    /// `UnknownJob` if `id` does not name a move job.
    pub async fn get_move_status(&self, id: &str) -> Result<MoveStatus, BusError> {
        self.job(id)
            .await?
            .move_status()
            .ok_or_else(|| BusError::UnknownJob(id.to_string()))
    }

    /// # Errors
    ///
    /// `UnknownJob` if `id` does not name a replay job.
    pub async fn get_replay_status(&self, id: &str) -> Result<ReplayStatus, BusError> {
        self.job(id)
            .await?
            .replay_status()
            .ok_or_else(|| BusError::UnknownJob(id.to_string()))
    }

    /// Restarts jobs a previous process left unfinished. Returns how many
    /// were restarted.
    pub async fn resume_jobs(&self) -> Result<usize, BusError> {
        Ok(self.inner.runner.resume_pending().await?.len())
    }

    /// Removes expired subscriptions, events, mutation history outside the
    /// replay window and finished jobs past retention.
    pub async fn sweep(&self) -> Result<SweepReport, BusError> {
        let job_retention_ms =
            i64::try_from(self.inner.settings.job_retention.as_millis()).unwrap_or(i64::MAX);
        let conditions = Arc::clone(&self.inner.conditions);
        let report = self
            .blocking(move |conn, now| {
                let report = SweepReport {
                    subscriptions: registry::sweep_expired(conn, now)?,
                    events: store::sweep_expired_events(conn, now)?,
                    mutations: store::prune_mutations(
                        conn,
                        now.saturating_sub(secs_to_ms(REPLAY_TTL_SECS)),
                    )?,
                    jobs: 0,
                };
                let active: HashSet<String> = registry::active_subscriptions(conn, now)?
                    .into_iter()
                    .map(|s| s.name)
                    .collect();
                conditions.retain_active(&active);
                Ok(report)
            })
            .await?;

        let jobs = Arc::clone(&self.inner.jobs);
        let before_ms = self.inner.clock.now_ms().saturating_sub(job_retention_ms);
        let pruned_jobs =
            tokio::task::spawn_blocking(move || jobs.prune_finished(before_ms)).await??;

        Ok(SweepReport {
            jobs: pruned_jobs,
            ..report
        })
    }
}
