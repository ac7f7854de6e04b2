//! Long-poll coordination.
//!
//! A poller that finds nothing parks on a per-subscription [`Notify`]. Writers
//! that make events available call [`LongPollCoordinator::notify`]; the
//! wake is best-effort, so parked pollers also re-check on a fixed interval
//! to pick up events written by other processes sharing the database.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Timing knobs for parked pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongPollSettings {
    /// Upper bound on how long a single poll call may wait.
    pub max_wait: Duration,
    /// How often a parked poller retries without being woken.
    pub recheck_interval: Duration,
}

impl Default for LongPollSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(20),
            recheck_interval: Duration::from_secs(2),
        }
    }
}

/// Registry of wake signals keyed by subscription name.
///
/// Entries hold only weak references; the signal lives as long as some
/// poller is parked on it.
#[derive(Debug, Default)]
pub struct LongPollCoordinator {
    settings: LongPollSettings,
    waiters: Mutex<HashMap<String, Weak<Notify>>>,
}

/// Keeps a subscription's signal alive while a poller is parked on it.
struct Registration<'a> {
    coordinator: &'a LongPollCoordinator,
    name: &'a str,
    notify: Arc<Notify>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let Ok(mut waiters) = self.coordinator.waiters.lock() else {
            return;
        };
        // Temporary upgrades in `notify` are dropped before the lock is
        // released, so a count of one here means no other poller shares
        // this signal.
        if Arc::strong_count(&self.notify) == 1 {
            let same = waiters
                .get(self.name)
                .is_some_and(|weak| weak.as_ptr() == Arc::as_ptr(&self.notify));
            if same {
                waiters.remove(self.name);
            }
        }
    }
}

impl LongPollCoordinator {
    pub fn new(settings: LongPollSettings) -> Self {
        Self {
            settings,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> LongPollSettings {
        self.settings
    }

    /// Wakes every poller parked on `name`. A no-op if nobody is waiting.
    pub fn notify(&self, name: &str) {
        let Ok(waiters) = self.waiters.lock() else {
            return;
        };
        if let Some(notify) = waiters.get(name).and_then(Weak::upgrade) {
            notify.notify_waiters();
        }
    }

    /// Number of subscriptions with at least one parked poller.
    pub fn parked_subscriptions(&self) -> usize {
        self.waiters
            .lock()
            .map(|waiters| waiters.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or_default()
    }

    fn register<'a>(&'a self, name: &'a str) -> Registration<'a> {
        let notify = match self.waiters.lock() {
            Ok(mut waiters) => {
                match waiters.get(name).and_then(Weak::upgrade) {
                    Some(existing) => existing,
                    None => {
                        let fresh = Arc::new(Notify::new());
                        waiters.insert(name.to_string(), Arc::downgrade(&fresh));
                        fresh
                    }
                }
            }
            // A poisoned map only costs us wakeups; the re-check still runs.
            Err(_) => Arc::new(Notify::new()),
        };
        Registration {
            coordinator: self,
            name,
            notify,
        }
    }

    /// Runs `attempt` until it yields at least one item or the wait budget
    /// runs out.
    ///
    /// With `ignore_long_poll` set, `attempt` runs exactly once. Otherwise
    /// the caller parks between attempts until woken by [`notify`], the
    /// re-check interval elapses, or the budget (`max_wait`, capped at the
    /// configured maximum) is spent; a final attempt is always made at the
    /// deadline. Dropping the returned future abandons the wait.
    ///
    /// [`notify`]: LongPollCoordinator::notify
    pub async fn poll<T, E, F, Fut>(
        &self,
        name: &str,
        ignore_long_poll: bool,
        max_wait: Option<Duration>,
        mut attempt: F,
    ) -> Result<Vec<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
    {
        if ignore_long_poll {
            return attempt().await;
        }

        let budget = max_wait
            .unwrap_or(self.settings.max_wait)
            .min(self.settings.max_wait);
        let deadline = Instant::now() + budget;
        let registration = self.register(name);

        loop {
            // Enabled before the attempt so a wake raised while it runs is
            // not lost.
            let notified = registration.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let items = attempt().await?;
            let now = Instant::now();
            if !items.is_empty() || now >= deadline {
                return Ok(items);
            }

            let wait = (deadline - now).min(self.settings.recheck_interval);
            if tokio::time::timeout(wait, notified).await.is_ok() {
                tracing::trace!(subscription = name, "long-poll woken");
            }
        }
    }
}
