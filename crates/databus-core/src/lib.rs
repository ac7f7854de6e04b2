//! Subscription-based change-notification bus.
//!
//! Consumers register named, filtered subscriptions. Every committed
//! mutation reported by the change feed is matched against each active
//! subscription's condition and buffered as an event. Consumers then
//! `poll` to claim events for a visibility timeout and `acknowledge` them
//! once processed; unacknowledged claims lapse and the events become
//! pollable again, giving at-least-once delivery.
//!
//! The storage layer is SQLite (see `databus-db`). Functions in
//! [`registry`], [`store`] and [`claims`] take a `&Connection` and the
//! current time and are synchronous; [`Databus`] wraps them in an async
//! facade that runs them on the blocking pool and adds long-polling and
//! asynchronous move/replay jobs.

pub mod bus;
pub mod claims;
pub mod conditions;
pub mod clock;
pub mod error;
pub mod feed;
pub mod jobs;
pub mod longpoll;
pub mod registry;
pub mod store;


pub use bus::{BusSettings, Databus, PollOptions, SweepReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conditions::ConditionCache;
pub use error::BusError;
pub use feed::{start_intake, MutationSink};
pub use jobs::{JobRunner, JobService, JobSettings, SqliteJobService};
pub use longpoll::{LongPollCoordinator, LongPollSettings};
pub use registry::{SubscribeParams, SubscriptionIter};
