//! SQLite storage for the databus: a pooled, WAL-mode database and the
//! schema for subscriptions, buffered events, the mutation log and jobs.
//!
//! Every claim transition is a single conditional `UPDATE`, so SQLite's
//! write lock serves as the compare-and-swap for claims. Writers that lose
//! the lock for longer than the busy timeout see `SQLITE_BUSY`, which the
//! bus treats as transient.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
