#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use databus_core::{BusSettings, Clock, Databus, ManualClock};
use databus_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use databus_types::{JobStatus, Mutation};
use tempfile::TempDir;

pub const START_MS: i64 = 1_700_000_000_000;

pub struct Harness {
    pub bus: Databus,
    pub clock: Arc<ManualClock>,
    pub pool: DbPool,
    _dir: TempDir,
}

/// A bus over a file-backed database so several pooled connections share
/// state.
pub fn harness() -> Harness {
    harness_with(BusSettings::default())
}

pub fn harness_with(settings: BusSettings) -> Harness {
    harness_with_busy_timeout(settings, 5_000)
}

/// Like [`harness_with`], but writers give up on a held lock after
/// `busy_timeout_ms`.
pub fn harness_with_busy_timeout(settings: BusSettings, busy_timeout_ms: u64) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let pool = open_pool_with(&dir, busy_timeout_ms);
    let clock = Arc::new(ManualClock::new(START_MS));
    let bus = Databus::new(pool.clone(), Arc::clone(&clock) as Arc<dyn Clock>, settings);
    Harness {
        bus,
        clock,
        pool,
        _dir: dir,
    }
}

pub fn open_pool(dir: &TempDir) -> DbPool {
    open_pool_with(dir, 5_000)
}

pub fn open_pool_with(dir: &TempDir, busy_timeout_ms: u64) -> DbPool {
    let path = dir.path().join("databus.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 temp path"),
        DbRuntimeSettings {
            busy_timeout_ms,
            pool_max_size: 8,
        },
    )
    .expect("pool creation should succeed");
    let conn = pool.get().expect("connection should succeed");
    run_migrations(&conn).expect("migrations should succeed");
    pool
}

pub async fn feed(bus: &Databus, table: &str, key: &str, tags: &[&str]) -> Vec<String> {
    let tags = tags.iter().map(|t| t.to_string()).collect();
    bus.apply_mutation(Mutation::new(table, key, tags))
        .await
        .expect("apply_mutation should succeed")
}

/// Polls a job's status until it reaches a terminal state.
pub async fn wait_for_job<F, Fut>(mut status: F) -> JobStatus
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = JobStatus>,
{
    for _ in 0..200 {
        let current = status().await;
        if current.is_terminal() {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job did not finish in time");
}
