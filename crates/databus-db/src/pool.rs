//! SQLite connection pool for the bus tables.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a writer waits on SQLite's lock before `SQLITE_BUSY`, in
    /// milliseconds. The bus retries busy claim writes on top of this.
    pub busy_timeout_ms: u64,

    /// Upper bound on pooled connections. Long-pollers do not hold one
    /// while parked, so this only bounds concurrent storage calls.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens a pool over `db_path`.
///
/// `:memory:` gives each connection its own private database, so only use
/// it with `pool_max_size == 1`.
///
/// # Errors
///
/// `PoolError::PoolInit` if the first connection cannot be opened or
/// initialised.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| init_connection(conn, settings.busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        pool_max_size = settings.pool_max_size,
        busy_timeout_ms = settings.busy_timeout_ms,
        "opened bus database"
    );
    Ok(pool)
}

/// Per-connection setup: WAL so pollers read while a fan-out writes, and a
/// busy timeout so competing claim writers queue instead of failing fast.
fn init_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    // Private in-memory databases cannot use WAL and report "memory".
    if !matches!(journal_mode.as_str(), "wal" | "memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode is {journal_mode}, expected wal")),
        ));
    }
    conn.execute_batch(&format!(
        "PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn file_pool(dir: &tempfile::TempDir, busy_timeout_ms: u64) -> DbPool {
        let path = dir.path().join("bus.db");
        create_pool(
            path.to_str().expect("utf-8 path"),
            DbRuntimeSettings {
                busy_timeout_ms,
                pool_max_size: 2,
            },
        )
        .expect("pool creation should succeed")
    }

    #[test]
    fn memory_pool_applies_settings() {
        let pool = create_pool(
            ":memory:",
            DbRuntimeSettings {
                busy_timeout_ms: 2_500,
                pool_max_size: 1,
            },
        )
        .expect("pool creation should succeed");
        let conn = pool.get().expect("should get a connection");

        let busy_timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500);
        assert_eq!(pool.max_size(), 1);
    }

    #[test]
    fn reader_sees_committed_rows_while_writer_holds_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(&dir, 1_000);
        let writer = pool.get().expect("writer");
        let reader = pool.get().expect("reader");

        writer
            .execute_batch(
                "CREATE TABLE t (v INTEGER);
                 INSERT INTO t VALUES (1);
                 BEGIN IMMEDIATE;
                 INSERT INTO t VALUES (2);",
            )
            .expect("open write transaction");

        let visible: i64 = reader
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .expect("WAL readers do not block on the writer");
        assert_eq!(visible, 1);

        writer.execute_batch("COMMIT").expect("commit");
    }

    #[test]
    fn competing_writer_gets_busy_after_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(&dir, 50);
        let holder = pool.get().expect("holder");
        let contender = pool.get().expect("contender");

        holder
            .execute_batch("CREATE TABLE t (v INTEGER); BEGIN IMMEDIATE;")
            .expect("take the write lock");

        let started = Instant::now();
        let err = contender
            .execute_batch("BEGIN IMMEDIATE")
            .expect_err("lock is held");
        assert_eq!(err.sqlite_error_code(), Some(rusqlite::ErrorCode::DatabaseBusy));
        assert!(started.elapsed() >= Duration::from_millis(40));

        holder.execute_batch("ROLLBACK").expect("release");
    }
}
