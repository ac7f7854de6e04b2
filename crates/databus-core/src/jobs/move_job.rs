//! Move job: re-points every event of one subscription at another.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};

use super::service::{job_cursor, record_progress};
use super::BatchProgress;
use crate::error::BusError;

/// Moves the next batch of `from`'s events (claims included) to `to`.
///
/// The batch and the job cursor commit in one transaction, so a job
/// restarted after a crash neither skips nor repeats events. The job is
/// done once a batch comes back short.
pub fn run_move_batch(
    conn: &Connection,
    job_id: &str,
    from: &str,
    to: &str,
    batch_size: usize,
    now_ms: i64,
) -> Result<BatchProgress, BusError> {
    let batch_size = batch_size.max(1);
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let cursor = job_cursor(&tx, job_id)?.unwrap_or(0);

    let mut moved_ids = {
        let mut stmt = tx.prepare_cached(
            "UPDATE bus_events SET subscription = ?2
             WHERE id IN (
                SELECT id FROM bus_events
                WHERE subscription = ?1 AND id > ?3
                ORDER BY id ASC
                LIMIT ?4
             )
             RETURNING id",
        )?;
        let rows = stmt.query_map(
            params![from, to, cursor, i64::try_from(batch_size).unwrap_or(i64::MAX)],
            |row| row.get::<_, i64>(0),
        )?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        ids
    };
    moved_ids.sort_unstable();

    let processed = moved_ids.len();
    let new_cursor = moved_ids.last().copied().unwrap_or(cursor);
    record_progress(&tx, job_id, new_cursor, processed, now_ms)?;
    tx.commit()?;

    tracing::debug!(job_id, from, to, moved = processed, cursor = new_cursor, "move batch");

    Ok(BatchProgress {
        processed,
        done: processed < batch_size,
    })
}
