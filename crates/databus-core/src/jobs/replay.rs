//! Replay job: re-evaluates retained mutation history against a
//! subscription's current filter.

use chrono::{DateTime, Utc};
use databus_types::Mutation;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};

use super::service::{job_cursor, record_progress};
use super::BatchProgress;
use crate::conditions::ConditionCache;
use crate::error::BusError;
use crate::registry;
use crate::store::enqueue_if_matching;

/// Scans the next batch of mutations committed at or after `since` and
/// enqueues those that pass the subscription's current filter and
/// suppression flag.
///
/// Only mutations with `id <= until_mutation_id` are considered. The
/// injected events and the job cursor commit in one transaction.
///
/// # Errors
///
/// `UnknownSubscription` if the subscription was removed or expired while
/// the job ran.
pub fn run_replay_batch(
    conn: &Connection,
    conditions: &ConditionCache,
    job_id: &str,
    subscription: &str,
    since: Option<DateTime<Utc>>,
    until_mutation_id: i64,
    batch_size: usize,
    now_ms: i64,
) -> Result<BatchProgress, BusError> {
    let batch_size = batch_size.max(1);
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let cursor = job_cursor(&tx, job_id)?.unwrap_or(0);

    let target = registry::get_subscription(&tx, subscription, now_ms)?;
    let condition = conditions.resolve(&target)?;
    let since_ms = since.map_or(i64::MIN, |s| s.timestamp_millis());

    let batch = {
        let mut stmt = tx.prepare_cached(
            "SELECT id, table_name, row_key, tags_json FROM bus_mutations
             WHERE id > ?1 AND id <= ?2 AND committed_at_ms >= ?3
             ORDER BY id ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                cursor,
                until_mutation_id,
                since_ms,
                i64::try_from(batch_size).unwrap_or(i64::MAX)
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;
        let mut batch = Vec::new();
        for row in rows {
            batch.push(row?);
        }
        batch
    };

    let mut injected = 0;
    let mut new_cursor = cursor;
    for (id, table, key, tags_json) in &batch {
        let tags: Vec<String> = serde_json::from_str(tags_json)?;
        let mutation = Mutation::new(table.as_str(), key.as_str(), tags);
        if enqueue_if_matching(&tx, &target, &condition, &mutation, now_ms)?.is_some() {
            injected += 1;
        }
        new_cursor = *id;
    }

    record_progress(&tx, job_id, new_cursor, injected, now_ms)?;
    tx.commit()?;

    tracing::debug!(
        job_id,
        subscription,
        scanned = batch.len(),
        injected,
        cursor = new_cursor,
        "replay batch"
    );

    Ok(BatchProgress {
        processed: injected,
        done: batch.len() < batch_size,
    })
}
