//! Event store: buffering, counting and purging events per subscription.
//!
//! Writes come from three places: the change-feed fan-out
//! ([`apply_mutation`]), out-of-band injection ([`inject_event`]) and the
//! replay job. All of them funnel through [`enqueue_if_matching`], so the
//! filter and suppression rules are applied identically.
//!
//! Reads only see events of active subscriptions whose own `expires_at` has
//! not passed; lapsed rows linger until the maintenance sweep removes them.

use databus_condition::Condition;
use databus_types::{datetime_from_ms, Event, Mutation, Subscription};
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};

use crate::clock::secs_to_ms;
use crate::conditions::ConditionCache;
use crate::error::BusError;
use crate::registry;

pub(crate) const EVENT_COLUMNS: &str = "id, event_key, subscription, table_name, row_key, \
     tags_json, enqueued_at_ms, expires_at_ms, claim_expires_at_ms";

/// SQL guard restricting a query on `bus_events` to an active subscription.
/// Expects the subscription name in `?1` and the current time in `?2`.
pub(crate) const ACTIVE_SUBSCRIPTION_GUARD: &str = "EXISTS (SELECT 1 FROM bus_subscriptions s \
     WHERE s.name = ?1 AND s.expires_at_ms > ?2)";

/// Buffers one event for `subscription` if the mutation passes its filter
/// and suppression rule.
///
/// Returns the new event key, or `None` if the mutation was filtered out.
pub fn enqueue_if_matching(
    conn: &Connection,
    subscription: &Subscription,
    condition: &Condition,
    mutation: &Mutation,
    now_ms: i64,
) -> Result<Option<String>, BusError> {
    if !condition.matches(&mutation.table, &mutation.key) || subscription.suppresses(&mutation.tags)
    {
        return Ok(None);
    }

    let event_key = uuid::Uuid::new_v4().simple().to_string();
    let expires_at_ms = now_ms.saturating_add(secs_to_ms(subscription.event_ttl_secs));
    let tags_json = serde_json::to_string(&mutation.tags)?;

    conn.prepare_cached(
        "INSERT INTO bus_events (
            subscription, event_key, table_name, row_key, tags_json,
            enqueued_at_ms, expires_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![
        subscription.name,
        event_key,
        mutation.table,
        mutation.key,
        tags_json,
        now_ms,
        expires_at_ms,
    ])?;

    Ok(Some(event_key))
}

/// Records a committed mutation in the replay history and fans it out to
/// every active subscription whose filter accepts it.
///
/// History and fan-out commit together, so a failed call leaves nothing
/// behind and is safe to retry. Returns the names of the subscriptions
/// that received an event.
pub fn apply_mutation(
    conn: &Connection,
    conditions: &ConditionCache,
    mutation: &Mutation,
    now_ms: i64,
) -> Result<Vec<String>, BusError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    tx.execute(
        "INSERT INTO bus_mutations (table_name, row_key, tags_json, committed_at_ms)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            mutation.table,
            mutation.key,
            serde_json::to_string(&mutation.tags)?,
            now_ms,
        ],
    )?;

    let mut delivered = Vec::new();
    for subscription in registry::active_subscriptions(&tx, now_ms)? {
        let condition = match conditions.resolve(&subscription) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    subscription = %subscription.name,
                    error = %e,
                    "skipping subscription with unreadable condition"
                );
                continue;
            }
        };
        if enqueue_if_matching(&tx, &subscription, &condition, mutation, now_ms)?.is_some() {
            delivered.push(subscription.name);
        }
    }

    tx.commit()?;

    tracing::debug!(
        table = %mutation.table,
        key = %mutation.key,
        subscriptions = delivered.len(),
        "applied mutation"
    );

    Ok(delivered)
}

/// Synthesizes one untagged event for `name` outside the change feed.
///
/// The subscription's filter still applies. Returns `true` if an event was
/// buffered, `false` if the filter rejected it.
///
/// # Errors
///
/// `UnknownSubscription` if the subscription does not exist or expired.
pub fn inject_event(
    conn: &Connection,
    conditions: &ConditionCache,
    name: &str,
    table: &str,
    key: &str,
    now_ms: i64,
) -> Result<bool, BusError> {
    let subscription = registry::get_subscription(conn, name, now_ms)?;
    let condition = conditions.resolve(&subscription)?;
    let mutation = Mutation::new(table, key, Vec::new());
    let injected = enqueue_if_matching(conn, &subscription, &condition, &mutation, now_ms)?;
    Ok(injected.is_some())
}

/// Counts available and claimed events.
pub fn event_count(conn: &Connection, name: &str, now_ms: i64) -> Result<u64, BusError> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM bus_events
             WHERE subscription = ?1 AND expires_at_ms > ?2 AND {ACTIVE_SUBSCRIPTION_GUARD}"
        ),
        params![name, now_ms],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Counts available and claimed events, scanning no more than `limit` rows.
///
/// The result is exact when below `limit` and equal to `limit` otherwise.
pub fn event_count_up_to(
    conn: &Connection,
    name: &str,
    limit: u64,
    now_ms: i64,
) -> Result<u64, BusError> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM (
                SELECT 1 FROM bus_events
                WHERE subscription = ?1 AND expires_at_ms > ?2 AND {ACTIVE_SUBSCRIPTION_GUARD}
                LIMIT ?3
             )"
        ),
        params![name, now_ms, i64::try_from(limit).unwrap_or(i64::MAX)],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Counts events under a live claim.
pub fn claim_count(conn: &Connection, name: &str, now_ms: i64) -> Result<u64, BusError> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM bus_events
             WHERE subscription = ?1 AND expires_at_ms > ?2
               AND claim_expires_at_ms > ?2 AND {ACTIVE_SUBSCRIPTION_GUARD}"
        ),
        params![name, now_ms],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Deletes every event and claim buffered for `name`, keeping the
/// subscription itself. Returns the number of events removed.
pub fn purge(conn: &Connection, name: &str) -> Result<usize, BusError> {
    let removed = conn.execute("DELETE FROM bus_events WHERE subscription = ?1", [name])?;
    tracing::info!(subscription = name, removed, "purged subscription");
    Ok(removed)
}

/// Deletes events whose own TTL has passed.
pub fn sweep_expired_events(conn: &Connection, now_ms: i64) -> Result<usize, BusError> {
    Ok(conn.execute("DELETE FROM bus_events WHERE expires_at_ms <= ?1", [now_ms])?)
}

/// Deletes mutation history committed before `before_ms`.
pub fn prune_mutations(conn: &Connection, before_ms: i64) -> Result<usize, BusError> {
    Ok(conn.execute(
        "DELETE FROM bus_mutations WHERE committed_at_ms < ?1",
        [before_ms],
    )?)
}

/// Returns the id of the newest retained mutation, or 0 if there is none.
pub fn latest_mutation_id(conn: &Connection) -> Result<i64, BusError> {
    let id: Option<i64> = conn.query_row("SELECT MAX(id) FROM bus_mutations", [], |row| row.get(0))?;
    Ok(id.unwrap_or(0))
}

/// Maps a row selected with [`EVENT_COLUMNS`] to its storage id and event.
pub(crate) fn map_row_to_event(row: &Row) -> rusqlite::Result<(i64, Event)> {
    let tags_json: String = row.get(5)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let claim_expires_at_ms: Option<i64> = row.get(8)?;

    Ok((
        row.get(0)?,
        Event {
            event_key: row.get(1)?,
            subscription: row.get(2)?,
            table: row.get(3)?,
            key: row.get(4)?,
            tags,
            enqueued_at: datetime_from_ms(row.get(6)?),
            expires_at: datetime_from_ms(row.get(7)?),
            claim_expires_at: claim_expires_at_ms.map(datetime_from_ms),
        },
    ))
}
