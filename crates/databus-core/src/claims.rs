//! Claim manager: the AVAILABLE → CLAIMED → ACKNOWLEDGED lifecycle.
//!
//! A claim is the `claim_expires_at_ms` column of an event row. An event is
//! available when that column is NULL or already in the past, so a lapsed
//! claim needs no cleanup to become pollable again. Every transition is a
//! single conditional statement; SQLite's write lock makes it the atomic
//! compare-and-swap that keeps two pollers from claiming the same event.

use databus_types::Event;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};

use crate::clock::secs_to_ms;
use crate::error::BusError;
use crate::store::{map_row_to_event, ACTIVE_SUBSCRIPTION_GUARD, EVENT_COLUMNS};

fn check_limit(limit: usize) -> Result<i64, BusError> {
    if limit == 0 {
        return Err(BusError::InvalidParameter(
            "limit must be greater than zero".to_string(),
        ));
    }
    Ok(i64::try_from(limit).unwrap_or(i64::MAX))
}

/// Returns up to `limit` unexpired events, claimed or not, oldest first.
/// Has no side effects.
pub fn peek(conn: &Connection, name: &str, limit: usize, now_ms: i64) -> Result<Vec<Event>, BusError> {
    let limit = check_limit(limit)?;
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {EVENT_COLUMNS} FROM bus_events
         WHERE subscription = ?1 AND expires_at_ms > ?2 AND {ACTIVE_SUBSCRIPTION_GUARD}
         ORDER BY id ASC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(params![name, now_ms, limit], map_row_to_event)?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?.1);
    }
    Ok(events)
}

/// Claims up to `limit` available events for `claim_ttl_secs`.
///
/// Selection and claim happen in one `UPDATE … RETURNING` inside an
/// immediate transaction, so concurrent pollers receive disjoint sets.
/// Never waits for events to arrive.
pub fn poll(
    conn: &Connection,
    name: &str,
    claim_ttl_secs: u64,
    limit: usize,
    now_ms: i64,
) -> Result<Vec<Event>, BusError> {
    let limit = check_limit(limit)?;
    let claim_expires_at_ms = now_ms.saturating_add(secs_to_ms(claim_ttl_secs));

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let mut claimed = {
        let mut stmt = tx.prepare_cached(&format!(
            "UPDATE bus_events SET claim_expires_at_ms = ?3
             WHERE id IN (
                SELECT id FROM bus_events
                WHERE subscription = ?1
                  AND expires_at_ms > ?2
                  AND (claim_expires_at_ms IS NULL OR claim_expires_at_ms <= ?2)
                  AND {ACTIVE_SUBSCRIPTION_GUARD}
                ORDER BY id ASC
                LIMIT ?4
             )
             RETURNING {EVENT_COLUMNS}"
        ))?;
        let rows = stmt.query_map(
            params![name, now_ms, claim_expires_at_ms, limit],
            map_row_to_event,
        )?;
        let mut claimed = Vec::new();
        for row in rows {
            claimed.push(row?);
        }
        claimed
    };
    tx.commit()?;

    claimed.sort_by_key(|(id, _)| *id);

    if !claimed.is_empty() {
        tracing::debug!(subscription = name, claimed = claimed.len(), "claimed events");
    }
    Ok(claimed.into_iter().map(|(_, event)| event).collect())
}

/// Pushes the expiry of live claims out to `now + claim_ttl_secs`.
///
/// Keys that are unknown, unclaimed or whose claim already lapsed are
/// skipped. Returns the number of claims extended.
pub fn renew(
    conn: &Connection,
    name: &str,
    event_keys: &[String],
    claim_ttl_secs: u64,
    now_ms: i64,
) -> Result<usize, BusError> {
    let claim_expires_at_ms = now_ms.saturating_add(secs_to_ms(claim_ttl_secs));

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let mut renewed = 0;
    {
        let mut stmt = tx.prepare_cached(
            "UPDATE bus_events SET claim_expires_at_ms = ?4
             WHERE subscription = ?1 AND event_key = ?2
               AND claim_expires_at_ms > ?3 AND expires_at_ms > ?3",
        )?;
        for key in event_keys {
            renewed += stmt.execute(params![name, key, now_ms, claim_expires_at_ms])?;
        }
    }
    tx.commit()?;
    Ok(renewed)
}

/// Permanently removes claimed events.
///
/// Keys that are unknown or were never claimed are skipped, so repeating an
/// acknowledgement is harmless. Returns the number of events removed.
///
/// # Errors
///
/// `MissingParameter` if `event_keys` is `None`.
pub fn acknowledge(
    conn: &Connection,
    name: &str,
    event_keys: Option<&[String]>,
) -> Result<usize, BusError> {
    let event_keys = event_keys.ok_or(BusError::MissingParameter("eventKeys"))?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let mut removed = 0;
    {
        let mut stmt = tx.prepare_cached(
            "DELETE FROM bus_events
             WHERE subscription = ?1 AND event_key = ?2 AND claim_expires_at_ms IS NOT NULL",
        )?;
        for key in event_keys {
            removed += stmt.execute(params![name, key])?;
        }
    }
    tx.commit()?;
    Ok(removed)
}

/// Releases every claim held on `name`'s events. Returns the number of
/// events that went back to available.
pub fn unclaim_all(conn: &Connection, name: &str) -> Result<usize, BusError> {
    let released = conn.execute(
        "UPDATE bus_events SET claim_expires_at_ms = NULL
         WHERE subscription = ?1 AND claim_expires_at_ms IS NOT NULL",
        [name],
    )?;
    tracing::info!(subscription = name, released, "released all claims");
    Ok(released)
}
