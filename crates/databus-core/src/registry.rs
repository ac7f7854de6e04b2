//! Subscription registry: upsert, lookup, listing and TTL expiry.
//!
//! A subscription whose `expires_at` has passed is treated as absent by
//! every function here immediately; its rows are reclaimed later by
//! [`sweep_expired`].

use std::collections::VecDeque;
use std::sync::Arc;

use databus_condition::Condition;
use databus_db::DbPool;
use databus_types::{datetime_from_ms, Subscription, MAX_SUBSCRIPTION_NAME_LEN};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::clock::{secs_to_ms, Clock};
use crate::error::BusError;

/// Page size used by [`SubscriptionIter`] when fetching from storage.
const LIST_PAGE_SIZE: usize = 100;

const SUBSCRIPTION_COLUMNS: &str = "name, condition, subscription_ttl_secs, event_ttl_secs, \
     ignore_suppressed_events, created_at_ms, expires_at_ms";

/// Parameters for [`subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeParams {
    pub name: String,
    /// Condition text; empty means always-true.
    pub condition: String,
    pub subscription_ttl_secs: u64,
    pub event_ttl_secs: u64,
    pub ignore_suppressed_events: bool,
}

impl SubscribeParams {
    /// Parameters with the default TTLs and suppression flag.
    pub fn new(name: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: condition.into(),
            subscription_ttl_secs: databus_types::DEFAULT_SUBSCRIPTION_TTL_SECS,
            event_ttl_secs: databus_types::DEFAULT_EVENT_TTL_SECS,
            ignore_suppressed_events: true,
        }
    }
}

/// Checks that `name` is usable as a subscription name.
///
/// # Errors
///
/// `MissingParameter` if empty, `InvalidParameter` if too long or if it
/// contains characters outside `[A-Za-z0-9_.:~-]`.
pub fn validate_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() {
        return Err(BusError::MissingParameter("subscription"));
    }
    if name.len() > MAX_SUBSCRIPTION_NAME_LEN {
        return Err(BusError::InvalidParameter(format!(
            "subscription name exceeds {MAX_SUBSCRIPTION_NAME_LEN} characters"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '~' | '-')))
    {
        return Err(BusError::InvalidParameter(format!(
            "subscription name '{name}' contains invalid character '{c}'"
        )));
    }
    Ok(())
}

/// Creates or refreshes a subscription.
///
/// Re-subscribing an active name updates its condition, TTLs and flag in
/// place and pushes `expires_at` out to `now + subscription_ttl`, keeping
/// the original `created_at` and every buffered event. Re-subscribing a
/// name whose registration already lapsed starts over: stale events are
/// discarded and `created_at` resets.
///
/// # Errors
///
/// `InvalidCondition` if the condition text does not parse; validation
/// errors for a bad name or zero TTLs.
pub fn subscribe(
    conn: &Connection,
    params: &SubscribeParams,
    now_ms: i64,
) -> Result<Subscription, BusError> {
    subscribe_parsed(conn, params, now_ms).map(|(subscription, _)| subscription)
}

/// [`subscribe`], also handing back the parsed condition so callers can
/// cache it without parsing the stored text again.
pub fn subscribe_parsed(
    conn: &Connection,
    params: &SubscribeParams,
    now_ms: i64,
) -> Result<(Subscription, Condition), BusError> {
    validate_name(&params.name)?;
    let condition = databus_condition::parse(&params.condition)?;
    if params.subscription_ttl_secs == 0 {
        return Err(BusError::InvalidParameter(
            "subscription ttl must be positive".to_string(),
        ));
    }
    if params.event_ttl_secs == 0 {
        return Err(BusError::InvalidParameter(
            "event ttl must be positive".to_string(),
        ));
    }

    let expires_at_ms = now_ms.saturating_add(secs_to_ms(params.subscription_ttl_secs));

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    tx.execute(
        "DELETE FROM bus_events
         WHERE subscription = ?1
           AND EXISTS (SELECT 1 FROM bus_subscriptions WHERE name = ?1 AND expires_at_ms <= ?2)",
        params![params.name, now_ms],
    )?;

    let subscription = tx.query_row(
        &format!(
            "INSERT INTO bus_subscriptions ({SUBSCRIPTION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                condition = excluded.condition,
                subscription_ttl_secs = excluded.subscription_ttl_secs,
                event_ttl_secs = excluded.event_ttl_secs,
                ignore_suppressed_events = excluded.ignore_suppressed_events,
                created_at_ms = CASE
                    WHEN bus_subscriptions.expires_at_ms <= excluded.created_at_ms
                    THEN excluded.created_at_ms
                    ELSE bus_subscriptions.created_at_ms
                END,
                expires_at_ms = excluded.expires_at_ms
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ),
        params![
            params.name,
            condition.to_string(),
            i64::try_from(params.subscription_ttl_secs).unwrap_or(i64::MAX),
            i64::try_from(params.event_ttl_secs).unwrap_or(i64::MAX),
            params.ignore_suppressed_events,
            now_ms,
            expires_at_ms,
        ],
        map_row_to_subscription,
    )?;

    tx.commit()?;

    tracing::info!(
        subscription = %subscription.name,
        condition = %subscription.table_filter,
        expires_at = %subscription.expires_at,
        "subscribed"
    );

    Ok((subscription, condition))
}

/// Deletes a subscription and everything buffered for it.
///
/// Returns `true` if a registration existed. Unsubscribing an unknown name
/// is not an error.
pub fn unsubscribe(conn: &Connection, name: &str) -> Result<bool, BusError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let events = tx.execute("DELETE FROM bus_events WHERE subscription = ?1", [name])?;
    let existed = tx.execute("DELETE FROM bus_subscriptions WHERE name = ?1", [name])? > 0;
    tx.commit()?;

    if existed {
        tracing::info!(subscription = name, events, "unsubscribed");
    }
    Ok(existed)
}

/// Returns the subscription if it exists and has not expired.
pub fn find_active(
    conn: &Connection,
    name: &str,
    now_ms: i64,
) -> Result<Option<Subscription>, BusError> {
    let subscription = conn
        .query_row(
            &format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM bus_subscriptions
                 WHERE name = ?1 AND expires_at_ms > ?2"
            ),
            params![name, now_ms],
            map_row_to_subscription,
        )
        .optional()?;
    Ok(subscription)
}

/// Returns subscription metadata.
///
/// # Errors
///
/// `UnknownSubscription` if the name is not registered or has expired.
pub fn get_subscription(
    conn: &Connection,
    name: &str,
    now_ms: i64,
) -> Result<Subscription, BusError> {
    find_active(conn, name, now_ms)?.ok_or_else(|| BusError::UnknownSubscription(name.to_string()))
}

/// Returns one page of active subscriptions ordered by name, starting
/// strictly after `from_exclusive`.
pub fn list_page(
    conn: &Connection,
    from_exclusive: Option<&str>,
    limit: usize,
    now_ms: i64,
) -> Result<Vec<Subscription>, BusError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM bus_subscriptions
         WHERE expires_at_ms > ?1 AND (?2 IS NULL OR name > ?2)
         ORDER BY name ASC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![now_ms, from_exclusive, i64::try_from(limit).unwrap_or(i64::MAX)],
        map_row_to_subscription,
    )?;

    let mut subscriptions = Vec::new();
    for row in rows {
        subscriptions.push(row?);
    }
    Ok(subscriptions)
}

/// Returns every active subscription. Used by the change-feed fan-out.
pub fn active_subscriptions(conn: &Connection, now_ms: i64) -> Result<Vec<Subscription>, BusError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM bus_subscriptions
         WHERE expires_at_ms > ?1
         ORDER BY name ASC"
    ))?;
    let rows = stmt.query_map([now_ms], map_row_to_subscription)?;

    let mut subscriptions = Vec::new();
    for row in rows {
        subscriptions.push(row?);
    }
    Ok(subscriptions)
}

/// Deletes lapsed subscriptions together with their buffered events.
///
/// Returns the number of subscriptions removed.
pub fn sweep_expired(conn: &Connection, now_ms: i64) -> Result<usize, BusError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute(
        "DELETE FROM bus_events WHERE subscription IN
            (SELECT name FROM bus_subscriptions WHERE expires_at_ms <= ?1)",
        [now_ms],
    )?;
    let removed = tx.execute(
        "DELETE FROM bus_subscriptions WHERE expires_at_ms <= ?1",
        [now_ms],
    )?;
    tx.commit()?;
    Ok(removed)
}

fn map_row_to_subscription(row: &Row) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        name: row.get(0)?,
        table_filter: row.get(1)?,
        subscription_ttl_secs: u64::try_from(row.get::<_, i64>(2)?).unwrap_or_default(),
        event_ttl_secs: u64::try_from(row.get::<_, i64>(3)?).unwrap_or_default(),
        ignore_suppressed_events: row.get(4)?,
        created_at: datetime_from_ms(row.get(5)?),
        expires_at: datetime_from_ms(row.get(6)?),
    })
}

/// Lazy, restartable listing of active subscriptions in name order.
///
/// Pages are fetched from storage on demand. Restart a listing by
/// constructing a new iterator with the last name seen as `from_exclusive`.
/// The iterator performs blocking storage calls.
pub struct SubscriptionIter {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    next_from: Option<String>,
    remaining: usize,
    buffer: VecDeque<Subscription>,
    exhausted: bool,
}

impl SubscriptionIter {
    /// # Errors
    ///
    /// `InvalidParameter` if `limit` is zero.
    pub fn new(
        pool: DbPool,
        clock: Arc<dyn Clock>,
        from_exclusive: Option<String>,
        limit: usize,
    ) -> Result<Self, BusError> {
        if limit == 0 {
            return Err(BusError::InvalidParameter(
                "limit must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            pool,
            clock,
            next_from: from_exclusive.filter(|from| !from.is_empty()),
            remaining: limit,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    fn fill(&mut self) -> Result<(), BusError> {
        let page_size = self.remaining.min(LIST_PAGE_SIZE);
        let conn = self.pool.get()?;
        let page = list_page(
            &conn,
            self.next_from.as_deref(),
            page_size,
            self.clock.now_ms(),
        )?;
        if page.len() < page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.next_from = Some(last.name.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for SubscriptionIter {
    type Item = Result<Subscription, BusError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                self.remaining = 0;
                return Some(Err(e));
            }
        }
        let subscription = self.buffer.pop_front()?;
        self.remaining -= 1;
        Some(Ok(subscription))
    }
}
