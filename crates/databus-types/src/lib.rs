//! Shared types and constants for the databus.
//!
//! This crate holds the data model every other crate in the workspace
//! agrees on: subscriptions, buffered events, change-feed mutations and the
//! records describing asynchronous move/replay jobs. It has no storage or
//! runtime dependencies so that both the core and the HTTP adapter can
//! depend on it without pulling each other in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod event;
mod job;

pub use event::{Event, EventView};
pub use job::{JobKind, JobRecord, JobSpec, JobStatus, MoveStatus, ParseJobStatusError, ReplayStatus};

/// Default time a subscription lives without being renewed by `subscribe`.
pub const DEFAULT_SUBSCRIPTION_TTL_SECS: u64 = 86_400;

/// Default time an unacknowledged event may stay buffered.
pub const DEFAULT_EVENT_TTL_SECS: u64 = 86_400;

/// Default visibility timeout handed out by `poll` and `renew`.
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 30;

/// Default page size for `peek`, `poll` and `listSubscriptions`.
pub const DEFAULT_LIMIT: usize = 10;

/// Tag carried by re-derived ("re-etl") writes. Subscriptions with
/// `ignore_suppressed_events` set never receive events carrying it.
pub const SUPPRESSED_TAG: &str = "re-etl";

/// How far back in time a replay may reach.
pub const REPLAY_TTL_SECS: u64 = 50 * 60 * 60;

/// Maximum length of a subscription name.
pub const MAX_SUBSCRIPTION_NAME_LEN: usize = 255;

/// A named, filtered, TTL-bound consumer registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Unique subscription name.
    pub name: String,
    /// Canonical text of the table filter condition.
    pub table_filter: String,
    /// Lifetime granted by each `subscribe` call, in seconds.
    pub subscription_ttl_secs: u64,
    /// Lifetime of each buffered event, in seconds.
    pub event_ttl_secs: u64,
    /// Whether events tagged [`SUPPRESSED_TAG`] are dropped.
    pub ignore_suppressed_events: bool,
    /// When the subscription was first created.
    pub created_at: DateTime<Utc>,
    /// When the subscription expires unless `subscribe` is called again.
    pub expires_at: DateTime<Utc>,
}

impl Subscription {
    /// Returns `true` if a mutation carrying `tags` must be dropped for this
    /// subscription because of the suppression rule.
    pub fn suppresses<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        self.ignore_suppressed_events && tags.iter().any(|t| t.as_ref() == SUPPRESSED_TAG)
    }
}

/// A committed table mutation as delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Table the mutated row belongs to.
    pub table: String,
    /// Key of the mutated row.
    pub key: String,
    /// Provenance labels attached by the writer.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Mutation {
    pub fn new(table: impl Into<String>, key: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            tags,
        }
    }
}

/// Converts a millisecond UNIX timestamp into a UTC datetime, clamping
/// out-of-range values to the epoch.
pub fn datetime_from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(ignore_suppressed_events: bool) -> Subscription {
        Subscription {
            name: "s1".to_string(),
            table_filter: "alwaysTrue()".to_string(),
            subscription_ttl_secs: DEFAULT_SUBSCRIPTION_TTL_SECS,
            event_ttl_secs: DEFAULT_EVENT_TTL_SECS,
            ignore_suppressed_events,
            created_at: datetime_from_ms(0),
            expires_at: datetime_from_ms(86_400_000),
        }
    }

    #[test]
    fn suppression_only_applies_when_flag_set() {
        let tags = vec!["re-etl".to_string()];
        assert!(subscription(true).suppresses(&tags));
        assert!(!subscription(false).suppresses(&tags));
        assert!(!subscription(true).suppresses(&["ingest"]));
    }

    #[test]
    fn subscription_serializes_camel_case() {
        let json = serde_json::to_value(subscription(true)).expect("serialize");
        assert_eq!(json["tableFilter"], "alwaysTrue()");
        assert_eq!(json["ignoreSuppressedEvents"], true);
        assert_eq!(json["eventTtlSecs"], 86_400);
    }

    #[test]
    fn datetime_from_ms_handles_epoch() {
        assert_eq!(datetime_from_ms(0), DateTime::UNIX_EPOCH);
        assert_eq!(datetime_from_ms(1_500).timestamp_millis(), 1_500);
    }
}
