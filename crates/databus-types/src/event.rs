//! Buffered event records and their client-facing views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event buffered for a single subscription.
///
/// Events are immutable once enqueued; only `claim_expires_at` changes as
/// the event moves through the claim lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Opaque key, unique across the bus. Used for ack/renew.
    pub event_key: String,
    /// Subscription currently holding the event.
    pub subscription: String,
    /// Table of the mutated row.
    pub table: String,
    /// Key of the mutated row.
    pub key: String,
    /// Provenance labels copied from the mutation.
    pub tags: Vec<String>,
    /// When the event was buffered.
    pub enqueued_at: DateTime<Utc>,
    /// When the event is dropped if still unacknowledged.
    pub expires_at: DateTime<Utc>,
    /// Expiry of the current claim, if the event has been handed out.
    pub claim_expires_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Returns `true` if the event is under a claim that has not yet lapsed.
    pub fn is_claimed_at(&self, now: DateTime<Utc>) -> bool {
        self.claim_expires_at.is_some_and(|expiry| expiry > now)
    }

    /// Renders the event as returned to consumers.
    pub fn view(&self, include_tags: bool) -> EventView {
        EventView {
            event_key: self.event_key.clone(),
            content: serde_json::json!({
                "~table": self.table,
                "~id": self.key,
            }),
            tags: include_tags.then(|| self.tags.clone()),
        }
    }
}

/// Client view of an event returned by `peek` and `poll`.
///
/// Tags are only included when the caller asks for them; older consumers
/// expect the content-only shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    pub event_key: String,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datetime_from_ms;

    fn event(claim_expires_at: Option<i64>) -> Event {
        Event {
            event_key: "k1".to_string(),
            subscription: "s1".to_string(),
            table: "review".to_string(),
            key: "r-1".to_string(),
            tags: vec!["ingest".to_string()],
            enqueued_at: datetime_from_ms(1_000),
            expires_at: datetime_from_ms(10_000),
            claim_expires_at: claim_expires_at.map(datetime_from_ms),
        }
    }

    #[test]
    fn claim_is_live_only_before_expiry() {
        let now = datetime_from_ms(5_000);
        assert!(!event(None).is_claimed_at(now));
        assert!(event(Some(6_000)).is_claimed_at(now));
        assert!(!event(Some(5_000)).is_claimed_at(now));
    }

    #[test]
    fn view_omits_tags_unless_requested() {
        let e = event(None);
        let plain = serde_json::to_value(e.view(false)).expect("serialize");
        assert_eq!(plain["eventKey"], "k1");
        assert_eq!(plain["content"]["~table"], "review");
        assert_eq!(plain["content"]["~id"], "r-1");
        assert!(plain.get("tags").is_none());

        let tagged = serde_json::to_value(e.view(true)).expect("serialize");
        assert_eq!(tagged["tags"][0], "ingest");
    }
}
