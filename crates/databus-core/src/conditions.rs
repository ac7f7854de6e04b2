//! Parsed subscription conditions, keyed by subscription name.
//!
//! The fan-out evaluates every active subscription's filter for each
//! mutation, so conditions are parsed once and shared. An entry is only
//! reused while its source text matches the stored `table_filter`; a
//! subscription rewritten by another process sharing the database is
//! re-parsed on first use.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use databus_condition::Condition;
use databus_types::Subscription;

use crate::error::BusError;

#[derive(Debug)]
struct Entry {
    text: String,
    condition: Arc<Condition>,
}

#[derive(Debug, Default)]
pub struct ConditionCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ConditionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // Entries are replaced whole, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a condition just parsed for `subscription`.
    pub fn insert(&self, subscription: &Subscription, condition: Condition) -> Arc<Condition> {
        let condition = Arc::new(condition);
        self.entries().insert(
            subscription.name.clone(),
            Entry {
                text: subscription.table_filter.clone(),
                condition: Arc::clone(&condition),
            },
        );
        condition
    }

    /// Returns the parsed filter of `subscription`, parsing and caching it
    /// if the cached text is missing or stale.
    ///
    /// # Errors
    ///
    /// `InvalidCondition` if the stored text no longer parses, which only
    /// happens when the row was edited outside the bus.
    pub fn resolve(&self, subscription: &Subscription) -> Result<Arc<Condition>, BusError> {
        if let Some(entry) = self.entries().get(&subscription.name) {
            if entry.text == subscription.table_filter {
                return Ok(Arc::clone(&entry.condition));
            }
        }
        let condition = databus_condition::parse(&subscription.table_filter)?;
        Ok(self.insert(subscription, condition))
    }

    pub fn forget(&self, name: &str) {
        self.entries().remove(name);
    }

    /// Drops every entry whose name is not in `active`.
    pub fn retain_active(&self, active: &HashSet<String>) {
        self.entries().retain(|name, _| active.contains(name));
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use databus_types::datetime_from_ms;

    fn subscription(name: &str, filter: &str) -> Subscription {
        Subscription {
            name: name.to_string(),
            table_filter: filter.to_string(),
            subscription_ttl_secs: 60,
            event_ttl_secs: 60,
            ignore_suppressed_events: true,
            created_at: datetime_from_ms(0),
            expires_at: datetime_from_ms(60_000),
        }
    }

    #[test]
    fn repeated_resolve_shares_one_parse() {
        let cache = ConditionCache::new();
        let sub = subscription("orders", r#"table("orders")"#);

        let first = cache.resolve(&sub).expect("parses");
        let second = cache.resolve(&sub).expect("cached");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn changed_filter_text_is_reparsed() {
        let cache = ConditionCache::new();
        let before = cache.resolve(&subscription("s1", "alwaysTrue()")).expect("parses");
        let after = cache
            .resolve(&subscription("s1", "alwaysFalse()"))
            .expect("parses");

        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before.matches("orders", "1"));
        assert!(!after.matches("orders", "1"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unparseable_filter_is_not_cached() {
        let cache = ConditionCache::new();
        let err = cache
            .resolve(&subscription("broken", "or("))
            .expect_err("malformed");
        assert!(matches!(err, BusError::InvalidCondition(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn forget_and_retain_drop_entries() {
        let cache = ConditionCache::new();
        for name in ["a", "b", "c"] {
            cache.resolve(&subscription(name, "alwaysTrue()")).expect("parses");
        }

        cache.forget("a");
        assert_eq!(cache.len(), 2);

        let active: HashSet<String> = ["c".to_string()].into();
        cache.retain_active(&active);
        assert_eq!(cache.len(), 1);
        assert!(cache.resolve(&subscription("c", "alwaysTrue()")).is_ok());
    }
}
