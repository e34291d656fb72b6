//! Time-bounded record of processed webhook acknowledgments.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// How long a processed key is remembered.
pub const DEFAULT_TTL: Duration = Duration::hours(24);

/// Entry count above which expired keys are swept on insert.
pub const DEFAULT_SWEEP_THRESHOLD: usize = 1000;

/// Keys are `(gateway message id, ack status)`.
pub struct IdempotencyCache {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
    sweep_threshold: usize,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_SWEEP_THRESHOLD)
    }
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, sweep_threshold: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            sweep_threshold,
        }
    }

    pub fn key(message_id: &str, status: &str) -> String {
        format!("{message_id}:{status}")
    }

    /// True if `key` was marked within the TTL.
    pub fn is_processed(&self, key: &str, now: DateTime<Utc>) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .is_some_and(|marked| now - *marked < self.ttl)
    }

    pub fn mark_processed(&self, key: String, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, now);

        if entries.len() > self.sweep_threshold {
            let ttl = self.ttl;
            entries.retain(|_, marked| now - *marked < ttl);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_keys_until_ttl() {
        let cache = IdempotencyCache::default();
        let now = Utc::now();
        let key = IdempotencyCache::key("m1", "delivered");

        assert!(!cache.is_processed(&key, now));
        cache.mark_processed(key.clone(), now);
        assert!(cache.is_processed(&key, now + Duration::hours(23)));
        assert!(!cache.is_processed(&key, now + Duration::hours(24)));
        assert!(!cache.is_processed("m1:read", now));
    }

    #[test]
    fn sweeps_expired_entries_past_threshold() {
        let cache = IdempotencyCache::new(Duration::hours(1), 3);
        let start = Utc::now();
        for i in 0..3 {
            cache.mark_processed(format!("old-{i}"), start);
        }
        assert_eq!(cache.len(), 3);

        let later = start + Duration::hours(2);
        cache.mark_processed("fresh".into(), later);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_processed("fresh", later));
    }

    #[test]
    fn no_sweep_below_threshold() {
        let cache = IdempotencyCache::new(Duration::hours(1), 10);
        let start = Utc::now();
        cache.mark_processed("a".into(), start);
        cache.mark_processed("b".into(), start + Duration::hours(5));
        assert_eq!(cache.len(), 2);
    }
}
