//! Deduplication cache for recently seen message ids.
//!
//! Flooding sends the same message down every edge of the mesh, so every
//! node sees most messages more than once. The cache is what turns that
//! redundancy into at-most-once processing: an id present here is never
//! dispatched or forwarded again while it remains cached.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MessageCache {
    entries: DashMap<Uuid, Instant>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure membership test.
    pub fn seen(&self, msg_id: &Uuid) -> bool {
        self.entries.contains_key(msg_id)
    }

    /// Idempotent insert; a re-record keeps the original first-seen time.
    pub fn record(&self, msg_id: Uuid) {
        self.entries.entry(msg_id).or_insert_with(Instant::now);
    }

    /// Atomic seen-then-record under a single entry lock. Returns `true`
    /// when the id was not cached, i.e. exactly one of two racing callers
    /// for the same id gets `true`.
    pub fn check_and_record(&self, msg_id: Uuid) -> bool {
        match self.entries.entry(msg_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    /// Drop entries older than `retention`. A message re-delivered after
    /// its entry expired is treated as new again; that replay window is an
    /// accepted property of the protocol.
    pub fn evict_expired(&self, retention: Duration) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries
            .retain(|_, first_seen| now.duration_since(*first_seen) <= retention);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_sighting_then_duplicate() {
        let cache = MessageCache::new();
        let id = Uuid::new_v4();

        assert!(!cache.seen(&id));
        assert!(cache.check_and_record(id));
        assert!(cache.seen(&id));
        assert!(!cache.check_and_record(id));
    }

    #[test]
    fn record_is_idempotent() {
        let cache = MessageCache::new();
        let id = Uuid::new_v4();
        cache.record(id);
        cache.record(id);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_reopens_the_id() {
        let cache = MessageCache::new();
        let id = Uuid::new_v4();
        assert!(cache.check_and_record(id));

        // Nothing is older than a generous retention.
        assert_eq!(cache.evict_expired(Duration::from_secs(300)), 0);
        assert!(cache.seen(&id));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.evict_expired(Duration::ZERO), 1);
        assert!(!cache.seen(&id));
        // Re-delivery after eviction counts as new.
        assert!(cache.check_and_record(id));
    }

    #[test]
    fn concurrent_duplicates_yield_exactly_one_winner() {
        let cache = Arc::new(MessageCache::new());
        let id = Uuid::new_v4();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.check_and_record(id))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
