//! Bounded in-memory cache for patch archives and pre-compressed files

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default minimum time between two eviction sweeps
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct CacheItem {
    value: Bytes,
    visited_at: Instant,
    ttl: Duration,
    visits: u64,
}

impl CacheItem {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.visited_at) > self.ttl
    }
}

#[derive(Debug, Default)]
struct CacheState {
    items: HashMap<String, CacheItem>,
    last_sweep: Option<Instant>,
}

/// Cache of immutable byte blobs with TTL and visit-count eviction
///
/// Eviction never runs on a timer. It runs inside [`HotCache::put`] when the
/// item count is over the limit, when no sweep has run yet, or when the sweep
/// period has elapsed. A sweep drops expired items first, then the least
/// visited ones until the cache is back within its limit.
///
/// All state sits behind one mutex. Values are [`Bytes`], so a hit hands out
/// a cheap shared view instead of a copy.
#[derive(Debug)]
pub struct HotCache {
    items_limit: usize,
    sweep_period: Duration,
    state: Mutex<CacheState>,
}

impl HotCache {
    /// Cache holding at most `items_limit` items after a sweep, 0 for unbounded
    pub fn new(items_limit: usize) -> Self {
        Self::with_sweep_period(items_limit, DEFAULT_SWEEP_PERIOD)
    }

    /// Cache with a custom sweep period
    pub fn with_sweep_period(items_limit: usize, sweep_period: Duration) -> Self {
        Self {
            items_limit,
            sweep_period,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace `key`, running a sweep first when one is due
    pub fn put(&self, key: impl Into<String>, value: impl Into<Bytes>, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.lock();

        let over_limit = self.items_limit > 0 && state.items.len() > self.items_limit;
        let sweep_due = state
            .last_sweep
            .map_or(true, |last| now.saturating_duration_since(last) >= self.sweep_period);
        if over_limit || sweep_due {
            self.sweep_locked(&mut state, now);
        }

        state.items.insert(
            key.into(),
            CacheItem {
                value: value.into(),
                visited_at: now,
                ttl,
                visits: 0,
            },
        );
    }

    /// Look up `key`, refreshing its visit time and count on a hit
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.lock();
        let item = state.items.get_mut(key)?;
        item.visited_at = Instant::now();
        item.visits += 1;
        Some(item.value.clone())
    }

    /// Whether `key` is cached, without counting as a visit
    pub fn contains(&self, key: &str) -> bool {
        self.lock().items.contains_key(key)
    }

    /// Remove `key`, returning whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.lock().items.remove(key).is_some()
    }

    /// Remove every item
    pub fn clear(&self) {
        self.lock().items.clear();
    }

    /// Number of cached items
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Run an eviction sweep now, returning the number of evicted items
    pub fn sweep(&self) -> usize {
        let mut state = self.lock();
        self.sweep_locked(&mut state, Instant::now())
    }

    fn sweep_locked(&self, state: &mut CacheState, now: Instant) -> usize {
        state.last_sweep = Some(now);

        // Expired first, then coldest first
        let mut order: Vec<(bool, u64, String)> = state
            .items
            .iter()
            .map(|(key, item)| (!item.is_expired(now), item.visits, key.clone()))
            .collect();
        order.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let initial = state.items.len();
        let mut order = order.into_iter().peekable();

        while let Some((_, _, key)) = order.next_if(|(fresh, _, _)| !fresh) {
            state.items.remove(&key);
        }

        if self.items_limit > 0 {
            while state.items.len() > self.items_limit {
                let Some((_, _, key)) = order.next() else {
                    break;
                };
                state.items.remove(&key);
            }
        }

        let evicted = initial - state.items.len();
        if evicted > 0 {
            info!("Evicted {} cache item(s), {} left", evicted, state.items.len());
        } else {
            debug!("Cache sweep evicted nothing ({} items)", state.items.len());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread::sleep;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_put_get_delete() {
        let cache = HotCache::new(10);
        cache.put("a", Bytes::from_static(b"alpha"), HOUR);

        assert_eq!(cache.get("a"), Some(Bytes::from_static(b"alpha")));
        assert_eq!(cache.get("missing"), None);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_replaces_value() {
        let cache = HotCache::new(10);
        cache.put("a", b"one".to_vec(), HOUR);
        cache.put("a", b"two".to_vec(), HOUR);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a").unwrap().as_ref(), b"two");
    }

    #[test]
    fn test_clear() {
        let cache = HotCache::new(0);
        for i in 0..5 {
            cache.put(format!("k{i}"), vec![i as u8], HOUR);
        }
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_expired_evicted_before_cold() {
        let cache = HotCache::new(2);
        cache.put("expired-but-hot", b"x".to_vec(), Duration::from_millis(1));
        cache.put("cold", b"x".to_vec(), HOUR);
        cache.put("warm", b"x".to_vec(), HOUR);
        cache.get("warm");
        cache.get("expired-but-hot");
        cache.get("expired-but-hot");

        sleep(Duration::from_millis(20));
        // contains() peeks without refreshing the visit time
        assert!(cache.contains("expired-but-hot"));

        assert_eq!(cache.sweep(), 1);
        assert!(!cache.contains("expired-but-hot"));
        assert!(cache.contains("cold"));
        assert!(cache.contains("warm"));
    }

    #[test]
    fn test_least_visited_evicted_when_over_limit() {
        let cache = HotCache::new(2);
        cache.put("a", b"a".to_vec(), HOUR);
        cache.put("b", b"b".to_vec(), HOUR);
        cache.put("c", b"c".to_vec(), HOUR);
        cache.get("a");
        cache.get("a");
        cache.get("c");

        assert_eq!(cache.sweep(), 1);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_put_sweeps_when_over_limit() {
        let cache = HotCache::with_sweep_period(2, HOUR);
        cache.put("a", b"a".to_vec(), HOUR);
        cache.put("b", b"b".to_vec(), HOUR);
        cache.put("c", b"c".to_vec(), HOUR);
        assert_eq!(cache.len(), 3);

        // Over the limit: this put trims back to two before inserting
        cache.put("d", b"d".to_vec(), HOUR);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let cache = HotCache::new(0);
        for i in 0..50 {
            cache.put(format!("k{i}"), vec![0u8], HOUR);
        }
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 50);
    }

    #[test]
    fn test_get_refreshes_visit_time() {
        let cache = HotCache::new(10);
        cache.put("a", b"a".to_vec(), Duration::from_millis(300));

        sleep(Duration::from_millis(200));
        assert!(cache.get("a").is_some());
        sleep(Duration::from_millis(200));

        // 400ms since insert but only 200ms since the last visit
        assert_eq!(cache.sweep(), 0);
        assert!(cache.contains("a"));
    }

    proptest! {
        #[test]
        fn test_sweep_respects_limit(limit in 1usize..20, count in 0usize..60) {
            let cache = HotCache::with_sweep_period(limit, HOUR);
            for i in 0..count {
                cache.put(format!("k{i}"), vec![0u8; 4], HOUR);
            }
            cache.sweep();
            prop_assert!(cache.len() <= limit);
            prop_assert_eq!(cache.len(), count.min(limit));
        }
    }
}
