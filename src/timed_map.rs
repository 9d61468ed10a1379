//! TTL-keyed cache with one eviction timer per entry.
//!
//! Expiry is enforced eagerly by the timer, never lazily on read: lookups
//! never consult the clock, so a key is visible exactly until its timer
//! fires or it is deleted.

use crate::timer::TimerHandle;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Slot<V> {
    value: V,
    /// Identifies which scheduled timer owns this entry. A timer whose
    /// generation no longer matches was superseded by a later `set` and
    /// must not evict.
    generation: u64,
    _timer: TimerHandle,
}

struct MapInner<K, V> {
    entries: HashMap<K, Slot<V>>,
    next_generation: u64,
}

/// Map from key to value where every entry auto-evicts after its TTL.
/// Overwriting a key cancels its previous timer and schedules a fresh one
/// from the time of the new call.
pub struct TimedMap<K, V> {
    inner: Arc<Mutex<MapInner<K, V>>>,
    default_ttl: Duration,
}

impl<K, V> Clone for TimedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            default_ttl: self.default_ttl,
        }
    }
}

impl<K, V> TimedMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    /// # Panics
    ///
    /// Panics if `default_ttl` is zero.
    pub fn new(default_ttl: Duration) -> Self {
        assert!(!default_ttl.is_zero(), "default_ttl must be non-zero");
        Self {
            inner: Arc::new(Mutex::new(MapInner {
                entries: HashMap::new(),
                next_generation: 0,
            })),
            default_ttl,
        }
    }

    /// Builds a map pre-populated with `entries`, each optionally carrying
    /// its own TTL override.
    pub fn with_entries<I>(default_ttl: Duration, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V, Option<Duration>)>,
    {
        let map = Self::new(default_ttl);
        for (key, value, ttl) in entries {
            map.set_with_ttl(key, value, ttl.unwrap_or(default_ttl));
        }
        map
    }

    /// Inserts or overwrites `key` with the default TTL.
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Inserts or overwrites `key`, scheduling eviction `ttl` from now.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let shared = self.inner.clone();
        let timer_key = key.clone();
        let timer = TimerHandle::once(ttl, move || {
            let mut inner = shared.lock().unwrap();
            let expired = inner
                .entries
                .get(&timer_key)
                .is_some_and(|slot| slot.generation == generation);
            if expired {
                inner.entries.remove(&timer_key);
            }
        });

        // Replacing the slot drops the previous entry's timer, cancelling it.
        inner.entries.insert(
            key,
            Slot {
                value,
                generation,
                _timer: timer,
            },
        );
    }

    pub fn has(&self, key: &K) -> bool {
        self.inner.lock().unwrap().entries.contains_key(key)
    }

    /// Removes `key` and cancels its timer; returns whether it existed.
    pub fn delete(&self, key: &K) -> bool {
        self.inner.lock().unwrap().entries.remove(key).is_some()
    }

    /// Cancels all timers and empties the map.
    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().unwrap().entries.keys().cloned().collect()
    }

    /// Visits every live entry. Mutating the map from inside `f` would
    /// deadlock; callers get a consistent view of the moment of the call.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        let inner = self.inner.lock().unwrap();
        for (k, slot) in &inner.entries {
            f(k, &slot.value);
        }
    }
}

impl<K, V> TimedMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(key)
            .map(|slot| slot.value.clone())
    }

    pub fn values(&self) -> Vec<V> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .map(|slot| slot.value.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|(k, slot)| (k.clone(), slot.value.clone()))
            .collect()
    }
}
