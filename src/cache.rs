//! Result cache: fingerprint → finished artifact.
//!
//! Entries expire on a hard TTL measured from creation **and** from the last
//! access, so an output stays reusable while it is in demand but never
//! outlives the TTL after its templates may have changed. Beyond that the
//! cache is bounded by entry count and total artifact bytes, evicting the
//! least recently used entry first (older `created_at` loses ties).
//!
//! All state sits behind one mutex: a lookup sees an entry either fully
//! present or fully gone. Each entry owns an [`ArtifactPin`], so a cached
//! artifact cannot be swept from the store; evicted pins are released after
//! the lock is dropped.

use crate::config::SchedulerConfig;
use crate::fingerprint::Fingerprint;
use crate::store::ArtifactPin;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

struct CacheEntry {
    pin: ArtifactPin,
    size_bytes: u64,
    created_at: Instant,
    last_accessed_at: Instant,
}

impl CacheEntry {
    fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
            || now.saturating_duration_since(self.last_accessed_at) > ttl
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<Fingerprint, CacheEntry>,
    total_bytes: u64,
}

impl Entries {
    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<ArtifactPin> {
        let entry = self.map.remove(fingerprint)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry.pin)
    }

    fn least_recently_used(&self) -> Option<Fingerprint> {
        self.map
            .iter()
            .min_by_key(|(_, e)| (e.last_accessed_at, e.created_at))
            .map(|(fp, _)| *fp)
    }
}

/// Thread-safe TTL + LRU cache of build results.
pub struct ResultCache {
    entries: Mutex<Entries>,
    ttl: Duration,
    max_entries: usize,
    max_bytes: u64,
}

impl ResultCache {
    pub fn new(ttl: Duration, max_entries: usize, max_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            ttl,
            max_entries: max_entries.max(1),
            max_bytes,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.cache_ttl,
            config.cache_max_entries,
            config.cache_max_bytes,
        )
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a fresh entry and refresh its access time.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<ArtifactPin> {
        self.get_at(fingerprint, Instant::now())
    }

    /// Insert or replace the entry for `fingerprint`, then enforce the budget.
    pub fn put(&self, fingerprint: Fingerprint, pin: ArtifactPin) {
        self.put_at(fingerprint, pin, Instant::now());
    }

    /// Drop every stale entry. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn clear(&self) {
        let drained: Vec<CacheEntry> = {
            let mut entries = self.lock();
            entries.total_bytes = 0;
            entries.map.drain().map(|(_, e)| e).collect()
        };
        debug!("Cleared result cache ({} entries)", drained.len());
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_at(&self, fingerprint: &Fingerprint, now: Instant) -> Option<ArtifactPin> {
        let mut entries = self.lock();
        let entry = entries.map.get_mut(fingerprint)?;
        if !entry.is_stale(now, self.ttl) {
            entry.last_accessed_at = now;
            return Some(entry.pin.clone());
        }
        let stale = entries.remove(fingerprint);
        drop(entries);
        debug!("Cache entry {}: stale, dropped", fingerprint.short());
        drop(stale);
        None
    }

    fn put_at(&self, fingerprint: Fingerprint, pin: ArtifactPin, now: Instant) {
        let size_bytes = pin.size_bytes();
        let mut released = Vec::new();
        {
            let mut entries = self.lock();
            released.extend(entries.remove(&fingerprint));
            entries.map.insert(
                fingerprint,
                CacheEntry {
                    pin,
                    size_bytes,
                    created_at: now,
                    last_accessed_at: now,
                },
            );
            entries.total_bytes += size_bytes;

            while entries.map.len() > self.max_entries || entries.total_bytes > self.max_bytes {
                let Some(victim) = entries.least_recently_used() else {
                    break;
                };
                released.extend(entries.remove(&victim));
                debug!("Cache entry {}: evicted over budget", victim.short());
            }
        }
        drop(released);
    }

    fn evict_expired_at(&self, now: Instant) -> usize {
        let released: Vec<ArtifactPin> = {
            let mut entries = self.lock();
            let stale: Vec<Fingerprint> = entries
                .map
                .iter()
                .filter(|(_, e)| e.is_stale(now, self.ttl))
                .map(|(fp, _)| *fp)
                .collect();
            stale.iter().filter_map(|fp| entries.remove(fp)).collect()
        };
        if !released.is_empty() {
            debug!("Evicted {} expired cache entries", released.len());
        }
        released.len()
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .field("max_bytes", &self.max_bytes)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArtifactStore;

    const TTL: Duration = Duration::from_secs(60);

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::of_bytes(tag.as_bytes())
    }

    fn pin(store: &ArtifactStore, body: &str) -> ArtifactPin {
        store
            .store(format!("%PDF-1.7 {body}").into_bytes(), None)
            .unwrap()
    }

    #[test]
    fn hit_returns_the_stored_artifact() {
        let store = ArtifactStore::in_memory();
        let cache = ResultCache::new(TTL, 8, u64::MAX);
        let p = pin(&store, "a");
        let reference = p.reference();
        cache.put(fp("a"), p);

        let hit = cache.get(&fp("a")).unwrap();
        assert_eq!(hit.reference(), reference);
        assert!(cache.get(&fp("b")).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entries_expire_after_ttl_even_when_accessed() {
        let store = ArtifactStore::in_memory();
        let cache = ResultCache::new(TTL, 8, u64::MAX);
        let t0 = Instant::now();
        cache.put_at(fp("a"), pin(&store, "a"), t0);

        // Frequent access keeps the idle clock fresh, but not the age.
        assert!(cache.get_at(&fp("a"), t0 + Duration::from_secs(30)).is_some());
        assert!(cache.get_at(&fp("a"), t0 + Duration::from_secs(59)).is_some());
        assert!(cache.get_at(&fp("a"), t0 + Duration::from_secs(61)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_entry_releases_its_pin() {
        let store = ArtifactStore::in_memory();
        let cache = ResultCache::new(TTL, 8, u64::MAX);
        let t0 = Instant::now();
        let p = pin(&store, "a");
        let reference = p.reference();
        cache.put_at(fp("a"), p, t0);
        assert_eq!(store.pins(&reference), 1);

        assert_eq!(cache.evict_expired_at(t0 + TTL * 2), 1);
        assert_eq!(store.pins(&reference), 0);
        assert_eq!(store.sweep(), 1);
    }

    #[test]
    fn lru_eviction_over_entry_budget() {
        let store = ArtifactStore::in_memory();
        let cache = ResultCache::new(TTL, 2, u64::MAX);
        let t0 = Instant::now();
        cache.put_at(fp("a"), pin(&store, "a"), t0);
        cache.put_at(fp("b"), pin(&store, "b"), t0 + Duration::from_secs(1));
        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get_at(&fp("a"), t0 + Duration::from_secs(2)).is_some());
        cache.put_at(fp("c"), pin(&store, "c"), t0 + Duration::from_secs(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get_at(&fp("a"), t0 + Duration::from_secs(4)).is_some());
        assert!(cache.get_at(&fp("b"), t0 + Duration::from_secs(4)).is_none());
        assert!(cache.get_at(&fp("c"), t0 + Duration::from_secs(4)).is_some());
    }

    #[test]
    fn lru_ties_break_on_created_at() {
        let store = ArtifactStore::in_memory();
        let cache = ResultCache::new(TTL, 2, u64::MAX);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let t2 = t0 + Duration::from_secs(2);
        cache.put_at(fp("old"), pin(&store, "old"), t0);
        cache.put_at(fp("new"), pin(&store, "new"), t1);
        // Same access instant for both: the older entry must go.
        assert!(cache.get_at(&fp("old"), t2).is_some());
        assert!(cache.get_at(&fp("new"), t2).is_some());
        cache.put_at(fp("third"), pin(&store, "third"), t2);

        let t3 = t0 + Duration::from_secs(3);
        assert!(cache.get_at(&fp("old"), t3).is_none());
        assert!(cache.get_at(&fp("new"), t3).is_some());
    }

    #[test]
    fn byte_budget_is_enforced() {
        let store = ArtifactStore::in_memory();
        let a = pin(&store, "aaaa");
        let size = a.size_bytes();
        let cache = ResultCache::new(TTL, 100, size * 2);
        let t0 = Instant::now();
        cache.put_at(fp("a"), a, t0);
        cache.put_at(fp("b"), pin(&store, "bbbb"), t0 + Duration::from_secs(1));
        assert_eq!(cache.total_bytes(), size * 2);

        cache.put_at(fp("c"), pin(&store, "cccc"), t0 + Duration::from_secs(2));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), size * 2);
        assert!(cache.get_at(&fp("a"), t0 + Duration::from_secs(3)).is_none());
    }

    #[test]
    fn replace_keeps_byte_total_consistent() {
        let store = ArtifactStore::in_memory();
        let cache = ResultCache::new(TTL, 8, u64::MAX);
        cache.put(fp("a"), pin(&store, "first"));
        cache.put(fp("a"), pin(&store, "second"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), "%PDF-1.7 second".len() as u64);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
        assert_eq!(store.sweep(), 2);
    }
}
