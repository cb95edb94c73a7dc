//! Bounded in-memory cache with per-entry TTL.
//!
//! Backs the protocol's replay maps (receipt nonces, envelope nonces) and
//! the DNS pin cache. Capacity and TTL are injection points so tests can
//! shrink both. Expired entries are reported absent on `get`; eviction of
//! the backlog happens opportunistically via [`TtlCache::sweep`] and on
//! moka's own housekeeping.

use moka::{policy::Expiry, sync::Cache};
use std::{
    hash::Hash,
    sync::Arc,
    time::{Duration, Instant},
};

/// A bounded cache whose entries expire after a per-entry TTL.
pub struct TtlCache<K, V> {
    inner: Cache<K, Arc<(V, Option<Duration>)>>,
    default_ttl: Option<Duration>,
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A cache holding at most `max_capacity` entries, each expiring
    /// `default_ttl` after insertion.
    pub fn new(max_capacity: u64, default_ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(EntryTtl)
                .build(),
            default_ttl: Some(default_ttl),
        }
    }

    /// A capacity-bounded cache whose entries never expire by time.
    pub fn bounded(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(EntryTtl)
                .build(),
            default_ttl: None,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|entry| entry.0.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, Arc::new((value, self.default_ttl)));
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.inner.insert(key, Arc::new((value, Some(ttl))));
    }

    /// Inserts only if the key is absent. Returns `true` when this call
    /// created the entry. The check and the insert are a single atomic
    /// operation, which is what makes the replay caches race-free.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let ttl = self.default_ttl;
        self.inner
            .entry(key)
            .or_insert_with(|| Arc::new((value, ttl)))
            .is_fresh()
    }

    /// Like [`Self::insert_if_absent`] with an explicit TTL for the entry.
    pub fn insert_if_absent_with_ttl(&self, key: K, value: V, ttl: Duration) -> bool {
        self.inner
            .entry(key)
            .or_insert_with(|| Arc::new((value, Some(ttl))))
            .is_fresh()
    }

    pub fn remove(&self, key: &K) {
        self.inner.invalidate(key);
    }

    /// Runs pending housekeeping (evictions of expired entries). Cheap;
    /// callers on verify paths invoke it opportunistically.
    pub fn sweep(&self) {
        self.inner.run_pending_tasks();
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

struct EntryTtl;

impl<K, V> Expiry<K, Arc<(V, Option<Duration>)>> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &Arc<(V, Option<Duration>)>,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.1
    }
}
