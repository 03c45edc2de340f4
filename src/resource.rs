//! Process-wide iterator resource cache.
//!
//! Two registries keyed by a *stamp* (the SET substring of a frozen
//! cursor):
//!
//! - **Storables**: byte-bounded LRU of ISA dedup caches that survive
//!   request boundaries. Eviction is deferred while anyone still holds the
//!   entry (the `Arc` count tells us), so a linked storable never vanishes
//!   mid-use.
//! - **Originals**: weak references to live shared iterator state, letting
//!   a thaw re-bind to a still-live original and inherit its statistics
//!   and caches. Dead entries are pruned on sight.
//!
//! A transient gauge tracks bytes held by caches that are not (yet)
//! registered, so memory pressure is visible before the first freeze.

use crate::iter::{AndShared, IsaCache, IsaShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Weak handle to a live original's shared state.
#[derive(Debug, Clone)]
pub enum Original {
    And(Weak<Mutex<AndShared>>),
    Isa(Weak<Mutex<IsaShared>>),
}

/// Strong handle produced by a successful rebind.
#[derive(Debug, Clone)]
pub enum LiveOriginal {
    And(Arc<Mutex<AndShared>>),
    Isa(Arc<Mutex<IsaShared>>),
}

/// Cache observability counters: cheap to read, monotone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub transient_bytes: isize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Entry {
    cache: Arc<Mutex<IsaCache>>,
    bytes: usize,
    used: u64,
}

#[derive(Default)]
struct Inner {
    storables: HashMap<String, Entry>,
    originals: HashMap<String, Original>,
    tick: u64,
    bytes: usize,
    transient: isize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct ResourceCache {
    inner: Mutex<Inner>,
    cap: usize,
}

impl ResourceCache {
    pub fn new(cap_bytes: usize) -> Self {
        ResourceCache {
            inner: Mutex::new(Inner::default()),
            cap: cap_bytes,
        }
    }

    /// Insert or refresh a storable under its stamp, then enforce the byte
    /// cap.
    pub fn store_cache(&self, stamp: &str, cache: Arc<Mutex<IsaCache>>) {
        let bytes = cache.lock().byte_size();
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(old) = inner.storables.insert(
            stamp.to_string(),
            Entry {
                cache,
                bytes,
                used: tick,
            },
        ) {
            inner.bytes -= old.bytes;
        }
        inner.bytes += bytes;
        self.evict_over_cap(&mut inner);
    }

    /// Link (take a strong reference to) a storable by stamp.
    pub fn link_cache(&self, stamp: &str) -> Option<Arc<Mutex<IsaCache>>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(entry) = inner.storables.get_mut(stamp) {
            entry.used = tick;
            let cache = Arc::clone(&entry.cache);
            inner.hits += 1;
            Some(cache)
        } else {
            inner.misses += 1;
            None
        }
    }

    /// Refresh a registered storable's byte accounting.
    pub fn account(&self, stamp: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.storables.get_mut(stamp) {
            let bytes = entry.cache.lock().byte_size();
            let old = entry.bytes;
            entry.bytes = bytes;
            inner.bytes = inner.bytes + bytes - old;
            self.evict_over_cap(&mut inner);
        }
    }

    pub fn register_original(&self, stamp: &str, original: Original) {
        let mut inner = self.inner.lock();
        inner.originals.insert(stamp.to_string(), original);
    }

    /// Rebind to a live original; dead registrations are pruned here.
    pub fn find_original(&self, stamp: &str) -> Option<LiveOriginal> {
        let mut inner = self.inner.lock();
        let live = match inner.originals.get(stamp) {
            Some(Original::And(w)) => w.upgrade().map(LiveOriginal::And),
            Some(Original::Isa(w)) => w.upgrade().map(LiveOriginal::Isa),
            None => None,
        };
        match &live {
            Some(_) => inner.hits += 1,
            None => {
                inner.originals.remove(stamp);
                inner.misses += 1;
            }
        }
        live
    }

    /// Bytes held by not-yet-registered caches.
    pub fn publish_transient(&self, delta: isize) {
        self.inner.lock().transient += delta;
    }

    /// Drop everything. Thaw then sees only lost state and must recover by
    /// replay; tests lean on this.
    pub fn evict_all(&self) {
        let mut inner = self.inner.lock();
        inner.evictions += inner.storables.len() as u64;
        inner.storables.clear();
        inner.originals.clear();
        inner.bytes = 0;
    }

    pub fn stats(&self) -> ResourceCacheStats {
        let inner = self.inner.lock();
        ResourceCacheStats {
            entries: inner.storables.len(),
            bytes: inner.bytes,
            transient_bytes: inner.transient,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Evict least-recently-used unreferenced entries until under the cap.
    /// Entries somebody still links are skipped; eviction is deferred, not
    /// forced.
    fn evict_over_cap(&self, inner: &mut Inner) {
        while inner.bytes > self.cap {
            let victim = inner
                .storables
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.cache) == 1)
                .min_by_key(|(_, e)| e.used)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    if let Some(e) = inner.storables.remove(&k) {
                        inner.bytes -= e.bytes;
                        inner.evictions += 1;
                        tracing::debug!(stamp = %k, bytes = e.bytes, "evicted storable");
                    }
                }
                None => break,
            }
        }
    }
}
