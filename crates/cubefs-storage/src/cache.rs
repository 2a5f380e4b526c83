//! Extent handle cache
//!
//! Keeps open extent files so reads and writes do not reopen them. Entries
//! are bounded by count and by idle time; evicted handles are passed to a
//! listener which closes them. A handle still held by a reader stays usable
//! after eviction and its descriptor is released with the last reference.

use crate::extent::Extent;
use cubefs_common::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SHARD_COUNT: usize = 16;

/// Called with every handle that leaves the cache
pub type EvictListener = Box<dyn Fn(u64, Arc<Extent>) + Send + Sync>;

struct CacheEntry {
    extent: Arc<Extent>,
    /// Logical clock for LRU ordering
    last_access: AtomicU64,
    /// Milliseconds since the cache epoch, for idle expiry
    last_access_ms: AtomicU64,
}

impl CacheEntry {
    fn touch(&self, clock: u64, now_ms: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub flushes: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

fn close_on_evict(extent_id: u64, extent: Arc<Extent>) {
    if let Err(e) = extent.close() {
        warn!(extent_id, error = %e, "failed to close evicted extent");
    }
}

/// LRU of open extent handles
pub struct ExtentCache {
    shards: Vec<RwLock<HashMap<u64, CacheEntry>>>,
    capacity: usize,
    ttl: Duration,
    len: AtomicUsize,
    clock: AtomicU64,
    epoch: Instant,
    listener: EvictListener,
    closed: AtomicBool,
    stats: CacheStats,
}

impl ExtentCache {
    /// Create a cache whose evictions close the handle
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::with_listener(capacity, ttl, Box::new(close_on_evict))
    }

    pub fn with_listener(capacity: usize, ttl: Duration, listener: EvictListener) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            capacity: capacity.max(1),
            ttl,
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            epoch: Instant::now(),
            listener,
            closed: AtomicBool::new(false),
            stats: CacheStats::default(),
        }
    }

    fn shard(&self, extent_id: u64) -> &RwLock<HashMap<u64, CacheEntry>> {
        &self.shards[(extent_id % SHARD_COUNT as u64) as usize]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, extent_id: u64) -> Option<Arc<Extent>> {
        let shard = self.shard(extent_id).read();
        if let Some(entry) = shard.get(&extent_id) {
            entry.touch(self.tick(), self.now_ms());
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(Arc::clone(&entry.extent))
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert a handle. If another handle for the same id is already cached
    /// that one is kept and returned, so callers always share one handle.
    pub fn put(&self, extent: Arc<Extent>) -> Arc<Extent> {
        let extent_id = extent.extent_id();
        let cached = {
            let mut shard = self.shard(extent_id).write();
            if let Some(existing) = shard.get(&extent_id) {
                Arc::clone(&existing.extent)
            } else {
                shard.insert(
                    extent_id,
                    CacheEntry {
                        extent: Arc::clone(&extent),
                        last_access: AtomicU64::new(self.tick()),
                        last_access_ms: AtomicU64::new(self.now_ms()),
                    },
                );
                self.len.fetch_add(1, Ordering::AcqRel);
                Arc::clone(&extent)
            }
        };
        while self.len() > self.capacity {
            match self.find_lru_entry(Some(extent_id)) {
                Some(victim) => {
                    if let Some(evicted) = self.remove(victim) {
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                        (self.listener)(victim, evicted);
                    }
                }
                None => break,
            }
        }
        cached
    }

    fn remove(&self, extent_id: u64) -> Option<Arc<Extent>> {
        let entry = self.shard(extent_id).write().remove(&extent_id)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(entry.extent)
    }

    /// Drop one handle and close it
    pub fn del(&self, extent_id: u64) {
        if let Some(extent) = self.remove(extent_id) {
            (self.listener)(extent_id, extent);
        }
    }

    fn find_lru_entry(&self, exclude: Option<u64>) -> Option<u64> {
        let mut lru: Option<(u64, u64)> = None;
        for shard in &self.shards {
            for (id, entry) in shard.read().iter() {
                if Some(*id) == exclude {
                    continue;
                }
                let access = entry.last_access.load(Ordering::Relaxed);
                if lru.is_none_or(|(_, min)| access < min) {
                    lru = Some((*id, access));
                }
            }
        }
        lru.map(|(id, _)| id)
    }

    /// Close handles idle for longer than the ttl
    pub fn evict_expired(&self) -> usize {
        let now = self.now_ms();
        let ttl = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        let mut evicted = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write();
            let expired: Vec<u64> = shard
                .iter()
                .filter(|(_, e)| now.saturating_sub(e.last_access_ms.load(Ordering::Relaxed)) > ttl)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(entry) = shard.remove(&id) {
                    evicted.push((id, entry.extent));
                }
            }
        }
        self.finish_eviction(evicted)
    }

    /// Close the oldest `ratio * len` handles
    pub fn force_evict(&self, ratio: f64) -> Result<usize> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(Error::param_mismatch(format!(
                "force evict ratio {ratio} outside (0, 1]"
            )));
        }
        let mut entries: Vec<(u64, u64)> = self
            .shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .iter()
                    .map(|(id, e)| (e.last_access.load(Ordering::Relaxed), *id))
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_unstable();
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let count = (((entries.len() as f64) * ratio) as usize).max(1);
        let evicted = entries
            .into_iter()
            .take(count)
            .filter_map(|(_, id)| {
                self.shard(id)
                    .write()
                    .remove(&id)
                    .map(|e| (id, e.extent))
            })
            .collect();
        Ok(self.finish_eviction(evicted))
    }

    fn finish_eviction(&self, evicted: Vec<(u64, Arc<Extent>)>) -> usize {
        let n = evicted.len();
        if n == 0 {
            return 0;
        }
        self.len.fetch_sub(n, Ordering::AcqRel);
        self.stats.evictions.fetch_add(n as u64, Ordering::Relaxed);
        for (id, extent) in evicted {
            (self.listener)(id, extent);
        }
        debug!(count = n, "evicted extent handles");
        n
    }

    /// fdatasync every cached handle with pending writes
    pub fn flush(&self) -> Result<usize> {
        let handles: Vec<Arc<Extent>> = self
            .shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .values()
                    .map(|e| Arc::clone(&e.extent))
                    .collect::<Vec<_>>()
            })
            .collect();
        let mut flushed = 0;
        for extent in handles {
            if extent.flush()? {
                flushed += 1;
            }
        }
        self.stats.flushes.fetch_add(flushed as u64, Ordering::Relaxed);
        Ok(flushed)
    }

    /// Drain and close every handle
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut drained = Vec::new();
        for shard in &self.shards {
            drained.extend(shard.write().drain());
        }
        self.len.store(0, Ordering::Release);
        for (id, entry) in drained {
            (self.listener)(id, entry.extent);
        }
    }
}
