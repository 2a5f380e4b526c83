//! Cache engine
//!
//! Keyed store of cache blocks over one tmpfs directory. The engine reserves
//! each block's `alloc_size` against the configured capacity before the
//! block exists, evicting the least recently modified finished blocks to
//! make room. Blocks that close are dropped from the map so the next reader
//! builds a fresh one.

use crate::block::{CacheBlock, CacheState};
use crate::key::{CacheBlockKey, compute_alloc_size};
use crate::source::SourceReader;
use cubefs_common::{DataSource, Error, FlashNodeConfig, Result, unix_timestamp};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct CacheEngineConfig {
    /// tmpfs directory holding block files
    pub cache_path: PathBuf,
    pub total_capacity: u64,
    /// Power of two
    pub block_size: u64,
    /// Upper bound on hydration workers per block
    pub worker_max: usize,
}

impl From<&FlashNodeConfig> for CacheEngineConfig {
    fn from(config: &FlashNodeConfig) -> Self {
        Self {
            cache_path: config.cache_path.clone(),
            total_capacity: config.cache_total_capacity,
            block_size: config.cache_block_size,
            worker_max: config.cache_block_worker_max,
        }
    }
}

#[derive(Debug, Default)]
pub struct EngineStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub hydrations: AtomicU64,
    pub hydration_failures: AtomicU64,
    pub evictions: AtomicU64,
    /// Reads retried after their block closed
    pub closed_retries: AtomicU64,
}

/// Snapshot served on the flash node `/stat` endpoint
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub total_capacity: u64,
    pub reserved: u64,
    pub block_size: u64,
    pub blocks: usize,
    pub ready_blocks: usize,
    pub hydrating_blocks: usize,
    /// Block count per volume
    pub volumes: BTreeMap<String, usize>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct CacheEngine {
    config: CacheEngineConfig,
    reader: Arc<dyn SourceReader>,
    blocks: DashMap<String, Arc<CacheBlock>>,
    reserved: Mutex<u64>,
    stats: EngineStats,
}

impl CacheEngine {
    /// Open the engine over `config.cache_path`, removing block files a
    /// previous process left behind.
    pub fn open(config: CacheEngineConfig, reader: Arc<dyn SourceReader>) -> Result<Self> {
        if !config.block_size.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "cache block size {} is not a power of two",
                config.block_size
            )));
        }
        if config.worker_max == 0 {
            return Err(Error::Configuration(
                "cache block worker max must be positive".to_string(),
            ));
        }
        fs::create_dir_all(&config.cache_path)?;
        let mut stale = 0usize;
        for entry in fs::read_dir(&config.cache_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
            stale += 1;
        }
        info!(
            path = %config.cache_path.display(),
            capacity = config.total_capacity,
            block_size = config.block_size,
            stale,
            "cache engine opened"
        );
        Ok(Self {
            config,
            reader,
            blocks: DashMap::new(),
            reserved: Mutex::new(0),
            stats: EngineStats::default(),
        })
    }

    pub const fn config(&self) -> &CacheEngineConfig {
        &self.config
    }

    pub const fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn reserved(&self) -> u64 {
        *self.reserved.lock()
    }

    pub fn get(&self, key: &CacheBlockKey) -> Option<Arc<CacheBlock>> {
        self.blocks.get(&key.block_key()).map(|b| Arc::clone(b.value()))
    }

    /// Check that every source lies inside the key's block and return the
    /// bytes the block must reserve.
    fn alloc_size_for(&self, key: &CacheBlockKey, sources: &[DataSource]) -> Result<u64> {
        let block_size = self.config.block_size;
        if key.fixed_offset & (block_size - 1) != 0 {
            return Err(Error::param_mismatch(format!(
                "{key} is not aligned to {block_size}"
            )));
        }
        if sources.is_empty() {
            return Err(Error::param_mismatch(format!("{key} has no sources")));
        }
        for source in sources {
            let inside = source
                .file_offset
                .checked_sub(key.fixed_offset)
                .is_some_and(|local| local + source.size <= block_size);
            if !inside {
                return Err(Error::param_mismatch(format!(
                    "source at file offset {} size {} is outside {key}",
                    source.file_offset, source.size
                )));
            }
        }
        match compute_alloc_size(sources, block_size) {
            0 => Err(Error::param_mismatch(format!("{key} has an empty source"))),
            alloc => Ok(alloc),
        }
    }

    /// Existing block for `key`, or a new `New` block reserving space for
    /// `sources`. The flag is true when the block was created by this call.
    pub fn get_or_create(
        &self,
        key: &CacheBlockKey,
        sources: &[DataSource],
    ) -> Result<(Arc<CacheBlock>, bool)> {
        let block_key = key.block_key();
        if let Some(block) = self.blocks.get(&block_key).map(|b| Arc::clone(b.value())) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((block, false));
        }

        let alloc = self.alloc_size_for(key, sources)?;
        self.reserve(alloc)?;
        match self.blocks.entry(block_key) {
            Entry::Occupied(existing) => {
                let block = Arc::clone(existing.get());
                drop(existing);
                self.release(alloc);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok((block, false))
            }
            Entry::Vacant(slot) => {
                let block = Arc::new(CacheBlock::new(
                    &self.config.cache_path,
                    key.clone(),
                    self.config.block_size,
                    alloc,
                ));
                slot.insert(Arc::clone(&block));
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(%key, alloc, "cache block created");
                Ok((block, true))
            }
        }
    }

    /// Run the block's single hydration and drop it from the engine if it
    /// closed.
    pub async fn hydrate(&self, block: &Arc<CacheBlock>, sources: &[DataSource]) -> CacheState {
        let state = block
            .init_once(sources, &self.reader, self.config.worker_max)
            .await;
        if state == CacheState::Close {
            self.stats.hydration_failures.fetch_add(1, Ordering::Relaxed);
            if self.remove_block(block) {
                warn!(key = %block.key(), "cache block closed during hydration");
            }
        } else {
            self.stats.hydrations.fetch_add(1, Ordering::Relaxed);
        }
        state
    }

    fn spawn_hydration(self: &Arc<Self>, block: &Arc<CacheBlock>, sources: &[DataSource]) {
        let engine = Arc::clone(self);
        let block = Arc::clone(block);
        let sources = sources.to_vec();
        tokio::spawn(async move {
            engine.hydrate(&block, &sources).await;
        });
    }

    /// Read through the cache. A missing block is created and hydrated in
    /// the background; a block that closes under the reader is replaced once.
    /// Cancelling `cancel` abandons the wait; hydration carries on for the
    /// next reader.
    pub async fn read(
        self: &Arc<Self>,
        key: &CacheBlockKey,
        sources: &[DataSource],
        offset: u64,
        size: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<u8>> {
        let mut retried = false;
        loop {
            let (block, created) = self.get_or_create(key, sources)?;
            if created {
                self.spawn_hydration(&block, sources);
            }
            match block.read(offset, size, cancel).await {
                Err(Error::CacheClosed) => {
                    self.remove_block(&block);
                    if retried {
                        return Err(Error::CacheClosed);
                    }
                    retried = true;
                    self.stats.closed_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(%key, "cache block closed, retrying");
                }
                other => return other,
            }
        }
    }

    fn reserve(&self, size: u64) -> Result<()> {
        let capacity = self.config.total_capacity;
        if size > capacity {
            return Err(Error::InsufficientSpace {
                required: size,
                available: capacity,
            });
        }
        loop {
            let available = {
                let mut reserved = self.reserved.lock();
                if *reserved + size <= capacity {
                    *reserved += size;
                    return Ok(());
                }
                capacity - *reserved
            };
            if !self.evict_oldest() {
                return Err(Error::InsufficientSpace {
                    required: size,
                    available,
                });
            }
        }
    }

    fn release(&self, size: u64) {
        let mut reserved = self.reserved.lock();
        *reserved = reserved.saturating_sub(size);
    }

    /// Evict the least recently modified block that is not hydrating.
    fn evict_oldest(&self) -> bool {
        let victim = self
            .blocks
            .iter()
            .filter(|b| b.value().state() != CacheState::New)
            .min_by_key(|b| b.value().modify_time())
            .map(|b| Arc::clone(b.value()));
        let Some(victim) = victim else {
            return false;
        };
        if self.remove_block(&victim) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim.key(), "cache block evicted for space");
        }
        true
    }

    /// Drop this exact block from the map, release its reservation and
    /// delete its file. False if it was already gone.
    fn remove_block(&self, block: &Arc<CacheBlock>) -> bool {
        let removed = self
            .blocks
            .remove_if(block.block_key(), |_, b| Arc::ptr_eq(b, block))
            .is_some();
        if removed {
            self.release(block.alloc_size());
            if let Err(e) = block.delete() {
                warn!(key = %block.key(), error = %e, "cache block file removal failed");
            }
        }
        removed
    }

    /// Delete the block for `key`, if any.
    pub fn delete_block(&self, key: &CacheBlockKey) -> bool {
        self.get(key).is_some_and(|block| self.remove_block(&block))
    }

    fn evict_where(&self, pred: impl Fn(&CacheBlock) -> bool) -> usize {
        let victims: Vec<_> = self
            .blocks
            .iter()
            .filter(|b| pred(b.value().as_ref()))
            .map(|b| Arc::clone(b.value()))
            .collect();
        let evicted = victims.iter().filter(|b| self.remove_block(b)).count();
        self.stats
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Evict every block of `volume`.
    pub fn evict_volume(&self, volume: &str) -> usize {
        let evicted = self.evict_where(|b| b.key().volume == volume);
        info!(volume, evicted, "volume cache evicted");
        evicted
    }

    pub fn evict_all(&self) -> usize {
        let evicted = self.evict_where(|_| true);
        info!(evicted, "all cache evicted");
        evicted
    }

    /// Evict finished blocks not written for at least `ttl`.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let now = unix_timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        self.evict_where(|b| b.state() != CacheState::New && now - b.modify_time() >= ttl)
    }

    pub fn status(&self) -> CacheStatus {
        let mut status = CacheStatus {
            total_capacity: self.config.total_capacity,
            reserved: self.reserved(),
            block_size: self.config.block_size,
            blocks: 0,
            ready_blocks: 0,
            hydrating_blocks: 0,
            volumes: BTreeMap::new(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        };
        for entry in self.blocks.iter() {
            let block = entry.value();
            status.blocks += 1;
            match block.state() {
                CacheState::Ready => status.ready_blocks += 1,
                CacheState::New => status.hydrating_blocks += 1,
                CacheState::Close => {}
            }
            *status.volumes.entry(block.key().volume.clone()).or_default() += 1;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::tests::{PatternReader, expected};
    use crate::key::tests::source;
    use cubefs_common::CACHE_BLOCK_SIZE;

    const KIB: u64 = 1024;

    fn engine(root: &std::path::Path, capacity: u64, reader: Arc<PatternReader>) -> Arc<CacheEngine> {
        let config = CacheEngineConfig {
            cache_path: root.to_path_buf(),
            total_capacity: capacity,
            block_size: CACHE_BLOCK_SIZE,
            worker_max: 20,
        };
        Arc::new(CacheEngine::open(config, reader).unwrap())
    }

    /// Three extents, 1.5 MiB in total, filling the block from offset 0
    fn hydrate_sources() -> Vec<DataSource> {
        vec![
            source(11, 0, 512 * KIB),
            source(12, 512 * KIB, 512 * KIB),
            source(13, 1024 * KIB, 512 * KIB),
        ]
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_readers_one_hydration() {
        let dir = tempfile::tempdir().unwrap();
        let reader = Arc::new(PatternReader::delayed(Duration::from_millis(20)));
        let engine = engine(dir.path(), 64 * CACHE_BLOCK_SIZE, reader.clone());
        let key = CacheBlockKey::new("volA", 7, 0, 1);
        let sources = hydrate_sources();

        let (block, created) = engine.get_or_create(&key, &sources).unwrap();
        assert!(created);
        let mut readers = Vec::new();
        for _ in 0..16 {
            let block = Arc::clone(&block);
            readers.push(tokio::spawn(async move { block.read(0, 1536 * KIB, None).await }));
        }
        assert_eq!(engine.hydrate(&block, &sources).await, CacheState::Ready);

        let want = expected(&sources);
        assert_eq!(want.len() as u64, 1536 * KIB);
        for r in readers {
            assert_eq!(r.await.unwrap().unwrap(), want);
        }
        assert_eq!(reader.calls.load(Ordering::SeqCst), 3);
        assert_eq!(block.state(), CacheState::Ready);

        // later reads are served from the same block
        let again = engine.read(&key, &sources, 0, 1536 * KIB, None).await.unwrap();
        assert_eq!(again, want);
        assert_eq!(reader.calls.load(Ordering::SeqCst), 3);
        let status = engine.status();
        assert_eq!(status.blocks, 1);
        assert_eq!(status.ready_blocks, 1);
        assert_eq!(status.reserved, 1536 * KIB);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_engine_reads_share_block() {
        let dir = tempfile::tempdir().unwrap();
        let reader = Arc::new(PatternReader::delayed(Duration::from_millis(10)));
        let engine = engine(dir.path(), 64 * CACHE_BLOCK_SIZE, reader.clone());
        let key = CacheBlockKey::new("volA", 7, 0, 1);
        let sources = hydrate_sources();

        let mut readers = Vec::new();
        for i in 0..16u64 {
            let engine = Arc::clone(&engine);
            let key = key.clone();
            let sources = sources.clone();
            readers.push(tokio::spawn(async move {
                engine.read(&key, &sources, i * 4096, 4096, None).await
            }));
        }
        let want = expected(&sources);
        for (i, r) in readers.into_iter().enumerate() {
            let off = i * 4096;
            assert_eq!(r.await.unwrap().unwrap(), want[off..off + 4096]);
        }
        assert_eq!(reader.calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.stats().misses.load(Ordering::Relaxed), 1);
        assert_eq!(engine.stats().hits.load(Ordering::Relaxed), 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hydration_error_closes_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let reader = Arc::new(PatternReader::delayed(Duration::from_millis(10)));
        reader.fail_extent(11);
        let engine = engine(dir.path(), 64 * CACHE_BLOCK_SIZE, reader.clone());
        let key = CacheBlockKey::new("volA", 7, 0, 1);
        let sources = hydrate_sources();

        let (block, _) = engine.get_or_create(&key, &sources).unwrap();
        let mut readers = Vec::new();
        for _ in 0..16 {
            let block = Arc::clone(&block);
            readers.push(tokio::spawn(async move { block.read(0, 1536 * KIB, None).await }));
        }
        assert_eq!(engine.hydrate(&block, &sources).await, CacheState::Close);
        for r in readers {
            assert!(matches!(r.await.unwrap(), Err(Error::CacheClosed)));
        }
        assert!(engine.get(&key).is_none());
        let path = block.file_path();
        assert!(!path.exists() || fs::metadata(path).unwrap().len() == 0);
        assert_eq!(engine.reserved(), 0);

        // read-through retries once, then surfaces the close
        let err = engine.read(&key, &sources, 0, 4096, None).await.unwrap_err();
        assert!(matches!(err, Error::CacheClosed));
        assert!(engine.get(&key).is_none());
        assert_eq!(engine.stats().closed_retries.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_read_keeps_hydrating() {
        let dir = tempfile::tempdir().unwrap();
        let reader = Arc::new(PatternReader::delayed(Duration::from_millis(50)));
        let engine = engine(dir.path(), 64 * CACHE_BLOCK_SIZE, reader.clone());
        let key = CacheBlockKey::new("volA", 7, 0, 1);
        let sources = hydrate_sources();

        let cancel = CancellationToken::new();
        let waiting = {
            let engine = Arc::clone(&engine);
            let key = key.clone();
            let sources = sources.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.read(&key, &sources, 0, 4096, Some(&cancel)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(matches!(waiting.await.unwrap(), Err(Error::Cancelled)));
        assert!(engine.get(&key).is_some());

        let data = engine.read(&key, &sources, 0, 4096, None).await.unwrap();
        assert_eq!(data, expected(&sources)[..4096]);
        assert_eq!(reader.calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_ready_block() {
        let dir = tempfile::tempdir().unwrap();
        let reader = Arc::new(PatternReader::default());
        let engine = engine(dir.path(), 3 * 4096, reader);
        let sources = vec![source(1, 0, 4096)];

        for inode in 0..3 {
            let key = CacheBlockKey::new("volA", inode, 0, 1);
            engine.read(&key, &sources, 0, 4096, None).await.unwrap();
        }
        assert_eq!(engine.reserved(), 3 * 4096);

        let key = CacheBlockKey::new("volB", 9, 0, 1);
        engine.read(&key, &sources, 0, 4096, None).await.unwrap();
        assert_eq!(engine.status().blocks, 3);
        assert_eq!(engine.reserved(), 3 * 4096);
        assert_eq!(engine.stats().evictions.load(Ordering::Relaxed), 1);
        assert!(engine.get(&key).is_some());

        let big = vec![source(1, 0, 4 * 4096)];
        let err = engine
            .get_or_create(&CacheBlockKey::new("volC", 1, 0, 1), &big)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { .. }));
        assert_eq!(engine.status().blocks, 3);
    }

    #[tokio::test]
    async fn test_rejects_sources_outside_block() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 64 * CACHE_BLOCK_SIZE, Arc::new(PatternReader::default()));
        let key = CacheBlockKey::new("volA", 1, CACHE_BLOCK_SIZE, 1);

        let before = vec![source(1, 0, 4096)];
        assert!(matches!(engine.get_or_create(&key, &before), Err(Error::ParamMismatch(_))));
        let overflow = vec![source(1, 2 * CACHE_BLOCK_SIZE - 100, 200)];
        assert!(matches!(engine.get_or_create(&key, &overflow), Err(Error::ParamMismatch(_))));
        assert!(matches!(engine.get_or_create(&key, &[]), Err(Error::ParamMismatch(_))));
        let unaligned = CacheBlockKey::new("volA", 1, 4096, 1);
        assert!(matches!(
            engine.get_or_create(&unaligned, &[source(1, 4096, 10)]),
            Err(Error::ParamMismatch(_))
        ));

        // a source in the second block lands at its local offset
        let inside = vec![source(1, CACHE_BLOCK_SIZE, 100)];
        let data = engine.read(&key, &inside, 0, 100, None).await.unwrap();
        assert_eq!(data, expected(&inside));
        assert_eq!(engine.read(&key, &inside, 50, 4096, None).await.unwrap(), expected(&inside)[50..]);
    }

    #[tokio::test]
    async fn test_evict_volume_all_and_expired() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 64 * CACHE_BLOCK_SIZE, Arc::new(PatternReader::default()));
        let sources = vec![source(1, 0, 4096)];
        for (volume, inode) in [("volA", 1), ("volA", 2), ("volB", 1), ("volC", 1)] {
            let key = CacheBlockKey::new(volume, inode, 0, 1);
            engine.read(&key, &sources, 0, 10, None).await.unwrap();
        }
        assert_eq!(engine.status().volumes.get("volA"), Some(&2));

        assert_eq!(engine.evict_volume("volA"), 2);
        assert!(!dir.path().join(CacheBlockKey::new("volA", 1, 0, 1).block_key()).exists());
        assert_eq!(engine.evict_expired(Duration::from_secs(3600)), 0);
        assert_eq!(engine.evict_expired(Duration::ZERO), 2);
        assert_eq!(engine.status().blocks, 0);

        engine.read(&CacheBlockKey::new("volD", 1, 0, 1), &sources, 0, 10, None).await.unwrap();
        assert!(engine.delete_block(&CacheBlockKey::new("volD", 1, 0, 1)));
        assert!(!engine.delete_block(&CacheBlockKey::new("volD", 1, 0, 1)));
        engine.read(&CacheBlockKey::new("volE", 1, 0, 1), &sources, 0, 10, None).await.unwrap();
        assert_eq!(engine.evict_all(), 1);
        assert_eq!(engine.reserved(), 0);
    }

    #[test]
    fn test_open_clears_stale_blocks() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("volA")).unwrap();
        fs::write(dir.path().join("volA").join("7#0#1"), b"stale").unwrap();
        let _engine = engine(dir.path(), CACHE_BLOCK_SIZE, Arc::new(PatternReader::default()));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
