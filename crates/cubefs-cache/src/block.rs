//! Cache block
//!
//! A block is one tmpfs file holding up to `block_size` bytes of a file
//! starting at the key's fixed offset. Its life is a one-way state machine:
//!
//! ```text
//!   New ──hydrated──▶ Ready
//!    │                  │
//!    └──error/evict──▶ Close ◀──evict──┘
//! ```
//!
//! Readers wait while the block is `New`. Hydration runs at most once; its
//! workers share one cancellation token so the first failed source stops the
//! rest and the block closes without ever being readable.

use crate::key::CacheBlockKey;
use crate::source::{BlockSink, SourceReader};
use cubefs_common::{DataSource, Error, Result, unix_timestamp};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Sources queued ahead of the hydration workers
const SOURCE_QUEUE_DEPTH: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CacheState {
    New,
    Ready,
    Close,
}

type SourceQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<DataSource>>>;

#[derive(Debug)]
pub struct CacheBlock {
    key: CacheBlockKey,
    block_key: String,
    file_path: PathBuf,
    block_size: u64,
    /// Page-aligned bytes reserved for every source
    alloc_size: u64,
    /// Highest byte written so far
    used_size: AtomicU64,
    modify_time: AtomicI64,
    file: Mutex<Option<Arc<File>>>,
    state: watch::Sender<CacheState>,
    init: OnceCell<()>,
}

impl CacheBlock {
    pub fn new(root: &Path, key: CacheBlockKey, block_size: u64, alloc_size: u64) -> Self {
        let block_key = key.block_key();
        let (state, _) = watch::channel(CacheState::New);
        Self {
            file_path: root.join(&block_key),
            key,
            block_key,
            block_size,
            alloc_size,
            used_size: AtomicU64::new(0),
            modify_time: AtomicI64::new(unix_timestamp()),
            file: Mutex::new(None),
            state,
            init: OnceCell::new(),
        }
    }

    pub const fn key(&self) -> &CacheBlockKey {
        &self.key
    }

    pub fn block_key(&self) -> &str {
        &self.block_key
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub const fn alloc_size(&self) -> u64 {
        self.alloc_size
    }

    pub fn used_size(&self) -> u64 {
        self.used_size.load(Ordering::Acquire)
    }

    /// Unix seconds of the last write
    pub fn modify_time(&self) -> i64 {
        self.modify_time.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> CacheState {
        *self.state.borrow()
    }

    fn mark_ready(&self) {
        self.state.send_if_modified(|s| {
            if *s == CacheState::New {
                *s = CacheState::Ready;
                true
            } else {
                false
            }
        });
    }

    fn mark_close(&self) {
        self.state.send_if_modified(|s| {
            if *s == CacheState::Close {
                false
            } else {
                *s = CacheState::Close;
                true
            }
        });
    }

    fn file(&self) -> Result<Arc<File>> {
        self.file.lock().clone().ok_or(Error::CacheClosed)
    }

    /// Create the block file. Fails if it already exists or the block was
    /// closed before hydration started.
    fn open_file(&self) -> Result<()> {
        let mut slot = self.file.lock();
        if self.state() == CacheState::Close {
            return Err(Error::CacheClosed);
        }
        if let Some(dir) = self.file_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.file_path)?;
        *slot = Some(Arc::new(file));
        self.used_size.store(0, Ordering::Release);
        self.modify_time.store(unix_timestamp(), Ordering::Relaxed);
        debug!(block = %self.block_key, "cache block file created");
        Ok(())
    }

    /// Hydrate the block from `sources` unless that already happened.
    /// Concurrent callers wait for the single run; returns the final state.
    pub async fn init_once(
        self: &Arc<Self>,
        sources: &[DataSource],
        reader: &Arc<dyn SourceReader>,
        worker_max: usize,
    ) -> CacheState {
        self.init
            .get_or_init(|| self.hydrate(sources, reader, worker_max))
            .await;
        self.state()
    }

    async fn hydrate(
        self: &Arc<Self>,
        sources: &[DataSource],
        reader: &Arc<dyn SourceReader>,
        worker_max: usize,
    ) {
        if let Err(e) = self.open_file() {
            error!(block = %self.block_key, error = %e, "cache block init failed");
            self.mark_close();
            return;
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(SOURCE_QUEUE_DEPTH);
        let queue: SourceQueue = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = JoinSet::new();
        for _ in 0..worker_max.min(sources.len()) {
            workers.spawn(Arc::clone(self).prepare_sources(
                Arc::clone(reader),
                Arc::clone(&queue),
                cancel.clone(),
            ));
        }
        for source in sources {
            tokio::select! {
                () = cancel.cancelled() => break,
                sent = tx.send(source.clone()) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(block = %self.block_key, error = %e, "hydration worker aborted");
                cancel.cancel();
            }
        }
        if cancel.is_cancelled() {
            warn!(block = %self.block_key, "cache block hydration cancelled");
            self.mark_close();
        } else {
            debug!(block = %self.block_key, used = self.used_size(), "cache block ready");
            self.mark_ready();
        }
    }

    /// Worker loop: take sources off the queue and stream them into the
    /// block until the queue drains or another worker fails.
    async fn prepare_sources(
        self: Arc<Self>,
        reader: Arc<dyn SourceReader>,
        queue: SourceQueue,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return,
                next = async { queue.lock().await.recv().await } => next,
            };
            let Some(source) = next else {
                return;
            };
            let local_offset = source.file_offset & (self.block_size - 1);
            let mut sink = BlockSink::new(&self, local_offset);
            let read = tokio::select! {
                () = cancel.cancelled() => return,
                read = reader.read_source(&source, &mut sink) => read,
            };
            if let Err(e) = read {
                error!(
                    block = %self.block_key,
                    partition_id = source.partition_id,
                    extent_id = source.extent_id,
                    extent_offset = source.extent_offset,
                    size = source.size,
                    local_offset,
                    error = %e,
                    "read source failed"
                );
                cancel.cancel();
                return;
            }
        }
    }

    /// Write `data` at `offset` inside the block.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let size = data.len() as u64;
        if size == 0 || offset >= self.alloc_size || offset + size > self.alloc_size {
            return Err(Error::param_mismatch(format!(
                "offset={offset} size={size} allocSize={}",
                self.alloc_size
            )));
        }
        let file = self.file()?;
        file.write_all_at(data, offset)?;
        self.modify_time.store(unix_timestamp(), Ordering::Relaxed);
        self.used_size.fetch_max(offset + size, Ordering::AcqRel);
        Ok(())
    }

    /// Wait for hydration to finish, then read up to `size` bytes at
    /// `offset`. The result is shorter than `size` when the block holds
    /// fewer bytes past `offset`. Cancelling `cancel` abandons the wait
    /// without touching the block.
    pub async fn read(
        &self,
        offset: u64,
        size: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<u8>> {
        self.wait_ready(cancel).await?;
        let used = self.used_size();
        if offset >= self.alloc_size || offset > used {
            return Err(Error::range_invalid(format!(
                "offset={offset} allocSize={} usedSize={used}",
                self.alloc_size
            )));
        }
        let len = (used - offset).min(size);
        if len < size {
            debug!(block = %self.block_key, offset, size, used, "read past cached bytes");
        }
        let file = self.file()?;
        let len = usize::try_from(len).map_err(|e| Error::range_invalid(e.to_string()))?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    async fn wait_ready(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let mut rx = self.state.subscribe();
        let settled = async {
            rx.wait_for(|s| *s != CacheState::New)
                .await
                .map(|s| *s)
                .map_err(|_| Error::CacheClosed)
        };
        let state = match cancel {
            Some(cancel) => tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                state = settled => state?,
            },
            None => settled.await?,
        };
        match state {
            CacheState::Ready => Ok(()),
            _ => Err(Error::CacheClosed),
        }
    }

    /// Close the block, waking every waiting reader, and remove its file.
    pub fn delete(&self) -> Result<()> {
        let mut slot = self.file.lock();
        self.mark_close();
        slot.take();
        match fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::key::tests::source;
    use async_trait::async_trait;
    use cubefs_common::CACHE_BLOCK_SIZE;
    use std::collections::HashSet;
    use std::time::Duration;

    const CHUNK: usize = 128 * 1024;

    /// Byte stored at `pos` of an extent
    pub(crate) fn pattern(extent_id: u64, pos: u64) -> u8 {
        ((extent_id + pos) % 251) as u8
    }

    /// Expected block bytes for `sources`, assumed contiguous from 0
    pub(crate) fn expected(sources: &[DataSource]) -> Vec<u8> {
        sources
            .iter()
            .flat_map(|s| (0..s.size).map(move |i| pattern(s.extent_id, s.extent_offset + i)))
            .collect()
    }

    /// Serves a byte pattern per extent in chunks, counting reads.
    #[derive(Default)]
    pub(crate) struct PatternReader {
        pub calls: AtomicU64,
        pub failing: Mutex<HashSet<u64>>,
        pub delay: Duration,
    }

    impl PatternReader {
        pub(crate) fn delayed(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub(crate) fn fail_extent(&self, extent_id: u64) {
            self.failing.lock().insert(extent_id);
        }
    }

    #[async_trait]
    impl SourceReader for PatternReader {
        async fn read_source(&self, source: &DataSource, sink: &mut BlockSink<'_>) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.lock().contains(&source.extent_id) {
                return Err(Error::PeerUnreachable("no replica answered".into()));
            }
            let data: Vec<u8> = (0..source.size)
                .map(|i| pattern(source.extent_id, source.extent_offset + i))
                .collect();
            for chunk in data.chunks(CHUNK) {
                sink.write(chunk)?;
            }
            Ok(source.size)
        }
    }

    fn new_block(root: &Path, sources: &[DataSource]) -> Arc<CacheBlock> {
        let alloc = crate::key::compute_alloc_size(sources, CACHE_BLOCK_SIZE);
        let key = CacheBlockKey::new("volA", 7, 0, 1);
        Arc::new(CacheBlock::new(root, key, CACHE_BLOCK_SIZE, alloc))
    }

    #[test]
    fn test_write_at_checks_alloc_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let block = new_block(dir.path(), &[source(1, 0, 8192)]);
        assert!(matches!(block.write_at(&[1u8; 10], 0), Err(Error::CacheClosed)));
        block.open_file().unwrap();
        assert!(block.open_file().is_err());

        block.write_at(&[1u8; 4096], 4096).unwrap();
        assert_eq!(block.used_size(), 8192);
        block.write_at(&[2u8; 100], 0).unwrap();
        assert_eq!(block.used_size(), 8192);
        assert!(matches!(block.write_at(&[1u8; 2], 8191), Err(Error::ParamMismatch(_))));
        assert!(matches!(block.write_at(&[1u8; 1], 8192), Err(Error::ParamMismatch(_))));
        assert!(matches!(block.write_at(&[], 0), Err(Error::ParamMismatch(_))));
        assert!(block.file_path().starts_with(dir.path().join("volA")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_wait_for_hydration() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![source(1, 0, 300_000), source(2, 300_000, 200_000)];
        let block = new_block(dir.path(), &sources);
        let concrete = Arc::new(PatternReader::delayed(Duration::from_millis(20)));
        let reader: Arc<dyn SourceReader> = concrete.clone();

        let mut readers = Vec::new();
        for _ in 0..4 {
            let block = Arc::clone(&block);
            readers.push(tokio::spawn(async move { block.read(0, 500_000, None).await }));
        }
        assert_eq!(block.state(), CacheState::New);
        assert_eq!(block.init_once(&sources, &reader, 20).await, CacheState::Ready);
        let want = expected(&sources);
        for r in readers {
            assert_eq!(r.await.unwrap().unwrap(), want);
        }

        // second init is a no-op
        assert_eq!(block.init_once(&sources, &reader, 20).await, CacheState::Ready);
        assert_eq!(concrete.calls.load(Ordering::SeqCst), 2);

        // clamped and invalid ranges
        assert_eq!(block.read(499_990, 100, None).await.unwrap(), want[499_990..]);
        assert!(block.read(500_000, 10, None).await.unwrap().is_empty());
        assert!(matches!(block.read(500_001, 10, None).await, Err(Error::RangeInvalid(_))));
        assert!(matches!(block.read(block.alloc_size(), 1, None).await, Err(Error::RangeInvalid(_))));
    }

    #[tokio::test]
    async fn test_failed_source_closes_block() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![source(1, 0, 4096), source(2, 4096, 4096), source(3, 8192, 4096)];
        let block = new_block(dir.path(), &sources);
        let concrete = Arc::new(PatternReader::default());
        concrete.fail_extent(2);
        let reader: Arc<dyn SourceReader> = concrete;

        assert_eq!(block.init_once(&sources, &reader, 1).await, CacheState::Close);
        assert!(matches!(block.read(0, 10, None).await, Err(Error::CacheClosed)));
        // Close never reverts
        block.mark_ready();
        assert_eq!(block.state(), CacheState::Close);
    }

    #[tokio::test]
    async fn test_delete_wakes_readers_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![source(1, 0, 4096)];
        let block = new_block(dir.path(), &sources);
        block.open_file().unwrap();
        let waiting = {
            let block = Arc::clone(&block);
            tokio::spawn(async move { block.read(0, 4096, None).await })
        };
        tokio::task::yield_now().await;
        block.delete().unwrap();
        assert!(matches!(waiting.await.unwrap(), Err(Error::CacheClosed)));
        assert!(!block.file_path().exists());
        block.delete().unwrap();

        // a closed block cannot be hydrated afterwards
        let reader: Arc<dyn SourceReader> = Arc::new(PatternReader::default());
        assert_eq!(block.init_once(&sources, &reader, 4).await, CacheState::Close);
        assert!(!block.file_path().exists());
    }

    #[tokio::test]
    async fn test_cancelled_reader_leaves_block_new() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![source(1, 0, 4096)];
        let block = new_block(dir.path(), &sources);
        let cancel = CancellationToken::new();
        let waiting = {
            let block = Arc::clone(&block);
            let cancel = cancel.clone();
            tokio::spawn(async move { block.read(0, 4096, Some(&cancel)).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(waiting.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(block.state(), CacheState::New);

        // the block still hydrates and serves later readers
        let reader: Arc<dyn SourceReader> = Arc::new(PatternReader::default());
        assert_eq!(block.init_once(&sources, &reader, 4).await, CacheState::Ready);
        assert_eq!(block.read(0, 4096, None).await.unwrap(), expected(&sources));
    }
}
