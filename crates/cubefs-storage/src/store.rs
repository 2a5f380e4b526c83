//! Extent store
//!
//! Partition-scoped owner of every extent file. Ties together the info store
//! (sizes and CRCs), the handle cache, the verify file, the tiny-delete
//! journal, the recently-deleted table and the tiny extent arbiter, and
//! allocates normal extent ids.

use crate::cache::{CacheStats, ExtentCache};
use crate::extent::{BlockCrc, Extent, WriteMode};
use crate::info_store::ExtentInfoStore;
use crate::raw_io;
use crate::recent_delete::RecentDeleteTable;
use crate::tiny_arbiter::TinyExtentArbiter;
use crate::tiny_delete::TinyDeleteJournal;
use crate::verify::VerifyFile;
use cubefs_common::{
    BLOCK_SIZE, EXTENT_MAX_SIZE, Error, ExtentInfo, ExtentKind, MIN_EXTENT_ID, Result, TINY_EXTENT_COUNT,
    is_tiny_extent, tiny_extent_ids, unix_timestamp,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const EXTENT_META_FILE_NAME: &str = "EXTENT_META";

/// Ids skipped on reopen; covers allocations whose persist did not land
const BASE_ID_RELOAD_GAP: u64 = 1000;

const WATERMARK_RECORD_SIZE: usize = 16;
const EXTENT_INFO_RECORD_SIZE: usize = 20;

/// Normal extents younger than this are still being written and stay out of
/// replica comparison
const NORMAL_FILTER_IDLE_SECS: i64 = 10;

/// Idle time before a normal extent's CRC is computed in the background
const CRC_AUTOCOMPUTE_IDLE_SECS: i64 = 600;

/// Predicate over info entries used by watermark queries
pub type ExtentFilter = Box<dyn Fn(&ExtentInfo) -> bool + Send + Sync>;

/// Normal extents that have data and have been idle long enough to compare
pub fn normal_extent_filter() -> ExtentFilter {
    Box::new(|e| {
        !is_tiny_extent(e.file_id)
            && e.size > 0
            && unix_timestamp() - e.modify_time > NORMAL_FILTER_IDLE_SECS
    })
}

/// The given tiny extents
pub fn tiny_extent_filter(ids: impl IntoIterator<Item = u64>) -> ExtentFilter {
    let ids: HashSet<u64> = ids.into_iter().collect();
    Box::new(move |e| is_tiny_extent(e.file_id) && ids.contains(&e.file_id))
}

/// Extent store configuration
#[derive(Clone, Debug)]
pub struct ExtentStoreConfig {
    pub data_path: PathBuf,
    pub partition_id: u64,
    /// Capacity in bytes; 0 means unbounded
    pub store_size: u64,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub tiny_extent_count: u64,
    /// Ids between verify file pre-allocations
    pub base_id_persist_step: u64,
    /// Allocations between fsyncs of the meta file
    pub base_id_sync_step: u64,
    pub recent_delete_ttl: Duration,
    /// True for a partition created just now; it has nothing to load
    pub is_create: bool,
}

impl ExtentStoreConfig {
    pub fn new(data_path: impl Into<PathBuf>, partition_id: u64) -> Self {
        Self {
            data_path: data_path.into(),
            partition_id,
            store_size: 0,
            cache_capacity: 1024,
            cache_ttl: Duration::from_secs(300),
            tiny_extent_count: TINY_EXTENT_COUNT,
            base_id_persist_step: 500,
            base_id_sync_step: 400,
            recent_delete_ttl: Duration::from_secs(86_400),
            is_create: true,
        }
    }
}

/// Store operation counters
#[derive(Debug, Default)]
pub struct StoreStats {
    pub creates: AtomicU64,
    pub writes: AtomicU64,
    pub write_bytes: AtomicU64,
    pub reads: AtomicU64,
    pub read_bytes: AtomicU64,
    pub deletes: AtomicU64,
    pub tiny_punches: AtomicU64,
    pub illegal_overwrites: AtomicU64,
}

/// One entry of a replica comparison snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub size: u64,
    pub modify_time: i64,
    pub crc: u32,
}

pub struct ExtentStore {
    data_path: PathBuf,
    partition_id: u64,
    store_size: u64,
    info: ExtentInfoStore,
    cache: ExtentCache,
    verify: VerifyFile,
    meta_file: File,
    tiny_delete: TinyDeleteJournal,
    recent_deletes: RecentDeleteTable,
    tiny: TinyExtentArbiter,
    tiny_ids: Vec<u64>,
    base_extent_id: AtomicU64,
    /// Highest id written to the meta file; the lock orders meta writes
    persisted_base_id: Mutex<u64>,
    allocations: AtomicU64,
    prealloc_extent_id: AtomicU64,
    persist_step: u64,
    sync_step: u64,
    loaded: AtomicBool,
    stats: StoreStats,
}

fn parse_extent_id(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

impl ExtentStore {
    /// Open or create the store at `config.data_path`.
    ///
    /// Tiny extents are restored (or created) eagerly and all start in the
    /// broken queue. Normal extents are registered with size 0 until
    /// [`ExtentStore::load`] runs, unless the store is new.
    pub fn open(config: ExtentStoreConfig) -> Result<Self> {
        if config.base_id_sync_step == 0 || config.base_id_persist_step == 0 {
            return Err(Error::Configuration(
                "base extent id steps must be positive".to_string(),
            ));
        }
        fs::create_dir_all(&config.data_path)?;
        let data_path = config.data_path;

        let verify = VerifyFile::open(&data_path)?;
        let meta_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(data_path.join(EXTENT_META_FILE_NAME))?;
        let tiny_delete = TinyDeleteJournal::open(&data_path)?;
        let recent_deletes = RecentDeleteTable::open(&data_path, config.recent_delete_ttl)?;
        let info = ExtentInfoStore::new();

        let mut max_normal = 0;
        for entry in fs::read_dir(&data_path)? {
            let entry = entry?;
            let Some(extent_id) = entry.file_name().to_str().and_then(parse_extent_id) else {
                continue;
            };
            if extent_id < MIN_EXTENT_ID {
                continue;
            }
            if is_tiny_extent(extent_id) {
                let extent = Extent::restore_from_fs(&data_path, extent_id, None)?;
                info.create(ExtentInfo {
                    file_id: extent_id,
                    size: extent.data_size(),
                    modify_time: extent.modify_time(),
                    crc: 0,
                });
            } else {
                max_normal = max_normal.max(extent_id);
                info.create(ExtentInfo {
                    file_id: extent_id,
                    ..ExtentInfo::default()
                });
            }
        }

        let mut buf = [0u8; 8];
        let persisted = if raw_io::read_full_at(&meta_file, &mut buf, 0)? == 8 {
            u64::from_be_bytes(buf)
        } else {
            0
        };
        let base = max_normal.max(persisted).max(MIN_EXTENT_ID) + BASE_ID_RELOAD_GAP;
        meta_file.write_all_at(&base.to_be_bytes(), 0)?;
        meta_file.sync_data()?;

        let tiny_ids: Vec<u64> = tiny_extent_ids()
            .take(usize::try_from(config.tiny_extent_count).unwrap_or(usize::MAX))
            .collect();
        for &extent_id in &tiny_ids {
            if info.contains(extent_id) {
                continue;
            }
            Extent::init_to_fs(&data_path, extent_id)?;
            info.create(ExtentInfo {
                file_id: extent_id,
                size: 0,
                modify_time: unix_timestamp(),
                crc: 0,
            });
        }
        let tiny = TinyExtentArbiter::new(tiny_ids.len());
        tiny.send_all_to_broken(tiny_ids.iter().copied());

        info!(
            partition_id = config.partition_id,
            path = %data_path.display(),
            extents = info.len(),
            base_extent_id = base,
            "extent store opened"
        );

        Ok(Self {
            data_path,
            partition_id: config.partition_id,
            store_size: config.store_size,
            info,
            cache: ExtentCache::new(config.cache_capacity, config.cache_ttl),
            verify,
            meta_file,
            tiny_delete,
            recent_deletes,
            tiny,
            tiny_ids,
            base_extent_id: AtomicU64::new(base),
            persisted_base_id: Mutex::new(base),
            allocations: AtomicU64::new(0),
            prealloc_extent_id: AtomicU64::new(0),
            persist_step: config.base_id_persist_step,
            sync_step: config.base_id_sync_step,
            loaded: AtomicBool::new(config.is_create),
            stats: StoreStats::default(),
        })
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub const fn partition_id(&self) -> u64 {
        self.partition_id
    }

    pub const fn store_size(&self) -> u64 {
        self.store_size
    }

    pub const fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    pub const fn tiny_extents(&self) -> &TinyExtentArbiter {
        &self.tiny
    }

    /// Tiny extent ids this store provisions
    pub fn tiny_extent_ids(&self) -> &[u64] {
        &self.tiny_ids
    }

    fn missing(&self, extent_id: u64) -> Error {
        if self.recent_deletes.is_recent_delete(extent_id) {
            Error::ExtentDeleted(extent_id)
        } else {
            Error::ExtentNotFound(extent_id)
        }
    }

    /// Shared handle for `extent_id`, opening it through the cache
    fn extent(&self, extent_id: u64) -> Result<Arc<Extent>> {
        if let Some(extent) = self.cache.get(extent_id) {
            return Ok(extent);
        }
        let verify = (!is_tiny_extent(extent_id)).then_some(&self.verify);
        let extent = Extent::restore_from_fs(&self.data_path, extent_id, verify)?;
        Ok(self.cache.put(Arc::new(extent)))
    }

    /// Create a normal extent with an id handed out by the leader.
    pub fn create(&self, extent_id: u64) -> Result<()> {
        if extent_id < MIN_EXTENT_ID || is_tiny_extent(extent_id) {
            return Err(Error::param_mismatch(format!(
                "extent id {extent_id} is not a normal extent"
            )));
        }
        if self.info.contains(extent_id) {
            return Err(Error::AlreadyExists(extent_id));
        }
        if self.recent_deletes.is_recent_delete(extent_id) {
            return Err(Error::ExtentDeleted(extent_id));
        }
        let extent = Extent::init_to_fs(&self.data_path, extent_id)?;
        self.cache.put(Arc::new(extent));
        if !self.info.create(ExtentInfo {
            file_id: extent_id,
            size: 0,
            modify_time: unix_timestamp(),
            crc: 0,
        }) {
            return Err(Error::AlreadyExists(extent_id));
        }
        self.update_base_extent_id(extent_id)?;
        self.stats.creates.fetch_add(1, Ordering::Relaxed);
        debug!(partition_id = self.partition_id, extent_id, "extent created");
        Ok(())
    }

    pub fn has_extent(&self, extent_id: u64) -> bool {
        self.info.contains(extent_id)
    }

    pub fn extent_count(&self) -> usize {
        self.info.len()
    }

    /// Write `data` at `offset` and refresh the info entry.
    pub fn write(
        &self,
        extent_id: u64,
        offset: u64,
        data: &[u8],
        crc: u32,
        mode: WriteMode,
        sync: bool,
    ) -> Result<()> {
        if !self.info.contains(extent_id) {
            return Err(self.missing(extent_id));
        }
        let extent = self.extent(extent_id)?;
        let verify = (!extent.is_tiny()).then_some(&self.verify);
        if let Err(e) = extent.write(data, offset, crc, mode, sync, verify) {
            if matches!(e, Error::IllegalOverwrite { .. }) {
                self.stats.illegal_overwrites.fetch_add(1, Ordering::Relaxed);
            }
            return Err(e);
        }
        self.info
            .update(extent_id, extent.data_size(), extent.modify_time(), Some(0))?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .write_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Read into `buf` from `offset`; returns the CRC of the bytes read.
    ///
    /// Normal extents cannot be read before the store has loaded, except by
    /// repair.
    pub fn read(&self, extent_id: u64, offset: u64, buf: &mut [u8], is_repair_read: bool) -> Result<u32> {
        if !is_tiny_extent(extent_id) && !is_repair_read && !self.is_finish_load() {
            return Err(Error::PartitionLoading);
        }
        if !self.info.contains(extent_id) {
            return Err(self.missing(extent_id));
        }
        let crc = self.extent(extent_id)?.read(buf, offset)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .read_bytes
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(crc)
    }

    /// Delete data.
    ///
    /// Tiny extents get `[offset, offset + size)` punched and journaled; a
    /// range that is already a hole is not journaled again. Normal extents
    /// lose their file, info entry and CRC header and enter the
    /// recently-deleted table. Deleting an unknown normal extent succeeds.
    pub fn mark_delete(&self, extent_id: u64, offset: u64, size: u64) -> Result<()> {
        if is_tiny_extent(extent_id) {
            if !self.info.contains(extent_id) {
                return Err(Error::ExtentNotFound(extent_id));
            }
            if self.extent(extent_id)?.delete_tiny(offset, size)? {
                self.tiny_delete.record(extent_id, offset, size)?;
                self.stats.tiny_punches.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }
        if !self.info.contains(extent_id) {
            return Ok(());
        }
        self.cache.del(extent_id);
        match fs::remove_file(self.data_path.join(extent_id.to_string())) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.recent_deletes.mark(extent_id)?;
        self.info.delete(extent_id);
        self.verify.clear_header(extent_id)?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        info!(partition_id = self.partition_id, extent_id, "normal extent deleted");
        Ok(())
    }

    pub fn is_recent_delete(&self, extent_id: u64) -> bool {
        self.recent_deletes.is_recent_delete(extent_id)
    }

    pub fn evict_expired_recent_deletes(&self) -> usize {
        self.recent_deletes.evict_expired()
    }

    /// Every normal extent id ever deleted on this replica
    pub fn deleted_normal_extents(&self) -> Result<Vec<u64>> {
        self.recent_deletes.persisted_ids()
    }

    pub fn base_extent_id(&self) -> u64 {
        self.base_extent_id.load(Ordering::Acquire)
    }

    /// Allocate a fresh normal extent id. The id is written to the meta file
    /// before it is returned.
    pub fn next_extent_id(&self) -> Result<u64> {
        let extent_id = self.base_extent_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.persist_base_extent_id(extent_id)?;
        Ok(extent_id)
    }

    /// Raise the allocator past an id created elsewhere.
    pub fn update_base_extent_id(&self, extent_id: u64) -> Result<()> {
        if is_tiny_extent(extent_id) {
            return Ok(());
        }
        if self.base_extent_id.fetch_max(extent_id, Ordering::AcqRel) < extent_id {
            self.persist_base_extent_id(extent_id)?;
        }
        Ok(())
    }

    fn persist_base_extent_id(&self, extent_id: u64) -> Result<()> {
        {
            let mut persisted = self.persisted_base_id.lock();
            if extent_id > *persisted {
                self.meta_file.write_all_at(&extent_id.to_be_bytes(), 0)?;
                *persisted = extent_id;
            }
        }
        let n = self.allocations.fetch_add(1, Ordering::AcqRel) + 1;
        if n % self.sync_step == 0 {
            self.meta_file.sync_data()?;
        }
        if extent_id >= self.prealloc_extent_id.load(Ordering::Acquire) {
            let target = extent_id + self.persist_step;
            self.verify.preallocate(target)?;
            self.prealloc_extent_id.fetch_max(target, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Info entries of `kind` that pass `filter`, sorted by id
    pub fn get_all_watermarks(
        &self,
        kind: ExtentKind,
        filter: Option<&ExtentFilter>,
    ) -> Result<Vec<ExtentInfo>> {
        if kind != ExtentKind::Tiny && !self.is_finish_load() {
            return Err(Error::PartitionLoading);
        }
        let mut out = Vec::new();
        self.info.range_dist(kind, |e| {
            if filter.is_none_or(|f| f(e)) {
                out.push(*e);
            }
        });
        out.sort_by_key(|e| e.file_id);
        Ok(out)
    }

    /// Watermarks packed as big-endian `{id u64, size u64}` records, with
    /// the tiny-delete journal size so a follower knows how far to catch up.
    pub fn get_all_watermarks_bytes(
        &self,
        kind: ExtentKind,
        filter: Option<&ExtentFilter>,
    ) -> Result<(u64, Vec<u8>)> {
        let extents = self.get_all_watermarks(kind, filter)?;
        let mut data = Vec::with_capacity(extents.len() * WATERMARK_RECORD_SIZE);
        for e in &extents {
            data.extend_from_slice(&e.file_id.to_be_bytes());
            data.extend_from_slice(&e.size.to_be_bytes());
        }
        Ok((self.tiny_delete_file_size(), data))
    }

    /// Every info entry packed as big-endian `{id u64, size u64, crc u32}`
    pub fn get_all_extent_info_bytes(&self, filter: Option<&ExtentFilter>) -> Result<Vec<u8>> {
        let extents = self.get_all_watermarks(ExtentKind::All, filter)?;
        let mut data = Vec::with_capacity(extents.len() * EXTENT_INFO_RECORD_SIZE);
        for e in &extents {
            data.extend_from_slice(&e.file_id.to_be_bytes());
            data.extend_from_slice(&e.size.to_be_bytes());
            data.extend_from_slice(&e.crc.to_be_bytes());
        }
        Ok(data)
    }

    /// Visit every info entry, tiny and normal, in no particular order.
    pub fn walk_extents_info(&self, visitor: impl FnMut(&ExtentInfo)) {
        self.info.range_dist(ExtentKind::All, visitor);
    }

    /// Highest extent id on record and the summed size of every extent
    pub fn max_extent_id_and_partition_size(&self) -> (u64, u64) {
        let mut max_id = 0;
        let mut total = 0;
        self.walk_extents_info(|e| {
            max_id = max_id.max(e.file_id);
            total += e.size;
        });
        (max_id, total)
    }

    /// Summed size of extents with an id up to `max_extent_id`. Lets a replica
    /// compare its size against a leader's `max_extent_id_and_partition_size`.
    pub fn store_size_up_to(&self, max_extent_id: u64) -> u64 {
        let mut total = 0;
        self.walk_extents_info(|e| {
            if e.file_id <= max_extent_id {
                total += e.size;
            }
        });
        total
    }

    /// Info entry of one extent
    pub fn watermark(&self, extent_id: u64) -> Result<ExtentInfo> {
        if !is_tiny_extent(extent_id) && !self.is_finish_load() {
            return Err(Error::PartitionLoading);
        }
        self.info
            .load(extent_id)
            .ok_or_else(|| self.missing(extent_id))
    }

    /// Info entry of one extent, even before the store has loaded
    pub fn force_watermark(&self, extent_id: u64) -> Result<ExtentInfo> {
        self.info
            .load(extent_id)
            .ok_or_else(|| self.missing(extent_id))
    }

    /// Size of the extent as its open handle sees it
    pub fn load_extent_watermark(&self, extent_id: u64) -> Result<u64> {
        if !self.info.contains(extent_id) {
            return Err(self.missing(extent_id));
        }
        Ok(self.extent(extent_id)?.data_size())
    }

    /// Listing used for replica comparison: idle normal extents with their
    /// CRC, then every tiny extent with CRC 0.
    pub fn snapshot(&self) -> Result<Vec<SnapshotFile>> {
        let normal = self.get_all_watermarks(ExtentKind::Normal, Some(&normal_extent_filter()))?;
        let tiny = self.get_all_watermarks(ExtentKind::Tiny, None)?;
        Ok(normal
            .into_iter()
            .chain(tiny.into_iter().map(|e| ExtentInfo { crc: 0, ..e }))
            .map(|e| SnapshotFile {
                name: e.file_id.to_string(),
                size: e.size,
                modify_time: e.modify_time,
                crc: e.crc,
            })
            .collect())
    }

    /// Replace the info store wholesale with entries received from the leader.
    pub fn reset_info(&self, entries: Vec<ExtentInfo>) {
        let n = entries.len();
        self.info.replace(entries);
        info!(partition_id = self.partition_id, extents = n, "extent info reset");
    }

    /// Whether a random write of `size` bytes at `offset` may be proposed.
    pub fn check_is_avail_random_write(&self, extent_id: u64, offset: u64, size: u64) -> Result<()> {
        if is_tiny_extent(extent_id) {
            return Err(Error::param_mismatch(format!(
                "random write on tiny extent {extent_id}"
            )));
        }
        if !self.info.contains(extent_id) {
            return Err(self.missing(extent_id));
        }
        if size == 0 || offset.checked_add(size).is_none_or(|end| end > EXTENT_MAX_SIZE) {
            return Err(Error::param_mismatch(format!(
                "extent {extent_id} range {offset}+{size} invalid"
            )));
        }
        Ok(())
    }

    /// Written blocks of a normal extent and their CRCs
    pub fn scan_blocks(&self, extent_id: u64) -> Result<Vec<BlockCrc>> {
        if !self.info.contains(extent_id) {
            return Err(self.missing(extent_id));
        }
        Ok(self.extent(extent_id)?.scan_blocks())
    }

    /// 512-byte sectors the extent occupies on disk
    pub fn get_real_block_count(&self, extent_id: u64) -> Result<u64> {
        if !self.info.contains(extent_id) {
            return Err(self.missing(extent_id));
        }
        self.extent(extent_id)?.real_block_count()
    }

    /// File length of a tiny extent, punched holes included
    pub fn tiny_extent_file_size(&self, extent_id: u64) -> Result<u64> {
        if !is_tiny_extent(extent_id) {
            return Err(Error::param_mismatch(format!(
                "extent {extent_id} is not tiny"
            )));
        }
        if !self.info.contains(extent_id) {
            return Err(Error::ExtentNotFound(extent_id));
        }
        self.extent(extent_id)?.file_size()
    }

    /// Hex MD5 of `[offset, offset + size)` of the extent file. A zero `size`
    /// runs to the end of the file.
    pub fn compute_md5_sum(&self, extent_id: u64, offset: u64, size: u64) -> Result<String> {
        let file = match File::open(self.data_path.join(extent_id.to_string())) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(self.missing(extent_id)),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        let size = if size == 0 { len.saturating_sub(offset) } else { size };
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= len)
            .ok_or_else(|| {
                Error::range_invalid(format!(
                    "extent {extent_id} range {offset}+{size} past file size {len}"
                ))
            })?;
        let mut ctx = md5::Context::new();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let mut cursor = offset;
        while cursor < end {
            let n = (end - cursor).min(BLOCK_SIZE) as usize;
            file.read_exact_at(&mut buf[..n], cursor)?;
            ctx.consume(&buf[..n]);
            cursor += n as u64;
        }
        Ok(format!("{:x}", ctx.compute()))
    }

    /// Recompute and record the CRC of one normal extent.
    pub fn compute_extent_crc(&self, extent_id: u64) -> Result<u32> {
        if !self.info.contains(extent_id) {
            return Err(self.missing(extent_id));
        }
        let crc = self
            .extent(extent_id)?
            .auto_compute_crc(Some(&self.verify))?;
        self.info.set_crc(extent_id, crc)?;
        Ok(crc)
    }

    /// Fill in the CRC of normal extents that have data, no CRC and have been
    /// idle long enough. Returns how many were computed.
    pub fn auto_compute_extent_crc(&self) -> usize {
        if !self.is_finish_load() {
            return 0;
        }
        let now = unix_timestamp();
        let candidates: Vec<u64> = self
            .info
            .collect(ExtentKind::Normal)
            .into_iter()
            .filter(|e| e.crc == 0 && e.size > 0 && now - e.modify_time > CRC_AUTOCOMPUTE_IDLE_SECS)
            .map(|e| e.file_id)
            .collect();
        let mut computed = 0;
        for extent_id in candidates {
            match self.compute_extent_crc(extent_id) {
                Ok(_) => computed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(partition_id = self.partition_id, extent_id, error = %e, "extent crc compute failed");
                }
            }
        }
        computed
    }

    /// Repair a tiny extent range from a peer: write `data` when the peer
    /// had bytes there, otherwise extend the extent over a hole.
    pub fn tiny_extent_recover(
        &self,
        extent_id: u64,
        offset: u64,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<()> {
        if !is_tiny_extent(extent_id) {
            return Err(Error::param_mismatch(format!(
                "tiny recover on normal extent {extent_id}"
            )));
        }
        if !self.info.contains(extent_id) {
            return Err(Error::ExtentNotFound(extent_id));
        }
        let extent = self.extent(extent_id)?;
        match data {
            Some(data) => extent.write(data, offset, 0, WriteMode::Repair, false, None)?,
            None => extent.fill_tiny_hole(offset, size)?,
        }
        self.info
            .update(extent_id, extent.data_size(), extent.modify_time(), None)
    }

    /// Next `(data_start, data_end)` range of a tiny extent at or after `offset`
    pub fn tiny_extent_avail_offset(&self, extent_id: u64, offset: u64) -> Result<(u64, u64)> {
        if !is_tiny_extent(extent_id) {
            return Err(Error::param_mismatch(format!(
                "extent {extent_id} is not tiny"
            )));
        }
        self.extent(extent_id)?.tiny_extent_avail_offset(offset)
    }

    pub fn record_tiny_delete(&self, extent_id: u64, offset: u64, size: u64) -> Result<()> {
        self.tiny_delete.record(extent_id, offset, size)
    }

    /// Re-punch every journaled tiny delete. Returns the number of ranges
    /// that were not already holes.
    pub fn playback_tiny_delete(&self) -> Result<usize> {
        let mut punched = 0;
        for rec in self.tiny_delete.records()? {
            if !self.info.contains(rec.extent_id) {
                continue;
            }
            if self.extent(rec.extent_id)?.delete_tiny(rec.offset, rec.size)? {
                punched += 1;
            }
        }
        debug!(partition_id = self.partition_id, punched, "tiny delete playback");
        Ok(punched)
    }

    pub fn read_tiny_delete_records(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.tiny_delete.read_range(offset, size)
    }

    pub fn tiny_delete_file_size(&self) -> u64 {
        self.tiny_delete.size()
    }

    /// Bytes in use: normal extent sizes plus blocks held by tiny extents
    pub fn store_used_size(&self) -> u64 {
        let tiny: u64 = self
            .tiny_ids
            .iter()
            .filter_map(|&id| self.extent(id).ok())
            .filter_map(|e| e.allocated_bytes().ok())
            .sum();
        self.info.normal_used() + tiny
    }

    /// Fill in normal extent sizes from the filesystem.
    pub fn load(&self) -> Result<()> {
        if self.is_finish_load() {
            return Ok(());
        }
        let mut loaded = 0;
        for e in self.info.collect(ExtentKind::Normal) {
            let meta = match fs::metadata(self.data_path.join(e.file_id.to_string())) {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            match self.info.update(e.file_id, meta.len(), meta.mtime(), None) {
                Ok(()) | Err(Error::ExtentNotFound(_)) => {}
                Err(err) => return Err(err),
            }
            loaded += 1;
        }
        self.loaded.store(true, Ordering::Release);
        info!(partition_id = self.partition_id, extents = loaded, "extent store loaded");
        Ok(())
    }

    pub fn is_finish_load(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn evict_expired_cache(&self) -> usize {
        self.cache.evict_expired()
    }

    pub fn force_evict_cache(&self, ratio: f64) -> Result<usize> {
        self.cache.force_evict(ratio)
    }

    /// fdatasync dirty extents and the store's own files. Returns the number
    /// of extents flushed.
    pub fn flush(&self) -> Result<usize> {
        let flushed = self.cache.flush()?;
        self.verify.sync()?;
        self.meta_file.sync_data()?;
        self.tiny_delete.sync()?;
        self.recent_deletes.sync()?;
        Ok(flushed)
    }

    /// Flush and close every handle
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.cache.close();
        info!(partition_id = self.partition_id, "extent store closed");
        Ok(())
    }
}
