//! In-memory extent info
//!
//! `extent_id -> {size, modify_time, crc}` in a sharded map. Each entry keeps
//! its fields in atomics so updates only take the shard read lock. Size
//! changes land while that lock is held, so a delete (which needs the write
//! lock) always subtracts the size the entry ended with.

use cubefs_common::{Error, ExtentInfo, ExtentKind, Result, is_tiny_extent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

const SHARD_COUNT: usize = 32;

/// Live info entry of one extent
#[derive(Debug)]
pub struct ExtentInfoBlock {
    file_id: u64,
    size: AtomicU64,
    modify_time: AtomicI64,
    crc: AtomicU32,
}

impl ExtentInfoBlock {
    fn new(info: ExtentInfo) -> Self {
        Self {
            file_id: info.file_id,
            size: AtomicU64::new(info.size),
            modify_time: AtomicI64::new(info.modify_time),
            crc: AtomicU32::new(info.crc),
        }
    }

    pub fn info(&self) -> ExtentInfo {
        ExtentInfo {
            file_id: self.file_id,
            size: self.size.load(Ordering::Acquire),
            modify_time: self.modify_time.load(Ordering::Relaxed),
            crc: self.crc.load(Ordering::Acquire),
        }
    }
}

type Shard = RwLock<HashMap<u64, Arc<ExtentInfoBlock>>>;

pub struct ExtentInfoStore {
    shards: Vec<Shard>,
    normal_used: AtomicU64,
}

impl Default for ExtentInfoStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentInfoStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            normal_used: AtomicU64::new(0),
        }
    }

    fn shard(&self, extent_id: u64) -> &Shard {
        &self.shards[(extent_id % SHARD_COUNT as u64) as usize]
    }

    /// Register an extent. Returns false if it is already present.
    pub fn create(&self, info: ExtentInfo) -> bool {
        let mut shard = self.shard(info.file_id).write();
        if shard.contains_key(&info.file_id) {
            return false;
        }
        if !is_tiny_extent(info.file_id) {
            self.normal_used.fetch_add(info.size, Ordering::AcqRel);
        }
        shard.insert(info.file_id, Arc::new(ExtentInfoBlock::new(info)));
        true
    }

    /// Update an entry: size only grows, mtime is last-write-wins, crc is
    /// replaced when given.
    pub fn update(&self, extent_id: u64, size: u64, modify_time: i64, crc: Option<u32>) -> Result<()> {
        let shard = self.shard(extent_id).read();
        let entry = shard
            .get(&extent_id)
            .ok_or(Error::ExtentNotFound(extent_id))?;
        let old = entry.size.fetch_max(size, Ordering::AcqRel);
        if size > old && !is_tiny_extent(extent_id) {
            self.normal_used.fetch_add(size - old, Ordering::AcqRel);
        }
        entry.modify_time.store(modify_time, Ordering::Relaxed);
        if let Some(crc) = crc {
            entry.crc.store(crc, Ordering::Release);
        }
        Ok(())
    }

    pub fn set_crc(&self, extent_id: u64, crc: u32) -> Result<()> {
        self.shard(extent_id)
            .read()
            .get(&extent_id)
            .ok_or(Error::ExtentNotFound(extent_id))?
            .crc
            .store(crc, Ordering::Release);
        Ok(())
    }

    pub fn delete(&self, extent_id: u64) -> Option<ExtentInfo> {
        let removed = self.shard(extent_id).write().remove(&extent_id)?;
        let info = removed.info();
        if !is_tiny_extent(extent_id) {
            self.normal_used.fetch_sub(info.size, Ordering::AcqRel);
        }
        Some(info)
    }

    pub fn load(&self, extent_id: u64) -> Option<ExtentInfo> {
        self.shard(extent_id).read().get(&extent_id).map(|e| e.info())
    }

    pub fn contains(&self, extent_id: u64) -> bool {
        self.shard(extent_id).read().contains_key(&extent_id)
    }

    /// Visit every entry of `kind`. Shards are visited one at a time, so the
    /// view is not a global snapshot.
    pub fn range_dist(&self, kind: ExtentKind, mut visitor: impl FnMut(&ExtentInfo)) {
        for shard in &self.shards {
            let entries: Vec<ExtentInfo> = shard
                .read()
                .values()
                .filter(|e| kind.matches(e.file_id))
                .map(|e| e.info())
                .collect();
            for info in &entries {
                visitor(info);
            }
        }
    }

    pub fn collect(&self, kind: ExtentKind) -> Vec<ExtentInfo> {
        let mut out = Vec::new();
        self.range_dist(kind, |e| out.push(*e));
        out.sort_by_key(|e| e.file_id);
        out
    }

    /// Sum of sizes over normal extents
    pub fn normal_used(&self) -> u64 {
        self.normal_used.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap in a complete new set of entries. All shards are held for the
    /// swap so readers see either the old or the new set.
    pub fn replace(&self, entries: impl IntoIterator<Item = ExtentInfo>) {
        let mut fresh: Vec<HashMap<u64, Arc<ExtentInfoBlock>>> =
            (0..SHARD_COUNT).map(|_| HashMap::new()).collect();
        let mut used = 0;
        for info in entries {
            if !is_tiny_extent(info.file_id) {
                used += info.size;
            }
            fresh[(info.file_id % SHARD_COUNT as u64) as usize]
                .insert(info.file_id, Arc::new(ExtentInfoBlock::new(info)));
        }
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.write()).collect();
        for (guard, map) in guards.iter_mut().zip(fresh) {
            **guard = map;
        }
        self.normal_used.store(used, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubefs_common::TINY_EXTENT_START_ID;

    fn info(id: u64, size: u64) -> ExtentInfo {
        ExtentInfo {
            file_id: id,
            size,
            modify_time: 1,
            crc: 0,
        }
    }

    #[test]
    fn test_create_update_delete() {
        let store = ExtentInfoStore::new();
        assert!(store.create(info(1024, 0)));
        assert!(!store.create(info(1024, 0)));

        store.update(1024, 4096, 10, Some(7)).unwrap();
        // size never shrinks
        store.update(1024, 100, 11, None).unwrap();
        let e = store.load(1024).unwrap();
        assert_eq!(e.size, 4096);
        assert_eq!(e.modify_time, 11);
        assert_eq!(e.crc, 7);

        assert!(matches!(
            store.update(2048, 1, 1, None),
            Err(Error::ExtentNotFound(2048))
        ));
        assert_eq!(store.delete(1024).unwrap().size, 4096);
        assert!(store.load(1024).is_none());
    }

    #[test]
    fn test_normal_used_ignores_tiny() {
        let store = ExtentInfoStore::new();
        store.create(info(1024, 100));
        store.create(info(1025, 0));
        store.create(info(TINY_EXTENT_START_ID, 8192));
        store.update(1025, 50, 1, None).unwrap();
        store.update(TINY_EXTENT_START_ID, 16384, 1, None).unwrap();
        assert_eq!(store.normal_used(), 150);

        store.delete(1024);
        assert_eq!(store.normal_used(), 50);
    }

    #[test]
    fn test_range_dist_by_kind() {
        let store = ExtentInfoStore::new();
        for id in 1024..1034 {
            store.create(info(id, 1));
        }
        for id in TINY_EXTENT_START_ID..TINY_EXTENT_START_ID + 4 {
            store.create(info(id, 0));
        }
        assert_eq!(store.collect(ExtentKind::Normal).len(), 10);
        assert_eq!(store.collect(ExtentKind::Tiny).len(), 4);
        assert_eq!(store.collect(ExtentKind::All).len(), 14);
        assert_eq!(store.collect(ExtentKind::All)[0].file_id, 1024);
    }

    #[test]
    fn test_replace_swaps_everything() {
        let store = ExtentInfoStore::new();
        store.create(info(1024, 10));
        store.replace(vec![info(2000, 5), info(2001, 6)]);
        assert!(!store.contains(1024));
        assert_eq!(store.len(), 2);
        assert_eq!(store.normal_used(), 11);
    }

    #[test]
    fn test_concurrent_updates() {
        let store = Arc::new(ExtentInfoStore::new());
        store.create(info(1024, 0));
        let handles: Vec<_> = (1..=8u64)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 0..100 {
                        store.update(1024, i * 1000 + n, 1, None).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.load(1024).unwrap().size, 8099);
        assert_eq!(store.normal_used(), 8099);
    }

    #[test]
    fn test_used_matches_entries_with_racing_deletes() {
        let store = Arc::new(ExtentInfoStore::new());
        let ids = 1024..1032u64;
        let writers: Vec<_> = (1..=4u64)
            .map(|t| {
                let store = Arc::clone(&store);
                let ids = ids.clone();
                std::thread::spawn(move || {
                    for round in 0..500 {
                        for id in ids.clone() {
                            let _ = store.update(id, round * 4096 + t, 1, None);
                        }
                    }
                })
            })
            .collect();
        let deleter = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    for id in ids.clone() {
                        store.create(info(id, 0));
                        store.delete(id);
                        store.create(info(id, 0));
                    }
                }
            })
        };
        for h in writers {
            h.join().unwrap();
        }
        deleter.join().unwrap();

        let live: u64 = store.collect(ExtentKind::Normal).iter().map(|e| e.size).sum();
        assert_eq!(store.normal_used(), live);
        for id in 1024..1032 {
            store.delete(id);
        }
        assert_eq!(store.normal_used(), 0);
    }
}
