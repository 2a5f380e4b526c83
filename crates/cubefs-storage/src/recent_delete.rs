//! Recently deleted normal extents
//!
//! `mark_delete` of a normal extent records `id -> now` here and appends the id
//! to `NORMALEXTENT_DELETE`. Within the ttl the id cannot be recreated and
//! reads report it as deleted rather than unknown.

use cubefs_common::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

pub const NORMAL_DELETE_FILE_NAME: &str = "NORMALEXTENT_DELETE";

pub struct RecentDeleteTable {
    entries: DashMap<u64, Instant>,
    ttl: Duration,
    log: Mutex<File>,
}

impl RecentDeleteTable {
    pub fn open(dir: &Path, ttl: Duration) -> Result<Self> {
        let log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(dir.join(NORMAL_DELETE_FILE_NAME))?;
        Ok(Self {
            entries: DashMap::new(),
            ttl,
            log: Mutex::new(log),
        })
    }

    /// Record a deletion
    pub fn mark(&self, extent_id: u64) -> Result<()> {
        self.log.lock().write_all(&extent_id.to_be_bytes())?;
        self.entries.insert(extent_id, Instant::now());
        Ok(())
    }

    /// True from `mark` until the ttl has elapsed
    pub fn is_recent_delete(&self, extent_id: u64) -> bool {
        self.entries
            .get(&extent_id)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Drop entries older than the ttl
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, at| at.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids in the table, oldest first
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<(Instant, u64)> =
            self.entries.iter().map(|e| (*e.value(), *e.key())).collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Every id ever appended to the delete log
    pub fn persisted_ids(&self) -> Result<Vec<u64>> {
        use std::os::unix::fs::FileExt;

        let file = self.log.lock();
        let len = file.metadata()?.len();
        let mut buf = vec![0u8; usize::try_from(len - len % 8).unwrap_or(0)];
        file.read_exact_at(&mut buf, 0)?;
        Ok(buf
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_be_bytes(b)
            })
            .collect())
    }

    pub fn sync(&self) -> Result<()> {
        self.log.lock().sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let table = RecentDeleteTable::open(dir.path(), Duration::from_millis(80)).unwrap();
        assert!(!table.is_recent_delete(1024));

        table.mark(1024).unwrap();
        let marked = Instant::now();
        let mut seen_false = false;
        while marked.elapsed() < Duration::from_millis(200) {
            let recent = table.is_recent_delete(1024);
            // once false it never turns true again
            assert!(!(seen_false && recent));
            seen_false |= !recent;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(seen_false);
        assert_eq!(table.evict_expired(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_log_persists_ids() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = RecentDeleteTable::open(dir.path(), Duration::from_secs(60)).unwrap();
            table.mark(1024).unwrap();
            table.mark(2048).unwrap();
            assert_eq!(table.ids(), vec![1024, 2048]);
        }
        let table = RecentDeleteTable::open(dir.path(), Duration::from_secs(60)).unwrap();
        assert_eq!(table.persisted_ids().unwrap(), vec![1024, 2048]);
        // the window itself does not survive a reopen
        assert!(!table.is_recent_delete(1024));
    }
}
