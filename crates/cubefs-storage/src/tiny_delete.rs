//! Tiny-delete journal
//!
//! Every hole punched in a tiny extent is appended here as a fixed 24 byte
//! big-endian record `{extent_id, offset, size}`. Replicas replay the journal
//! to converge on the same holes; replay is idempotent because punching an
//! existing hole changes nothing.

use cubefs_common::{Error, Result, is_page_aligned, is_tiny_extent};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub const TINY_DELETE_FILE_NAME: &str = "TINYEXTENT_DELETE";

/// Size of one journal record
pub const TINY_DELETE_RECORD_SIZE: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TinyDeleteRecord {
    pub extent_id: u64,
    pub offset: u64,
    pub size: u64,
}

impl TinyDeleteRecord {
    pub fn to_bytes(&self) -> [u8; TINY_DELETE_RECORD_SIZE as usize] {
        let mut buf = [0u8; TINY_DELETE_RECORD_SIZE as usize];
        buf[0..8].copy_from_slice(&self.extent_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < TINY_DELETE_RECORD_SIZE as usize {
            return Err(Error::Deserialization(format!(
                "tiny delete record too short: {}",
                buf.len()
            )));
        }
        let field = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            u64::from_be_bytes(b)
        };
        Ok(Self {
            extent_id: field(0),
            offset: field(8),
            size: field(16),
        })
    }
}

pub struct TinyDeleteJournal {
    path: PathBuf,
    file: Mutex<File>,
    size: AtomicU64,
}

impl TinyDeleteJournal {
    /// Open or create the journal in `dir`, padding it to a record boundary
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(TINY_DELETE_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut size = file.metadata()?.len();
        if size % TINY_DELETE_RECORD_SIZE != 0 {
            let padded = size.div_ceil(TINY_DELETE_RECORD_SIZE) * TINY_DELETE_RECORD_SIZE;
            file.set_len(padded)?;
            info!(path = %path.display(), from = size, to = padded, "padded tiny delete journal");
            size = padded;
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
            size: AtomicU64::new(size),
        })
    }

    /// Append one record
    pub fn record(&self, extent_id: u64, offset: u64, size: u64) -> Result<()> {
        if !is_page_aligned(offset) || !is_page_aligned(size) {
            return Err(Error::param_mismatch(format!(
                "tiny delete {extent_id} {offset}+{size} not page aligned"
            )));
        }
        let rec = TinyDeleteRecord {
            extent_id,
            offset,
            size,
        };
        let mut file = self.file.lock();
        file.write_all(&rec.to_bytes())?;
        self.size
            .fetch_add(TINY_DELETE_RECORD_SIZE, Ordering::AcqRel);
        Ok(())
    }

    /// Every record in file order. Padding and foreign ids are skipped.
    pub fn records(&self) -> Result<Vec<TinyDeleteRecord>> {
        let size = self.size();
        let mut buf = vec![0u8; usize::try_from(size).unwrap_or(usize::MAX)];
        self.file.lock().read_exact_at(&mut buf, 0)?;
        let mut out = Vec::with_capacity(buf.len() / TINY_DELETE_RECORD_SIZE as usize);
        for chunk in buf.chunks_exact(TINY_DELETE_RECORD_SIZE as usize) {
            let rec = TinyDeleteRecord::from_bytes(chunk)?;
            if is_tiny_extent(rec.extent_id) {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// Raw journal bytes from `offset`, at most `size` of them, for shipping
    /// to a replica.
    pub fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        if offset % TINY_DELETE_RECORD_SIZE != 0 {
            return Err(Error::param_mismatch(format!(
                "tiny delete journal offset {offset} not on a record boundary"
            )));
        }
        let total = self.size();
        if offset >= total {
            return Ok(Vec::new());
        }
        let len = size.min(total - offset);
        let len = len - len % TINY_DELETE_RECORD_SIZE;
        let mut buf = vec![0u8; usize::try_from(len).unwrap_or(usize::MAX)];
        self.file.lock().read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubefs_common::TINY_EXTENT_START_ID;

    #[test]
    fn test_record_layout() {
        let rec = TinyDeleteRecord {
            extent_id: TINY_EXTENT_START_ID,
            offset: 4096,
            size: 8192,
        };
        let bytes = rec.to_bytes();
        assert_eq!(&bytes[0..8], &TINY_EXTENT_START_ID.to_be_bytes());
        assert_eq!(&bytes[8..16], &4096u64.to_be_bytes());
        assert_eq!(&bytes[16..24], &8192u64.to_be_bytes());
        assert_eq!(TinyDeleteRecord::from_bytes(&bytes).unwrap(), rec);
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TinyDeleteJournal::open(dir.path()).unwrap();
        journal.record(TINY_EXTENT_START_ID, 0, 4096).unwrap();
        journal.record(TINY_EXTENT_START_ID + 1, 8192, 4096).unwrap();
        assert!(journal.record(TINY_EXTENT_START_ID, 100, 4096).is_err());

        let recs = journal.records().unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].offset, 8192);
        assert_eq!(journal.size(), 48);

        assert_eq!(journal.read_range(24, 1000).unwrap().len(), 24);
        assert_eq!(journal.read_range(0, 30).unwrap().len(), 24);
        assert!(journal.read_range(48, 24).unwrap().is_empty());
        assert!(journal.read_range(5, 24).is_err());
    }

    #[test]
    fn test_open_pads_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = TinyDeleteJournal::open(dir.path()).unwrap();
            journal.record(TINY_EXTENT_START_ID, 0, 4096).unwrap();
        }
        // simulate a torn append
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(TINY_DELETE_FILE_NAME))
            .unwrap();
        f.write_all(&[1, 2, 3, 4, 5]).unwrap();
        drop(f);

        let journal = TinyDeleteJournal::open(dir.path()).unwrap();
        assert_eq!(journal.size(), 48);
        journal.record(TINY_EXTENT_START_ID + 3, 4096, 4096).unwrap();
        let recs = journal.records().unwrap();
        // the torn record does not name a tiny extent and is skipped
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].extent_id, TINY_EXTENT_START_ID + 3);
    }
}
