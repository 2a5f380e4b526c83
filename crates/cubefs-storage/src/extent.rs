//! Extent file
//!
//! One backing file per extent. Normal extents are sparse 128 MiB slots whose
//! 128 KiB blocks are protected by a CRC header kept in the verify file. Tiny
//! extents are append-only and give space back by punching holes.

use crate::raw_io;
use crate::verify::VerifyFile;
use cubefs_common::checksum::{block_crc, combine_block_crcs, crc32};
use cubefs_common::{
    BLOCK_CRC_SIZE, BLOCK_HEADER_SIZE, BLOCK_SIZE, EXTENT_MAX_SIZE, Error, Result,
    is_page_aligned, is_tiny_extent, page_align_up, unix_timestamp,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// How a write may touch existing data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Sequential write at the current end of the extent
    Append,
    /// Overwrite guarded by the block CRC check
    Random,
    /// Data pulled from a peer during repair; skips the overwrite check
    Repair,
}

/// CRC recorded for one written block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlockCrc {
    pub block_no: u64,
    pub crc: u32,
}

const fn block_range(offset: u64, size: u64) -> (u64, u64) {
    (offset / BLOCK_SIZE, (offset + size - 1) / BLOCK_SIZE)
}

fn header_crc(header: &[u8], block_no: u64) -> u32 {
    let i = (block_no * BLOCK_CRC_SIZE) as usize;
    let mut b = [0u8; 4];
    b.copy_from_slice(&header[i..i + 4]);
    u32::from_be_bytes(b)
}

fn set_header_crc(header: &mut [u8], block_no: u64, crc: u32) {
    let i = (block_no * BLOCK_CRC_SIZE) as usize;
    header[i..i + 4].copy_from_slice(&crc.to_be_bytes());
}

/// An open extent file
pub struct Extent {
    file: File,
    path: PathBuf,
    extent_id: u64,
    data_size: AtomicU64,
    modify_time: AtomicI64,
    /// CRC header; empty for tiny extents. Holding the lock serialises writers.
    header: Mutex<Vec<u8>>,
    dirty: AtomicBool,
}

impl Extent {
    fn file_path(dir: &Path, extent_id: u64) -> PathBuf {
        dir.join(extent_id.to_string())
    }

    /// Create the backing file. Fails with `AlreadyExists` on collision.
    pub fn init_to_fs(dir: &Path, extent_id: u64) -> Result<Self> {
        let path = Self::file_path(dir, extent_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Error::AlreadyExists(extent_id)
                } else {
                    Error::Io(e)
                }
            })?;
        let header = if is_tiny_extent(extent_id) {
            Vec::new()
        } else {
            vec![0u8; BLOCK_HEADER_SIZE as usize]
        };
        Ok(Self {
            file,
            path,
            extent_id,
            data_size: AtomicU64::new(0),
            modify_time: AtomicI64::new(unix_timestamp()),
            header: Mutex::new(header),
            dirty: AtomicBool::new(false),
        })
    }

    /// Open an existing backing file and rebuild size and header.
    pub fn restore_from_fs(dir: &Path, extent_id: u64, verify: Option<&VerifyFile>) -> Result<Self> {
        let path = Self::file_path(dir, extent_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Error::ExtentNotFound(extent_id)
                } else {
                    Error::Io(e)
                }
            })?;
        let meta = file.metadata()?;
        let tiny = is_tiny_extent(extent_id);
        let data_size = if tiny {
            page_align_up(meta.len())
        } else {
            meta.len()
        };
        let header = match (tiny, verify) {
            (true, _) => Vec::new(),
            (false, Some(v)) => v.read_header(extent_id)?,
            (false, None) => vec![0u8; BLOCK_HEADER_SIZE as usize],
        };
        Ok(Self {
            file,
            path,
            extent_id,
            data_size: AtomicU64::new(data_size),
            modify_time: AtomicI64::new(meta.mtime()),
            header: Mutex::new(header),
            dirty: AtomicBool::new(false),
        })
    }

    pub const fn extent_id(&self) -> u64 {
        self.extent_id
    }

    pub const fn is_tiny(&self) -> bool {
        is_tiny_extent(self.extent_id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Acquire)
    }

    pub fn modify_time(&self) -> i64 {
        self.modify_time.load(Ordering::Relaxed)
    }

    /// Write `data` at `offset`.
    ///
    /// Normal extents refresh the CRC of every touched block and persist the
    /// header slice to `verify`. The verify file itself is not fsynced here.
    pub fn write(
        &self,
        data: &[u8],
        offset: u64,
        crc: u32,
        mode: WriteMode,
        sync: bool,
        verify: Option<&VerifyFile>,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(Error::param_mismatch(format!(
                "extent {} empty write at {offset}",
                self.extent_id
            )));
        }
        {
            let mut header = self.header.lock();
            if self.is_tiny() {
                self.write_tiny(data, offset, mode)?;
            } else {
                self.write_normal(&mut header, data, offset, crc, mode, verify)?;
            }
            self.modify_time.store(unix_timestamp(), Ordering::Relaxed);
        }
        if sync {
            self.file.sync_data()?;
        } else {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn write_tiny(&self, data: &[u8], offset: u64, mode: WriteMode) -> Result<()> {
        let data_size = self.data_size();
        match mode {
            WriteMode::Append if offset != data_size => {
                return Err(Error::param_mismatch(format!(
                    "tiny extent {} append at {offset}, size is {data_size}",
                    self.extent_id
                )));
            }
            WriteMode::Random => {
                return Err(Error::param_mismatch(format!(
                    "random write on tiny extent {}",
                    self.extent_id
                )));
            }
            _ => {}
        }
        if !is_page_aligned(offset) {
            return Err(Error::param_mismatch(format!(
                "tiny extent {} offset {offset} not page aligned",
                self.extent_id
            )));
        }
        self.file.write_all_at(data, offset)?;
        self.data_size
            .fetch_max(page_align_up(offset + data.len() as u64), Ordering::AcqRel);
        Ok(())
    }

    fn write_normal(
        &self,
        header: &mut [u8],
        data: &[u8],
        offset: u64,
        crc: u32,
        mode: WriteMode,
        verify: Option<&VerifyFile>,
    ) -> Result<()> {
        let size = data.len() as u64;
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= EXTENT_MAX_SIZE)
            .ok_or_else(|| {
                Error::param_mismatch(format!(
                    "extent {} range {offset}+{size} exceeds {EXTENT_MAX_SIZE}",
                    self.extent_id
                ))
            })?;
        match mode {
            WriteMode::Append => {
                let data_size = self.data_size();
                if offset != data_size {
                    return Err(Error::param_mismatch(format!(
                        "extent {} append at {offset}, size is {data_size}",
                        self.extent_id
                    )));
                }
            }
            WriteMode::Random => self.check_overwrite(header, data, offset, crc)?,
            WriteMode::Repair => {}
        }
        self.file.write_all_at(data, offset)?;
        self.data_size.fetch_max(end, Ordering::AcqRel);
        self.refresh_block_crcs(header, data, offset, verify)
    }

    /// A populated block may only be overwritten by a payload whose CRC is
    /// correct, or one that carries the CRC already stored for the block.
    fn check_overwrite(&self, header: &[u8], data: &[u8], offset: u64, crc: u32) -> Result<()> {
        if crc32(data) == crc {
            return Ok(());
        }
        let (first, last) = block_range(offset, data.len() as u64);
        for block_no in first..=last {
            let stored = header_crc(header, block_no);
            if stored != 0 && stored != crc {
                return Err(Error::IllegalOverwrite {
                    extent_id: self.extent_id,
                    block_no,
                });
            }
        }
        Ok(())
    }

    fn refresh_block_crcs(
        &self,
        header: &mut [u8],
        data: &[u8],
        offset: u64,
        verify: Option<&VerifyFile>,
    ) -> Result<()> {
        let size = data.len() as u64;
        let (first, last) = block_range(offset, size);
        let data_size = self.data_size();
        let mut block = Vec::new();
        for block_no in first..=last {
            let start = block_no * BLOCK_SIZE;
            let end = start + BLOCK_SIZE;
            let crc = if start >= offset && end <= offset + size {
                let from = (start - offset) as usize;
                crc32(&data[from..from + BLOCK_SIZE as usize])
            } else {
                block.resize((data_size.min(end) - start) as usize, 0);
                raw_io::read_full_at(&self.file, &mut block, start)?;
                block_crc(&block)
            };
            set_header_crc(header, block_no, crc);
        }
        if let Some(verify) = verify {
            let from = (first * BLOCK_CRC_SIZE) as usize;
            let to = ((last + 1) * BLOCK_CRC_SIZE) as usize;
            verify.persist_block_crcs(self.extent_id, first, &header[from..to])?;
        }
        Ok(())
    }

    /// Read into `buf` from `offset`; returns the CRC of the bytes read.
    ///
    /// Tiny extent ranges with no data behind them read as zeros.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<u32> {
        let size = buf.len() as u64;
        let data_size = self.data_size();
        if size == 0 || offset.checked_add(size).is_none_or(|end| end > data_size) {
            return Err(Error::param_mismatch(format!(
                "extent {} read {offset}+{size} beyond size {data_size}",
                self.extent_id
            )));
        }
        if self.is_tiny() && raw_io::seek_data(&self.file, offset)?.is_none() {
            buf.fill(0);
            return Ok(crc32(buf));
        }
        raw_io::read_full_at(&self.file, buf, offset)?;
        Ok(crc32(buf))
    }

    /// Punch `[offset, offset + size)` out of a tiny extent.
    ///
    /// Returns false when nothing changed: the range is past the end or was
    /// already a hole.
    pub fn delete_tiny(&self, offset: u64, size: u64) -> Result<bool> {
        if !self.is_tiny() {
            return Err(Error::param_mismatch(format!(
                "punch on normal extent {}",
                self.extent_id
            )));
        }
        if size == 0 || !is_page_aligned(offset) || !is_page_aligned(size) {
            return Err(Error::param_mismatch(format!(
                "tiny delete {offset}+{size} not page aligned"
            )));
        }
        let _guard = self.header.lock();
        if offset + size > self.data_size() {
            return Ok(false);
        }
        if raw_io::is_range_hole(&self.file, offset, size)? {
            return Ok(false);
        }
        raw_io::punch_hole(&self.file, offset, size)?;
        Ok(true)
    }

    /// Extend a tiny extent over `[offset, offset + size)` without data, used
    /// when a peer reports the range as a hole.
    pub fn fill_tiny_hole(&self, offset: u64, size: u64) -> Result<()> {
        if !self.is_tiny() || !is_page_aligned(offset) || !is_page_aligned(size) {
            return Err(Error::param_mismatch(format!(
                "hole fill {offset}+{size} on extent {}",
                self.extent_id
            )));
        }
        let _guard = self.header.lock();
        let end = offset + size;
        let len = self.file.metadata()?.len();
        if len < end {
            self.file.set_len(end)?;
        }
        if offset < len {
            raw_io::punch_hole(&self.file, offset, len.min(end) - offset)?;
        }
        self.data_size.fetch_max(end, Ordering::AcqRel);
        self.modify_time.store(unix_timestamp(), Ordering::Relaxed);
        Ok(())
    }

    /// Next `(data_start, data_end)` at or after `offset`.
    pub fn tiny_extent_avail_offset(&self, offset: u64) -> Result<(u64, u64)> {
        let data_size = self.data_size();
        match raw_io::seek_data(&self.file, offset)? {
            None => Ok((data_size, data_size)),
            Some(start) => {
                let end = raw_io::seek_hole(&self.file, start)?.unwrap_or(data_size);
                Ok((start, end))
            }
        }
    }

    /// Recompute every block CRC from disk, rewrite the header and return
    /// the combined extent CRC. Blocks that were never written stay zero.
    pub fn auto_compute_crc(&self, verify: Option<&VerifyFile>) -> Result<u32> {
        if self.is_tiny() {
            return Err(Error::param_mismatch(format!(
                "tiny extent {} has no block crc",
                self.extent_id
            )));
        }
        let mut header = self.header.lock();
        let data_size = self.data_size();
        let blocks = data_size.div_ceil(BLOCK_SIZE);
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        for block_no in 0..blocks {
            let start = block_no * BLOCK_SIZE;
            let len = (data_size - start).min(BLOCK_SIZE);
            if header_crc(&header, block_no) == 0
                && raw_io::is_range_hole(&self.file, start, len)?
            {
                continue;
            }
            let block = &mut buf[..len as usize];
            raw_io::read_full_at(&self.file, block, start)?;
            set_header_crc(&mut header, block_no, block_crc(block));
        }
        if blocks > 0
            && let Some(verify) = verify
        {
            verify.persist_block_crcs(
                self.extent_id,
                0,
                &header[..(blocks * BLOCK_CRC_SIZE) as usize],
            )?;
        }
        Ok(combine_block_crcs(&header))
    }

    /// CRC stored for one block (0 when never written)
    pub fn block_crc(&self, block_no: u64) -> u32 {
        let header = self.header.lock();
        if header.is_empty() || block_no >= header.len() as u64 / BLOCK_CRC_SIZE {
            return 0;
        }
        header_crc(&header, block_no)
    }

    /// Combined CRC of the current header
    pub fn header_crc(&self) -> u32 {
        combine_block_crcs(&self.header.lock())
    }

    /// Written blocks and their CRCs
    pub fn scan_blocks(&self) -> Vec<BlockCrc> {
        let header = self.header.lock();
        (0..header.len() as u64 / BLOCK_CRC_SIZE)
            .map(|block_no| BlockCrc {
                block_no,
                crc: header_crc(&header, block_no),
            })
            .filter(|b| b.crc != 0)
            .collect()
    }

    pub fn allocated_bytes(&self) -> Result<u64> {
        Ok(raw_io::allocated_bytes(&self.file)?)
    }

    /// 512-byte sectors backing the file
    pub fn real_block_count(&self) -> Result<u64> {
        Ok(raw_io::block_count(&self.file)?)
    }

    /// Length of the file, holes included
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// fdatasync if anything was written since the last flush
    pub fn flush(&self) -> Result<bool> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.file.sync_data()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Flush pending data. The descriptor is released when the last handle
    /// drops.
    pub fn close(&self) -> Result<()> {
        self.flush().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const KIB: u64 = 1024;

    fn new_normal(dir: &Path, id: u64) -> (Extent, VerifyFile) {
        let verify = VerifyFile::open(dir).unwrap();
        (Extent::init_to_fs(dir, id).unwrap(), verify)
    }

    #[test]
    fn test_init_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        Extent::init_to_fs(dir.path(), 1024).unwrap();
        assert!(matches!(
            Extent::init_to_fs(dir.path(), 1024),
            Err(Error::AlreadyExists(1024))
        ));
    }

    #[test]
    fn test_random_overwrite_with_matching_crc() {
        let dir = tempfile::tempdir().unwrap();
        let (e, verify) = new_normal(dir.path(), 1024);

        let data = vec![0x01u8; BLOCK_SIZE as usize];
        e.write(&data, 0, crc32(&data), WriteMode::Random, false, Some(&verify))
            .unwrap();
        let data2 = vec![0x02u8; BLOCK_SIZE as usize];
        let crc2 = crc32(&data2);
        e.write(&data2, 0, crc2, WriteMode::Random, false, Some(&verify))
            .unwrap();

        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        assert_eq!(e.read(&mut buf, 0).unwrap(), crc2);
        assert_eq!(buf, data2);
        assert_eq!(e.block_crc(0), crc2);
        assert_eq!(&verify.read_header(1024).unwrap()[0..4], &crc2.to_be_bytes());
    }

    #[test]
    fn test_random_overwrite_with_wrong_crc_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (e, verify) = new_normal(dir.path(), 1024);

        let data = vec![0x02u8; BLOCK_SIZE as usize];
        e.write(&data, 0, crc32(&data), WriteMode::Random, false, Some(&verify))
            .unwrap();

        let data2 = vec![0x03u8; 4096];
        let err = e
            .write(&data2, 4096, crc32(&data2) + 1, WriteMode::Random, false, Some(&verify))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalOverwrite {
                extent_id: 1024,
                block_no: 0
            }
        ));

        // the stored block is untouched
        let mut buf = vec![0u8; 4096];
        e.read(&mut buf, 4096).unwrap();
        assert!(buf.iter().all(|&b| b == 0x02));

        // a fresh block accepts the same payload
        e.write(
            &data2,
            BLOCK_SIZE,
            crc32(&data2) + 1,
            WriteMode::Random,
            false,
            Some(&verify),
        )
        .unwrap();

        // repair mode skips the check
        e.write(&data2, 4096, 0, WriteMode::Repair, false, Some(&verify))
            .unwrap();
    }

    #[test]
    fn test_replay_with_stored_crc_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (e, verify) = new_normal(dir.path(), 1024);

        let data = vec![0x05u8; BLOCK_SIZE as usize];
        let crc = crc32(&data);
        e.write(&data, 0, crc, WriteMode::Random, false, Some(&verify))
            .unwrap();
        let other = vec![0x06u8; 512];
        e.write(&other, 0, crc, WriteMode::Random, false, Some(&verify))
            .unwrap();
    }

    #[test]
    fn test_normal_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let (e, verify) = new_normal(dir.path(), 1024);
        let data = vec![1u8; 4096];
        assert!(matches!(
            e.write(&data, EXTENT_MAX_SIZE - 100, 0, WriteMode::Random, false, Some(&verify)),
            Err(Error::ParamMismatch(_))
        ));
        assert!(matches!(
            e.write(&[], 0, 0, WriteMode::Random, false, Some(&verify)),
            Err(Error::ParamMismatch(_))
        ));
        e.write(&data, 0, crc32(&data), WriteMode::Append, false, Some(&verify))
            .unwrap();
        assert!(matches!(
            e.write(&data, 0, crc32(&data), WriteMode::Append, false, Some(&verify)),
            Err(Error::ParamMismatch(_))
        ));
        let mut buf = vec![0u8; 8192];
        assert!(matches!(e.read(&mut buf, 0), Err(Error::ParamMismatch(_))));
    }

    #[test]
    fn test_block_crcs_match_contents_after_random_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (e, verify) = new_normal(dir.path(), 1024);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..40 {
            let offset = rng.gen_range(0..4 * BLOCK_SIZE);
            let size = rng.gen_range(1..=2 * BLOCK_SIZE) as usize;
            let mut data = vec![0u8; size];
            rng.fill(&mut data[..]);
            e.write(&data, offset, crc32(&data), WriteMode::Random, false, Some(&verify))
                .unwrap();
        }

        let combined = e.header_crc();
        assert_eq!(e.auto_compute_crc(Some(&verify)).unwrap(), combined);

        let data_size = e.data_size();
        for b in e.scan_blocks() {
            let start = b.block_no * BLOCK_SIZE;
            let len = (data_size - start).min(BLOCK_SIZE) as usize;
            let mut buf = vec![0u8; len];
            e.read(&mut buf, start).unwrap();
            assert_eq!(b.crc, block_crc(&buf), "block {}", b.block_no);
        }
    }

    #[test]
    fn test_restore_reloads_header() {
        let dir = tempfile::tempdir().unwrap();
        let (e, verify) = new_normal(dir.path(), 2048);
        let data = vec![9u8; 300 * KIB as usize];
        e.write(&data, 0, crc32(&data), WriteMode::Random, true, Some(&verify))
            .unwrap();
        let before = e.scan_blocks();
        drop(e);

        let e = Extent::restore_from_fs(dir.path(), 2048, Some(&verify)).unwrap();
        assert_eq!(e.data_size(), 300 * KIB);
        assert_eq!(e.scan_blocks(), before);
        assert_eq!(before.len(), 3);
    }

    #[test]
    fn test_tiny_append_punch_restore() {
        let dir = tempfile::tempdir().unwrap();
        let id = cubefs_common::TINY_EXTENT_START_ID;
        let e = Extent::init_to_fs(dir.path(), id).unwrap();

        let a = vec![0xAAu8; 8 * KIB as usize];
        e.write(&a, 0, 0, WriteMode::Append, false, None).unwrap();
        // 14 KiB ends mid-page and is padded up to 16 KiB
        let b = vec![0xBBu8; 14 * KIB as usize];
        e.write(&b, 8 * KIB, 0, WriteMode::Append, false, None)
            .unwrap();
        assert_eq!(e.data_size(), 24576);

        // append must start at the page-rounded end
        assert!(e.write(&a, 20 * KIB, 0, WriteMode::Append, false, None).is_err());
        assert!(e.write(&a, 0, 0, WriteMode::Random, false, None).is_err());

        assert!(e.delete_tiny(0, 4096).unwrap());
        assert!(!e.delete_tiny(0, 4096).unwrap());
        assert!(!e.delete_tiny(40960, 4096).unwrap());

        let mut buf = vec![1u8; 4096];
        e.read(&mut buf, 0).unwrap();
        assert!(buf.iter().all(|&x| x == 0));
        e.read(&mut buf, 4096).unwrap();
        assert!(buf.iter().all(|&x| x == 0xAA));
        drop(e);

        let e = Extent::restore_from_fs(dir.path(), id, None).unwrap();
        assert_eq!(e.data_size(), 24576);
    }

    #[test]
    fn test_tiny_avail_offset() {
        let dir = tempfile::tempdir().unwrap();
        let id = cubefs_common::TINY_EXTENT_START_ID + 1;
        let e = Extent::init_to_fs(dir.path(), id).unwrap();
        let data = vec![3u8; 16 * KIB as usize];
        e.write(&data, 0, 0, WriteMode::Append, false, None).unwrap();
        e.delete_tiny(0, 8192).unwrap();

        let (start, end) = e.tiny_extent_avail_offset(0).unwrap();
        assert_eq!((start, end), (8192, 16384));
        assert_eq!(e.tiny_extent_avail_offset(16384).unwrap(), (16384, 16384));
    }

    #[test]
    fn test_fill_tiny_hole_extends_size() {
        let dir = tempfile::tempdir().unwrap();
        let id = cubefs_common::TINY_EXTENT_START_ID + 2;
        let e = Extent::init_to_fs(dir.path(), id).unwrap();
        e.fill_tiny_hole(0, 8192).unwrap();
        assert_eq!(e.data_size(), 8192);
        let data = vec![4u8; 4096];
        e.write(&data, 8192, 0, WriteMode::Append, false, None)
            .unwrap();
        assert_eq!(e.data_size(), 12288);
    }
}
