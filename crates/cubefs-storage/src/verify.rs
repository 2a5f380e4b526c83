//! Verify file: the CRC headers of every normal extent in a partition,
//! concatenated and addressed by `extent_id * BLOCK_HEADER_SIZE`.

use crate::raw_io;
use cubefs_common::{BLOCK_CRC_SIZE, BLOCK_HEADER_SIZE, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub const VERIFY_FILE_NAME: &str = "EXTENT_CRC";

pub struct VerifyFile {
    file: File,
    path: PathBuf,
}

impl VerifyFile {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(VERIFY_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { file, path })
    }

    const fn header_offset(extent_id: u64) -> u64 {
        extent_id * BLOCK_HEADER_SIZE
    }

    /// Header of one extent; bytes past EOF read as zero.
    pub fn read_header(&self, extent_id: u64) -> Result<Vec<u8>> {
        let mut header = vec![0u8; BLOCK_HEADER_SIZE as usize];
        raw_io::read_full_at(&self.file, &mut header, Self::header_offset(extent_id))?;
        Ok(header)
    }

    /// Write the CRC entries starting at `first_block`.
    pub fn persist_block_crcs(&self, extent_id: u64, first_block: u64, crcs: &[u8]) -> Result<()> {
        let offset = Self::header_offset(extent_id) + first_block * BLOCK_CRC_SIZE;
        self.file.write_all_at(crcs, offset)?;
        Ok(())
    }

    /// Forget the header of a deleted extent.
    pub fn clear_header(&self, extent_id: u64) -> Result<()> {
        let offset = Self::header_offset(extent_id);
        if offset >= self.file.metadata()?.len() {
            return Ok(());
        }
        raw_io::punch_hole(&self.file, offset, BLOCK_HEADER_SIZE)?;
        Ok(())
    }

    /// Grow the file (sparsely) so headers up to `extent_id` are addressable.
    pub fn preallocate(&self, extent_id: u64) -> Result<()> {
        let want = Self::header_offset(extent_id + 1);
        if self.file.metadata()?.len() < want {
            self.file.set_len(want)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
