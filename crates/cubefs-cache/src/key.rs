//! Cache block identity and sizing

use cubefs_common::{DataSource, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fingerprint of a cache block.
///
/// `fixed_offset` is the file offset of the block, aligned to the block
/// size. Bumping `version` makes a producer's earlier contents unreachable.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheBlockKey {
    pub volume: String,
    pub inode: u64,
    pub fixed_offset: u64,
    pub version: u32,
}

impl CacheBlockKey {
    pub fn new(volume: impl Into<String>, inode: u64, fixed_offset: u64, version: u32) -> Self {
        Self {
            volume: volume.into(),
            inode,
            fixed_offset,
            version,
        }
    }

    /// Key of the block of `block_size` that holds `file_offset`
    pub fn containing(
        volume: impl Into<String>,
        inode: u64,
        file_offset: u64,
        version: u32,
        block_size: u64,
    ) -> Self {
        Self::new(volume, inode, file_offset & !(block_size - 1), version)
    }

    /// Map key, also the block file path relative to the cache root
    #[must_use]
    pub fn block_key(&self) -> String {
        format!(
            "{}/{}#{}#{}",
            self.volume, self.inode, self.fixed_offset, self.version
        )
    }
}

impl fmt::Display for CacheBlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "volume({}) inode({}) offset({}) version({})",
            self.volume, self.inode, self.fixed_offset, self.version
        )
    }
}

/// Bytes of tmpfs a block must reserve to hold every source: the pages each
/// source spans inside the block, summed. Returns 0 if any source is empty.
#[must_use]
pub fn compute_alloc_size(sources: &[DataSource], block_size: u64) -> u64 {
    let mut alloc = 0;
    for source in sources {
        if source.size == 0 {
            return 0;
        }
        let block_offset = source.file_offset & (block_size - 1);
        let block_end = block_offset + source.size - 1;
        let pages = block_end / PAGE_SIZE - block_offset / PAGE_SIZE + 1;
        alloc += pages * PAGE_SIZE;
    }
    alloc
}
