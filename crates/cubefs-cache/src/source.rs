//! Origin reads feeding a cache block

use crate::block::CacheBlock;
use async_trait::async_trait;
use cubefs_common::{DataSource, Result};

/// Reads one origin range and streams it into a block.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Read `source` from its replicas and push the bytes, in order, into
    /// `sink`. Returns the number of bytes written.
    async fn read_source(&self, source: &DataSource, sink: &mut BlockSink<'_>) -> Result<u64>;
}

/// Append cursor into a cache block, starting at a source's local offset.
pub struct BlockSink<'a> {
    block: &'a CacheBlock,
    offset: u64,
}

impl<'a> BlockSink<'a> {
    pub(crate) const fn new(block: &'a CacheBlock, offset: u64) -> Self {
        Self { block, offset }
    }

    /// Write `data` at the cursor and advance it.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.block.write_at(data, self.offset)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Offset inside the block the next write lands at
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}
