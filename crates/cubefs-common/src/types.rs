//! Core type definitions
//!
//! Extent geometry, id ranges, opcodes and the small wire types that travel
//! between data nodes and flash nodes.

use serde::{Deserialize, Serialize};

/// Filesystem page size; tiny extents and cache fills are aligned to it.
pub const PAGE_SIZE: u64 = 4096;

/// Size of one CRC-protected block in a normal extent.
pub const BLOCK_SIZE: u64 = 128 * 1024;

/// Number of blocks in a normal extent.
pub const BLOCK_COUNT: u64 = 1024;

/// Bytes of CRC per block in an extent header.
pub const BLOCK_CRC_SIZE: u64 = 4;

/// Size of the CRC header of one normal extent.
pub const BLOCK_HEADER_SIZE: u64 = BLOCK_COUNT * BLOCK_CRC_SIZE;

/// Maximum logical size of a normal extent (128 MiB).
pub const EXTENT_MAX_SIZE: u64 = BLOCK_COUNT * BLOCK_SIZE;

/// First id usable by a normal extent; `[1, MIN_EXTENT_ID)` is reserved.
pub const MIN_EXTENT_ID: u64 = 1024;

/// First tiny extent id.
pub const TINY_EXTENT_START_ID: u64 = 5_000_000;

/// Number of tiny extents reserved per partition.
pub const TINY_EXTENT_COUNT: u64 = 64;

/// Cache block size and alignment (2 MiB).
pub const CACHE_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Returns true if the id falls in the tiny extent range.
#[must_use]
pub const fn is_tiny_extent(extent_id: u64) -> bool {
    extent_id >= TINY_EXTENT_START_ID && extent_id < TINY_EXTENT_START_ID + TINY_EXTENT_COUNT
}

/// Returns true if the id is a legal normal extent id.
#[must_use]
pub const fn is_normal_extent(extent_id: u64) -> bool {
    extent_id >= MIN_EXTENT_ID && extent_id < TINY_EXTENT_START_ID
}

/// Round `n` up to the next page boundary.
#[must_use]
pub const fn page_align_up(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Returns true if `n` is a multiple of the page size.
#[must_use]
pub const fn is_page_aligned(n: u64) -> bool {
    n % PAGE_SIZE == 0
}

/// Current wall-clock time in unix seconds.
#[must_use]
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Tiny extent ids served by a partition.
pub fn tiny_extent_ids() -> impl Iterator<Item = u64> {
    TINY_EXTENT_START_ID..TINY_EXTENT_START_ID + TINY_EXTENT_COUNT
}

/// Which extents an iteration should visit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentKind {
    All,
    Normal,
    Tiny,
}

impl ExtentKind {
    #[must_use]
    pub const fn matches(self, extent_id: u64) -> bool {
        match self {
            Self::All => true,
            Self::Normal => !is_tiny_extent(extent_id),
            Self::Tiny => is_tiny_extent(extent_id),
        }
    }
}

/// Point-in-time view of an extent's info entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentInfo {
    pub file_id: u64,
    pub size: u64,
    /// Unix seconds of the last write
    pub modify_time: i64,
    pub crc: u32,
}

/// Operation codes carried in raft payloads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Write = 0x01,
    RandomWrite = 0x0F,
    SyncRandomWrite = 0x33,
    MarkDelete = 0x06,
}

impl Opcode {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn is_random_write(self) -> bool {
        matches!(self, Self::RandomWrite | Self::SyncRandomWrite)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = crate::Error;

    fn try_from(v: u8) -> crate::Result<Self> {
        match v {
            0x01 => Ok(Self::Write),
            0x0F => Ok(Self::RandomWrite),
            0x33 => Ok(Self::SyncRandomWrite),
            0x06 => Ok(Self::MarkDelete),
            other => Err(crate::Error::Deserialization(format!(
                "unknown opcode {other:#x}"
            ))),
        }
    }
}

/// Result codes returned by apply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResultCode {
    OpOk = 0xF0,
    OpDiskErr = 0xF4,
    OpArgMismatchErr = 0xF6,
    OpNotExistErr = 0xF7,
    OpTryOtherAddr = 0xFA,
    OpAgain = 0xF9,
}

impl ResultCode {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::OpOk)
    }
}

/// One origin range hydrated into a cache block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub partition_id: u64,
    pub extent_id: u64,
    /// Offset inside the extent
    pub extent_offset: u64,
    /// Offset inside the file the cache block belongs to
    pub file_offset: u64,
    pub size: u64,
    /// Replica hosts, leader first
    pub hosts: Vec<String>,
}

/// JSON envelope used by every node HTTP API
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpReply<T> {
    pub code: i32,
    pub msg: String,
    pub data: Option<T>,
}

impl<T> HttpReply<T> {
    pub const CODE_OK: i32 = 0;
    pub const CODE_ERR: i32 = 1;

    pub fn ok(data: T) -> Self {
        Self {
            code: Self::CODE_OK,
            msg: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            code: Self::CODE_ERR,
            msg: msg.into(),
            data: None,
        }
    }
}
