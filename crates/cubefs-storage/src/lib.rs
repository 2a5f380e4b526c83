//! CubeFS Storage - extent store of a data partition
//!
//! This crate provides:
//! - Extent files with per-block CRC headers (`extent`, `verify`)
//! - The in-memory extent info map (`info_store`)
//! - An LRU of open extent handles (`cache`)
//! - Tiny extent bookkeeping (`tiny_delete`, `tiny_arbiter`)
//! - The partition-scoped [`ExtentStore`] tying them together

pub mod cache;
pub mod extent;
pub mod info_store;
pub mod raw_io;
pub mod recent_delete;
pub mod store;
pub mod tiny_arbiter;
pub mod tiny_delete;
pub mod verify;

pub use cache::{CacheStats, ExtentCache};
pub use extent::{BlockCrc, Extent, WriteMode};
pub use info_store::ExtentInfoStore;
pub use store::{
    ExtentFilter, ExtentStore, ExtentStoreConfig, SnapshotFile, StoreStats, normal_extent_filter,
    tiny_extent_filter,
};
pub use tiny_arbiter::TinyExtentArbiter;
pub use tiny_delete::{TinyDeleteJournal, TinyDeleteRecord};
