//! CubeFS Cache - flash node read cache
//!
//! Fixed-size cache blocks live as files on tmpfs. A block is hydrated once
//! from its origin extents by a bounded pool of workers, then served to every
//! reader that waited on it.

pub mod block;
pub mod engine;
pub mod key;
pub mod source;

pub use block::{CacheBlock, CacheState};
pub use engine::{CacheEngine, CacheEngineConfig, CacheStatus, EngineStats};
pub use key::{CacheBlockKey, compute_alloc_size};
pub use source::{BlockSink, SourceReader};
