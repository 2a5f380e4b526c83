//! CubeFS data node
//!
//! Data partitions on top of the extent store: the raft random-write
//! pipeline, persist, replica repair, the partition space manager and the
//! node HTTP API.

pub mod http;
pub mod issue;
pub mod partition;
pub mod payload;
pub mod peer;
pub mod raft;
mod repair;
pub mod space;

pub use issue::{Fragment, IssueProcessor};
pub use partition::{
    DataPartition, DataPartitionConfig, PartitionMetadata, PartitionStatus, SnapshotRecord,
};
pub use payload::RandomWriteCommand;
pub use peer::{HttpPeerClient, PeerClient};
pub use raft::{LocalRaft, RaftPartition, StateMachine};
pub use space::SpaceManager;
