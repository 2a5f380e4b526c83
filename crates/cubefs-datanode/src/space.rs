//! Partition space manager
//!
//! Owns every data partition on the node: finds partition directories under
//! the data path, creates the assigned ones that are missing, and runs the
//! periodic maintenance that keeps them healthy.

use crate::partition::{
    DataPartition, DataPartitionConfig, load_metadata, parse_partition_dir_name,
    partition_dir_name,
};
use crate::peer::PeerClient;
use crate::raft::{LocalRaft, StateMachine};
use cubefs_common::{DataNodeConfig, Error, PartitionConfig, Result};
use cubefs_storage::ExtentStoreConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Broken tiny extents a leader repairs per pass
const TINY_REPAIR_BATCH: usize = 8;

const TINY_REPAIR_INTERVAL: Duration = Duration::from_secs(30);

pub struct SpaceManager {
    config: DataNodeConfig,
    peer_client: Arc<dyn PeerClient>,
    partitions: DashMap<u64, Arc<DataPartition>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SpaceManager {
    pub fn new(config: DataNodeConfig, peer_client: Arc<dyn PeerClient>) -> Self {
        Self {
            config,
            peer_client,
            partitions: DashMap::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub const fn config(&self) -> &DataNodeConfig {
        &self.config
    }

    pub fn partition(&self, partition_id: u64) -> Option<Arc<DataPartition>> {
        self.partitions.get(&partition_id).map(|p| Arc::clone(p.value()))
    }

    /// All partitions ordered by id
    pub fn partitions(&self) -> Vec<Arc<DataPartition>> {
        let mut all: Vec<_> = self.partitions.iter().map(|p| Arc::clone(p.value())).collect();
        all.sort_by_key(|p| p.partition_id());
        all
    }

    fn partition_config(&self, assignment: &PartitionConfig) -> DataPartitionConfig {
        let dir = self.config.data_path.join(partition_dir_name(
            assignment.partition_id,
            assignment.partition_size,
        ));
        let mut store = ExtentStoreConfig::new(dir, assignment.partition_id);
        store.store_size = assignment.partition_size.min(self.config.store_capacity);
        store.cache_capacity = self.config.cache_capacity;
        store.cache_ttl = self.config.cache_idle();
        store.tiny_extent_count = self.config.tiny_extent_reserved_count;
        store.base_id_persist_step = self.config.base_extent_id_persist_step;
        store.base_id_sync_step = self.config.base_extent_id_sync_step;
        store.recent_delete_ttl = self.config.recent_delete_ttl();
        DataPartitionConfig {
            partition_id: assignment.partition_id,
            volume_id: assignment.volume_id.clone(),
            partition_size: assignment.partition_size,
            peers: assignment.peers.clone(),
            local_addr: self.config.local_addr.clone(),
            create_type: 0,
            store,
            peer: self.config.peer.clone(),
        }
    }

    /// Open every partition directory under the data path, then create the
    /// assigned partitions that were not found.
    pub async fn load(&self) -> Result<()> {
        fs::create_dir_all(&self.config.data_path)?;
        let mut dirs: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.config.data_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some((partition_id, _)) = name.to_str().and_then(parse_partition_dir_name) {
                dirs.push((partition_id, entry.path()));
            }
        }
        dirs.sort();

        for (partition_id, dir) in dirs {
            let meta = match load_metadata(&dir) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(partition_id, path = %dir.display(), error = %e, "skipping partition without metadata");
                    continue;
                }
            };
            let assignment = PartitionConfig {
                partition_id,
                volume_id: meta.volume_id,
                partition_size: meta.partition_size,
                peers: meta.peers,
            };
            let mut config = self.partition_config(&assignment);
            config.store.data_path = dir;
            config.create_type = meta.create_type;
            if let Err(e) = self.attach(config, false).await {
                error!(partition_id, error = %e, "failed to open data partition");
            }
        }

        let assigned = self.config.partitions.clone();
        for assignment in assigned {
            if self.partitions.contains_key(&assignment.partition_id) {
                continue;
            }
            self.create_partition(&assignment).await?;
        }
        info!(partitions = self.partitions.len(), "space manager loaded");
        Ok(())
    }

    /// Create and register a new partition.
    pub async fn create_partition(&self, assignment: &PartitionConfig) -> Result<Arc<DataPartition>> {
        if self.partitions.contains_key(&assignment.partition_id) {
            return Err(Error::Configuration(format!(
                "partition {} already loaded",
                assignment.partition_id
            )));
        }
        let config = self.partition_config(assignment);
        self.attach(config, true).await
    }

    /// Build the partition and its raft, register it and start its store
    /// tick. Reopened partitions load their normal extents in the background.
    async fn attach(&self, mut config: DataPartitionConfig, create: bool) -> Result<Arc<DataPartition>> {
        config.peers.sort();
        let leader = config.peers.first().cloned();
        let raft = Arc::new(LocalRaft::new(config.local_addr.clone(), leader.clone()));
        let partition_id = config.partition_id;
        let dp = if create {
            DataPartition::create(config, raft.clone(), Arc::clone(&self.peer_client))?
        } else {
            DataPartition::open(config, raft.clone(), Arc::clone(&self.peer_client))?
        };
        raft.start_at(dp.applied_id()).await;
        let weak: Weak<dyn StateMachine> = Arc::downgrade(&dp) as Weak<dyn StateMachine>;
        raft.bind(weak);
        if let Some(leader) = leader {
            raft.set_leader(leader).await;
        }

        if !create {
            let loading = Arc::clone(&dp);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = loading.load() {
                    error!(partition_id, error = %e, "extent store load failed");
                }
            });
        }

        let interval = Duration::from_secs(self.config.persist_interval_sec.max(1));
        let tick = tokio::spawn(Arc::clone(&dp).run_store_tick(interval, self.cancel.child_token()));
        self.tasks.lock().push(tick);
        self.partitions.insert(partition_id, Arc::clone(&dp));
        Ok(dp)
    }

    /// Start the node-wide maintenance loops.
    pub fn start_maintenance(self: &Arc<Self>) {
        let evict_every = Duration::from_secs(self.config.cache_evict_interval_sec.max(1));
        let maintenance = tokio::spawn(Arc::clone(self).maintenance_loop(evict_every));
        let tiny_repair = tokio::spawn(Arc::clone(self).tiny_repair_loop(TINY_REPAIR_INTERVAL));
        let mut tasks = self.tasks.lock();
        tasks.push(maintenance);
        tasks.push(tiny_repair);
    }

    /// Cache eviction, recently-deleted expiry, CRC autocompute and raft
    /// log truncation for every partition.
    async fn maintenance_loop(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for dp in self.partitions() {
                let store_dp = Arc::clone(&dp);
                let swept = tokio::task::spawn_blocking(move || {
                    let store = store_dp.store();
                    (
                        store.evict_expired_cache(),
                        store.evict_expired_recent_deletes(),
                        store.auto_compute_extent_crc(),
                    )
                })
                .await;
                match swept {
                    Ok((closed, expired, crcs)) => debug!(
                        partition_id = dp.partition_id(),
                        closed, expired, crcs, "partition maintenance"
                    ),
                    Err(e) => error!(partition_id = dp.partition_id(), error = %e, "maintenance task failed"),
                }
                if let Err(e) = dp.truncate_raft_log().await {
                    warn!(partition_id = dp.partition_id(), error = %e, "raft log truncation failed");
                }
            }
        }
    }

    async fn tiny_repair_loop(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for dp in self.partitions() {
                if !dp.is_store_tick_running() {
                    continue;
                }
                let repaired = dp.repair_tiny_extents(TINY_REPAIR_BATCH).await;
                if repaired > 0 {
                    info!(partition_id = dp.partition_id(), repaired, "tiny extents available again");
                }
            }
        }
    }

    /// Stop every loop, persist and close every partition.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        for dp in self.partitions() {
            if let Err(e) = dp.stop().await {
                error!(partition_id = dp.partition_id(), error = %e, "partition stop failed");
            }
        }
        info!("space manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::tests::{LOCAL, MockPeers};
    use crate::payload::RandomWriteCommand;
    use bytes::Bytes;
    use cubefs_common::checksum::crc32;
    use cubefs_common::{Opcode, ResultCode};

    fn node_config(dir: &std::path::Path) -> DataNodeConfig {
        DataNodeConfig {
            data_path: dir.to_path_buf(),
            local_addr: LOCAL.to_string(),
            tiny_extent_reserved_count: 2,
            partitions: vec![PartitionConfig {
                partition_id: 3,
                volume_id: "vol".to_string(),
                partition_size: 1 << 30,
                peers: vec![LOCAL.to_string()],
            }],
            ..DataNodeConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let peers: Arc<dyn PeerClient> = Arc::new(MockPeers::default());
        let space = Arc::new(SpaceManager::new(node_config(dir.path()), Arc::clone(&peers)));
        space.load().await.unwrap();
        space.start_maintenance();

        let dp = space.partition(3).unwrap();
        assert!(dp.raft().is_leader());
        assert!(dp.is_store_tick_running());
        assert!(dir.path().join(partition_dir_name(3, 1 << 30)).is_dir());
        let id = dp.create_extent(None).unwrap();
        let data = vec![4u8; 4096];
        let cmd = RandomWriteCommand::new(Opcode::RandomWrite, id, 0, Bytes::from(data.clone()), crc32(&data));
        assert_eq!(dp.submit(cmd).await.unwrap(), ResultCode::OpOk);
        drop(dp);
        space.shutdown().await;

        // same directory, no assignments: the partition is found on disk
        let mut config = node_config(dir.path());
        config.partitions.clear();
        let space = SpaceManager::new(config, peers);
        space.load().await.unwrap();
        let dp = space.partition(3).unwrap();
        assert_eq!(dp.applied_id(), 1);
        for _ in 0..200 {
            if dp.store().is_finish_load() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dp.read(id, 0, 4096, false).unwrap().0, data);
        assert_eq!(space.partitions().len(), 1);
        assert!(space.create_partition(&node_config(dir.path()).partitions[0]).await.is_err());
        space.shutdown().await;
    }
}
