//! Configuration types
//!
//! Node configuration is read from TOML. Keys use the camelCase names the
//! rest of the cluster tooling already writes.

use crate::error::{Error, Result};
use crate::types::CACHE_BLOCK_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("failed to read {}: {e}", path.display()))
    })?;
    toml::from_str(&content)
        .map_err(|e| Error::Configuration(format!("failed to parse {}: {e}", path.display())))
}

/// Timeouts and retry policy for peer RPCs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerConfig {
    /// Connect timeout (ns)
    pub peer_connect: u64,
    /// Read timeout (ns)
    pub peer_read: u64,
    /// Write timeout (ns)
    pub peer_write: u64,
    /// Idle pooled connection timeout (ns)
    pub peer_idle: u64,
    /// Attempts per peer for extent-info lookups
    pub repair_retry: u32,
    /// Sleep between lookup attempts
    pub repair_retry_interval_ms: u64,
    /// HTTP port of peer data nodes
    pub http_port: u16,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            peer_connect: 1_000_000_000,
            peer_read: 5_000_000_000,
            peer_write: 5_000_000_000,
            peer_idle: 30_000_000_000,
            repair_retry: 3,
            repair_retry_interval_ms: 1000,
            http_port: 17320,
        }
    }
}

impl PeerConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_nanos(self.peer_connect)
    }

    /// Whole-request deadline: a request writes then reads.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_nanos(self.peer_read.saturating_add(self.peer_write))
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_nanos(self.peer_idle)
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.repair_retry_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.peer_connect == 0 || self.peer_read == 0 || self.peer_write == 0 {
            return Err(Error::Configuration(
                "peer timeouts must be greater than zero".into(),
            ));
        }
        if self.repair_retry == 0 {
            return Err(Error::Configuration("repairRetry must be at least 1".into()));
        }
        Ok(())
    }
}

/// A partition this node hosts. Stands in for the assignment a master would
/// push.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionConfig {
    pub partition_id: u64,
    pub volume_id: String,
    /// Soft size cap in bytes
    pub partition_size: u64,
    /// Replica addresses, including this node
    pub peers: Vec<String>,
}

/// Data node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataNodeConfig {
    /// HTTP listen address
    pub listen: String,
    /// Replica address other nodes know this node by
    pub local_addr: String,
    /// Root directory holding partition directories
    pub data_path: PathBuf,
    /// Soft cap on the bytes a partition may hold
    pub store_capacity: u64,
    /// Open extent handles kept per partition
    pub cache_capacity: usize,
    /// Idle seconds before a cached handle is closed
    pub cache_idle_sec: u64,
    pub tiny_extent_reserved_count: u64,
    #[serde(rename = "baseExtentIDPersistStep")]
    pub base_extent_id_persist_step: u64,
    /// Allocations between fsyncs of the base id
    #[serde(rename = "baseExtentIDSyncStep")]
    pub base_extent_id_sync_step: u64,
    /// How long a deleted normal extent id stays in the recently-deleted table
    pub recent_delete_ttl_sec: u64,
    pub persist_interval_sec: u64,
    pub cache_evict_interval_sec: u64,
    #[serde(flatten)]
    pub peer: PeerConfig,
    pub partitions: Vec<PartitionConfig>,
}

impl Default for DataNodeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:17320".to_string(),
            local_addr: "127.0.0.1:17310".to_string(),
            data_path: PathBuf::from("/var/lib/cubefs/datanode"),
            store_capacity: 120 * 1024 * 1024 * 1024,
            cache_capacity: 1024,
            cache_idle_sec: 300,
            tiny_extent_reserved_count: 64,
            base_extent_id_persist_step: 500,
            base_extent_id_sync_step: 400,
            recent_delete_ttl_sec: 24 * 3600,
            persist_interval_sec: 60,
            cache_evict_interval_sec: 120,
            peer: PeerConfig::default(),
            partitions: Vec::new(),
        }
    }
}

impl DataNodeConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_toml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the storage core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(Error::Configuration("cacheCapacity must be at least 1".into()));
        }
        if self.tiny_extent_reserved_count == 0 || self.tiny_extent_reserved_count > 64 {
            return Err(Error::Configuration(
                "tinyExtentReservedCount must be within 1..=64".into(),
            ));
        }
        if self.base_extent_id_persist_step == 0 || self.base_extent_id_sync_step == 0 {
            return Err(Error::Configuration(
                "base extent id steps must be greater than zero".into(),
            ));
        }
        if self.base_extent_id_sync_step >= 1000 {
            return Err(Error::Configuration(
                "baseExtentIDSyncStep must stay below the 1000 id reload gap".into(),
            ));
        }
        for p in &self.partitions {
            if p.peers.is_empty() {
                return Err(Error::Configuration(format!(
                    "partition {} has no peers",
                    p.partition_id
                )));
            }
        }
        self.peer.validate()
    }

    #[must_use]
    pub const fn cache_idle(&self) -> Duration {
        Duration::from_secs(self.cache_idle_sec)
    }

    #[must_use]
    pub const fn recent_delete_ttl(&self) -> Duration {
        Duration::from_secs(self.recent_delete_ttl_sec)
    }
}

/// Flash node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlashNodeConfig {
    /// HTTP listen address
    pub listen: String,
    /// tmpfs mount holding cache block files
    pub cache_path: PathBuf,
    /// Bytes of tmpfs the engine may reserve
    pub cache_total_capacity: u64,
    pub cache_block_size: u64,
    pub cache_block_worker_max: usize,
    /// Idle seconds before a ready block is evicted
    pub cache_block_ttl_sec: u64,
    #[serde(flatten)]
    pub peer: PeerConfig,
}

impl Default for FlashNodeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:17510".to_string(),
            cache_path: PathBuf::from("/dev/shm/cubefs-flash"),
            cache_total_capacity: 4 * 1024 * 1024 * 1024,
            cache_block_size: CACHE_BLOCK_SIZE,
            cache_block_worker_max: 20,
            cache_block_ttl_sec: 3600,
            peer: PeerConfig::default(),
        }
    }
}

impl FlashNodeConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_toml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cache_block_size.is_power_of_two() {
            return Err(Error::Configuration(
                "cacheBlockSize must be a power of two".into(),
            ));
        }
        if self.cache_block_worker_max == 0 {
            return Err(Error::Configuration(
                "cacheBlockWorkerMax must be at least 1".into(),
            ));
        }
        if self.cache_total_capacity < self.cache_block_size {
            return Err(Error::Configuration(
                "cacheTotalCapacity must hold at least one block".into(),
            ));
        }
        self.peer.validate()
    }

    #[must_use]
    pub const fn cache_block_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_block_ttl_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        DataNodeConfig::default().validate().unwrap();
        FlashNodeConfig::default().validate().unwrap();
        let cfg = DataNodeConfig::default();
        assert_eq!(cfg.tiny_extent_reserved_count, 64);
        assert_eq!(cfg.base_extent_id_persist_step, 500);
        assert_eq!(cfg.peer.repair_retry, 3);
        assert_eq!(FlashNodeConfig::default().cache_block_worker_max, 20);
    }

    #[test]
    fn test_datanode_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datanode.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
dataPath = "/data/cubefs"
cacheCapacity = 64
baseExtentIDPersistStep = 100
peerConnect = 2000000000
repairRetry = 5

[[partitions]]
partitionId = 7
volumeId = "vol1"
partitionSize = 1073741824
peers = ["10.0.0.1:17310", "10.0.0.2:17310"]
"#
        )
        .unwrap();

        let cfg = DataNodeConfig::from_file(&path).unwrap();
        assert_eq!(cfg.data_path, PathBuf::from("/data/cubefs"));
        assert_eq!(cfg.cache_capacity, 64);
        assert_eq!(cfg.base_extent_id_persist_step, 100);
        assert_eq!(cfg.peer.connect_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.peer.repair_retry, 5);
        assert_eq!(cfg.partitions.len(), 1);
        assert_eq!(cfg.partitions[0].peers.len(), 2);
        // untouched keys keep defaults
        assert_eq!(cfg.cache_idle_sec, 300);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cfg = DataNodeConfig {
            tiny_extent_reserved_count: 65,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        let cfg = FlashNodeConfig {
            cache_block_size: 3 * 1024 * 1024,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
