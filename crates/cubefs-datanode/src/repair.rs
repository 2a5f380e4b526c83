//! Replica repair
//!
//! Random-write repair pulls a byte range from a replica that already holds
//! it; tiny repair brings a broken tiny extent up to the longest replica
//! before it is handed out for appends again.

use crate::partition::DataPartition;
use cubefs_common::checksum::crc32;
use cubefs_common::{BLOCK_SIZE, Error, Result};
use cubefs_storage::WriteMode;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

impl DataPartition {
    /// Replica hosts other than this node
    fn other_hosts(&self) -> impl Iterator<Item = &String> {
        self.config
            .peers
            .iter()
            .filter(move |h| **h != self.config.local_addr)
    }

    /// Fetch `[offset, offset + size)` of a normal extent from the leader,
    /// falling back to the other replicas in order.
    pub async fn repair_data_on_random_write(&self, extent_id: u64, offset: u64, size: u64) -> Result<()> {
        self.stats.repairs.fetch_add(1, Ordering::Relaxed);
        let leader = self
            .raft
            .leader()
            .filter(|l| *l != self.config.local_addr);
        let candidates = leader
            .iter()
            .chain(self.other_hosts().filter(|h| Some(*h) != leader.as_ref()));

        let mut last_err = Error::PeerUnreachable(format!(
            "partition {} has no replica to repair extent {extent_id} from",
            self.partition_id()
        ));
        for host in candidates {
            match self.repair_from_host(host, extent_id, offset, size).await {
                Ok(()) => {
                    info!(partition_id = self.partition_id(), extent_id, offset, size, %host, "extent range repaired");
                    return Ok(());
                }
                Err(e) => {
                    debug!(partition_id = self.partition_id(), extent_id, %host, error = %e, "repair source failed");
                    last_err = e;
                }
            }
        }
        self.stats.repair_failures.fetch_add(1, Ordering::Relaxed);
        Err(last_err)
    }

    /// Copy a range from `host` block by block, verifying each chunk's crc.
    /// Stops early when the peer's extent ends inside the range.
    pub async fn repair_from_host(&self, host: &str, extent_id: u64, offset: u64, size: u64) -> Result<()> {
        let pid = self.partition_id();
        let end = offset + size;
        let mut cursor = offset;
        while cursor < end {
            let want = (end - cursor).min(BLOCK_SIZE);
            let (data, crc) = self
                .peers
                .read_extent(host, pid, extent_id, cursor, want)
                .await?;
            if data.is_empty() {
                return Err(Error::range_invalid(format!(
                    "{host} has no data for extent {extent_id} at {cursor}"
                )));
            }
            if crc32(&data) != crc {
                return Err(Error::internal(format!(
                    "repair data from {host} for extent {extent_id} at {cursor} failed crc check"
                )));
            }
            self.store
                .write(extent_id, cursor, &data, crc, WriteMode::Repair, false)?;
            cursor += data.len() as u64;
            if (data.len() as u64) < want {
                break;
            }
        }
        Ok(())
    }

    /// Whether every other replica has lost the extent or holds no more of
    /// it than this node.
    pub async fn check_delete_on_all_hosts(&self, extent_id: u64) -> bool {
        let pid = self.partition_id();
        let local_size = match self.store.load_extent_watermark(extent_id) {
            Ok(size) => size,
            Err(e) => {
                warn!(partition_id = pid, extent_id, error = %e, "local watermark unavailable, delete check fails");
                return false;
            }
        };
        let attempts = self.config.peer.repair_retry.max(1);
        let mut count = 0usize;
        for host in self.other_hosts() {
            for attempt in 1..=attempts {
                match self.peers.extent_info(host, pid, extent_id).await {
                    Ok(info) => {
                        if info.size <= local_size {
                            count += 1;
                        }
                        break;
                    }
                    Err(e) if e.is_not_found() => {
                        count += 1;
                        break;
                    }
                    Err(e) => {
                        debug!(partition_id = pid, extent_id, %host, attempt, error = %e, "extent info lookup failed");
                        if attempt < attempts {
                            tokio::time::sleep(self.config.peer.retry_interval()).await;
                        }
                    }
                }
            }
        }
        count == self.config.peers.len().saturating_sub(1)
    }

    /// Leader pass over the broken tiny extents, at most `max` of them.
    /// Returns how many became available.
    pub async fn repair_tiny_extents(&self, max: usize) -> usize {
        if !self.raft.is_leader() {
            return 0;
        }
        let tiny = self.store.tiny_extents();
        let rounds = max.min(tiny.broken_count());
        let mut repaired = 0;
        for _ in 0..rounds {
            let Ok(extent_id) = tiny.get_broken() else {
                break;
            };
            match self.repair_tiny_extent(extent_id).await {
                Ok(()) => {
                    tiny.send_to_available(extent_id);
                    repaired += 1;
                }
                Err(e) => {
                    warn!(partition_id = self.partition_id(), extent_id, error = %e, "tiny extent repair failed");
                    tiny.send_to_broken(extent_id);
                }
            }
        }
        repaired
    }

    /// Extend a tiny extent to the size of the longest reachable replica.
    async fn repair_tiny_extent(&self, extent_id: u64) -> Result<()> {
        let pid = self.partition_id();
        let local_size = self.store.load_extent_watermark(extent_id)?;
        let mut source: Option<(&String, u64)> = None;
        for host in self.other_hosts() {
            match self.peers.extent_info(host, pid, extent_id).await {
                Ok(info) => {
                    if info.size > source.map_or(local_size, |(_, s)| s) {
                        source = Some((host, info.size));
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(partition_id = pid, extent_id, %host, error = %e, "replica skipped for tiny repair");
                }
            }
        }
        let Some((host, target)) = source else {
            return Ok(());
        };

        let mut cursor = local_size;
        while cursor < target {
            let avail = self
                .peers
                .tiny_extent_avail_offset(host, pid, extent_id, cursor)
                .await?;
            let data_start = avail.start.clamp(cursor, target);
            if data_start > cursor || avail.end <= cursor {
                let hole_end = if data_start > cursor { data_start } else { target };
                self.store
                    .tiny_extent_recover(extent_id, cursor, hole_end - cursor, None)?;
                cursor = hole_end;
                continue;
            }
            let run_end = avail.end.min(target);
            while cursor < run_end {
                let want = (run_end - cursor).min(BLOCK_SIZE);
                let (data, crc) = self
                    .peers
                    .read_extent(host, pid, extent_id, cursor, want)
                    .await?;
                if data.is_empty() || crc32(&data) != crc {
                    return Err(Error::internal(format!(
                        "tiny repair read from {host} for extent {extent_id} at {cursor} is invalid"
                    )));
                }
                self.store
                    .tiny_extent_recover(extent_id, cursor, data.len() as u64, Some(&data[..]))?;
                cursor += data.len() as u64;
            }
        }
        info!(partition_id = pid, extent_id, from = local_size, to = target, %host, "tiny extent repaired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::partition::tests::{LOCAL, MockPeers, start, test_config};
    use std::sync::Arc;

    const PEER: &str = "127.0.0.2:17310";
    const PEER2: &str = "127.0.0.3:17310";

    #[tokio::test]
    async fn test_repair_prefers_leader() {
        let dir = tempfile::tempdir().unwrap();
        let peers = Arc::new(MockPeers::default());
        let (dp, raft) = start(test_config(dir.path(), &[LOCAL, PEER, PEER2]), peers.clone(), true).await;
        let id = dp.create_extent(None).unwrap();
        peers.put(PEER, id, vec![1u8; 8192]);
        peers.put(PEER2, id, vec![2u8; 8192]);

        // without a remote leader the hosts are tried in order
        dp.repair_data_on_random_write(id, 0, 8192).await.unwrap();
        assert_eq!(dp.read(id, 0, 8192, true).unwrap().0, vec![1u8; 8192]);

        raft.set_leader(PEER2).await;
        dp.repair_data_on_random_write(id, 0, 8192).await.unwrap();
        assert_eq!(dp.read(id, 0, 8192, true).unwrap().0, vec![2u8; 8192]);
    }

    #[tokio::test]
    async fn test_repair_from_host_stops_at_peer_end() {
        let dir = tempfile::tempdir().unwrap();
        let peers = Arc::new(MockPeers::default());
        let (dp, _raft) = start(test_config(dir.path(), &[LOCAL, PEER]), peers.clone(), true).await;
        let id = dp.create_extent(None).unwrap();
        let data: Vec<u8> = (0..300_000u32).map(|n| (n % 251) as u8).collect();
        peers.put(PEER, id, data.clone());

        dp.repair_from_host(PEER, id, 0, 400_000).await.unwrap();
        assert_eq!(dp.store().watermark(id).unwrap().size, 300_000);
        assert_eq!(dp.read(id, 0, 300_000, true).unwrap().0, data);

        assert!(dp.repair_from_host(PEER, id + 1, 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_check_delete_counts_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let peers = Arc::new(MockPeers::default());
        let (dp, _raft) = start(test_config(dir.path(), &[LOCAL, PEER, PEER2]), peers.clone(), true).await;
        let id = dp.create_extent(None).unwrap();

        // both unreachable
        assert!(!dp.check_delete_on_all_hosts(id).await);
        // one gone, one behind
        peers.reachable(PEER);
        peers.put(PEER2, id, Vec::new());
        assert!(dp.check_delete_on_all_hosts(id).await);
        // one ahead
        peers.put(PEER2, id, vec![0u8; 4096]);
        assert!(!dp.check_delete_on_all_hosts(id).await);

        // no local watermark: never treated as deleted, even with every peer gone
        dp.mark_delete(id, 0, 0).unwrap();
        peers.put(PEER2, id, Vec::new());
        assert!(!dp.check_delete_on_all_hosts(id).await);

        let dir = tempfile::tempdir().unwrap();
        let (single, _raft) = start(test_config(dir.path(), &[LOCAL]), Arc::default(), true).await;
        let local = single.create_extent(None).unwrap();
        assert!(single.check_delete_on_all_hosts(local).await);
        assert!(!single.check_delete_on_all_hosts(local + 1).await);
    }

    #[tokio::test]
    async fn test_tiny_repair_copies_tail_and_holes() {
        let dir = tempfile::tempdir().unwrap();
        let peers = Arc::new(MockPeers::default());
        let (dp, _raft) = start(test_config(dir.path(), &[LOCAL, PEER]), peers.clone(), true).await;
        let tiny = dp.store().tiny_extents();
        assert_eq!(tiny.broken_count(), 4);
        let ids = tiny.broken_ids();

        // peer copy of the first tiny extent: data, a punched page, data
        let mut remote = vec![0u8; 3 * 4096];
        remote[..4096].fill(0xAA);
        remote[2 * 4096..].fill(0xBB);
        peers.put(PEER, ids[0], remote.clone());

        assert_eq!(dp.repair_tiny_extents(16).await, 4);
        assert_eq!(tiny.available_count(), 4);
        assert_eq!(tiny.broken_count(), 0);
        assert_eq!(dp.store().watermark(ids[0]).unwrap().size, 3 * 4096);
        let (buf, _) = dp.read(ids[0], 0, 3 * 4096, false).unwrap();
        assert_eq!(buf, remote);
        assert_eq!(dp.store().tiny_extent_avail_offset(ids[0], 4096).unwrap(), (2 * 4096, 3 * 4096));
    }

    #[tokio::test]
    async fn test_tiny_repair_failure_stays_broken() {
        let dir = tempfile::tempdir().unwrap();
        let peers = Arc::new(MockPeers::default());
        let (dp, raft) = start(test_config(dir.path(), &[LOCAL, PEER]), peers.clone(), true).await;
        let tiny = dp.store().tiny_extents();
        let ids = tiny.broken_ids();
        peers.put(PEER, ids[1], vec![0xCC; 4096]);
        // a crc mismatch on the data read fails the repair
        peers.corrupt_reads(PEER);

        assert_eq!(dp.repair_tiny_extents(16).await, 3);
        assert_eq!(tiny.broken_ids(), vec![ids[1]]);

        raft.set_leader(PEER).await;
        assert_eq!(dp.repair_tiny_extents(16).await, 0);
    }
}
