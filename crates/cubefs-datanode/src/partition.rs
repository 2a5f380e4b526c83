//! Data partition
//!
//! One replica of a data partition: an extent store driven by a raft group.
//! Random writes are proposed through [`DataPartition::submit`] and executed
//! by [`StateMachine::apply`]; everything else (appends, creates, deletes,
//! reads) goes to the store directly.
//!
//! The partition directory holds the store files plus:
//!
//! ```text
//! APPLIED_ID   decimal applied raft index, atomic-renamed on persist
//! META        JSON partition metadata, atomic-renamed on persist
//! ```

use crate::issue::IssueProcessor;
use crate::payload::RandomWriteCommand;
use crate::peer::{PeerClient, host_ip};
use crate::raft::{RaftPartition, StateMachine};
use async_trait::async_trait;
use bytes::Bytes;
use cubefs_common::{
    Error, ExtentInfo, ExtentKind, PeerConfig, Result, ResultCode, is_normal_extent,
    unix_timestamp,
};
use cubefs_storage::{ExtentStore, ExtentStoreConfig, WriteMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const APPLIED_ID_FILE_NAME: &str = "APPLIED_ID";
pub const APPLIED_ID_TMP_FILE_NAME: &str = "applied_id.tmp";
pub const META_FILE_NAME: &str = "META";
pub const META_TMP_FILE_NAME: &str = "meta.tmp";

const PARTITION_DIR_PREFIX: &str = "datapartition_";

/// Store writes tried per random-write entry
const APPLY_ATTEMPTS: usize = 2;

/// Directory name of a partition: `datapartition_{id}_{size}`
pub fn partition_dir_name(partition_id: u64, partition_size: u64) -> String {
    format!("{PARTITION_DIR_PREFIX}{partition_id}_{partition_size}")
}

/// Inverse of [`partition_dir_name`]
pub fn parse_partition_dir_name(name: &str) -> Option<(u64, u64)> {
    let (id, size) = name.strip_prefix(PARTITION_DIR_PREFIX)?.split_once('_')?;
    Some((id.parse().ok()?, size.parse().ok()?))
}

#[derive(Clone, Debug)]
pub struct DataPartitionConfig {
    pub partition_id: u64,
    pub volume_id: String,
    pub partition_size: u64,
    /// Replica addresses, this node included
    pub peers: Vec<String>,
    pub local_addr: String,
    pub create_type: u32,
    pub store: ExtentStoreConfig,
    pub peer: PeerConfig,
}

/// Persisted partition metadata (`META`)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartitionMetadata {
    pub volume_id: String,
    pub partition_id: u64,
    pub partition_size: u64,
    /// Sorted
    pub peers: Vec<String>,
    pub create_type: u32,
    pub last_truncate_id: u64,
    pub last_update_time: i64,
    pub is_catch_up: bool,
    pub create_time: i64,
}

impl PartitionMetadata {
    fn same_content(&self, other: &Self) -> bool {
        Self {
            last_update_time: 0,
            ..self.clone()
        } == Self {
            last_update_time: 0,
            ..other.clone()
        }
    }
}

/// Read the `META` file of a partition directory
pub fn load_metadata(dir: &Path) -> Result<PartitionMetadata> {
    let raw = fs::read(dir.join(META_FILE_NAME))?;
    serde_json::from_slice(&raw)
        .map_err(|e| Error::Deserialization(format!("{}: {e}", dir.display())))
}

/// One record of a partition snapshot stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value")]
pub enum SnapshotRecord {
    ExtentInfo(ExtentInfo),
    ApplyId(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    StoreTick,
}

/// Request to the store tick loop
#[derive(Clone, Copy, Debug)]
pub struct StoreMsg {
    pub op: StoreOp,
    pub applied_id: u64,
}

#[derive(Debug, Default)]
pub struct PartitionStats {
    pub overwrite_bytes: AtomicU64,
    pub applied_entries: AtomicU64,
    pub apply_failures: AtomicU64,
    pub disk_errors: AtomicU64,
    pub repairs: AtomicU64,
    pub repair_failures: AtomicU64,
    pub persists: AtomicU64,
}

/// Partition status reported by `GET /partition`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionStatus {
    pub partition_id: u64,
    pub volume_id: String,
    pub partition_size: u64,
    pub peers: Vec<String>,
    pub leader: Option<String>,
    pub is_leader: bool,
    pub applied_id: u64,
    pub persisted_applied_id: u64,
    pub committed_index: u64,
    pub extent_count: usize,
    pub used_size: u64,
    pub base_extent_id: u64,
    pub tiny_available: usize,
    pub tiny_broken: usize,
    pub issue_fragments: usize,
    pub is_loaded: bool,
}

pub struct DataPartition {
    pub(crate) config: DataPartitionConfig,
    pub(crate) store: ExtentStore,
    pub(crate) raft: Arc<dyn RaftPartition>,
    pub(crate) peers: Arc<dyn PeerClient>,
    pub(crate) issues: IssueProcessor,
    pub(crate) stats: PartitionStats,
    path: PathBuf,
    apply_id: AtomicU64,
    persisted_apply_id: AtomicU64,
    last_truncate_id: AtomicU64,
    persist_lock: Semaphore,
    persisted_meta: Mutex<Option<PartitionMetadata>>,
    create_time: i64,
    is_catch_up: AtomicBool,
    store_tick_running: AtomicBool,
    store_msg_tx: mpsc::UnboundedSender<StoreMsg>,
    store_msg_rx: Mutex<Option<mpsc::UnboundedReceiver<StoreMsg>>>,
    extent_reset: Notify,
}

fn read_applied_id(dir: &Path) -> Result<u64> {
    match fs::read_to_string(dir.join(APPLIED_ID_FILE_NAME)) {
        Ok(text) => text.trim().parse().map_err(|e| {
            Error::Deserialization(format!("{}: applied id {text:?}: {e}", dir.display()))
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Write `data` to `tmp`, fsync it and rename it over `dst`.
fn atomic_write(dir: &Path, tmp: &str, dst: &str, data: &[u8]) -> Result<()> {
    let tmp_path = dir.join(tmp);
    let mut file = File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp_path, dir.join(dst))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

impl DataPartition {
    /// Create a new partition directory and persist its metadata.
    pub fn create(
        mut config: DataPartitionConfig,
        raft: Arc<dyn RaftPartition>,
        peers: Arc<dyn PeerClient>,
    ) -> Result<Arc<Self>> {
        if config.store.data_path.join(META_FILE_NAME).exists() {
            return Err(Error::Configuration(format!(
                "partition {} already exists at {}",
                config.partition_id,
                config.store.data_path.display()
            )));
        }
        config.store.is_create = true;
        let store = ExtentStore::open(config.store.clone())?;
        let dp = Self::new(config, store, raft, peers, 0, None);
        dp.persist_metadata()?;
        info!(partition_id = dp.partition_id(), path = %dp.path.display(), "data partition created");
        Ok(Arc::new(dp))
    }

    /// Reopen an existing partition directory.
    ///
    /// Normal extent sizes are filled in by [`DataPartition::load`]; until
    /// then normal reads report `PartitionLoading`.
    pub fn open(
        mut config: DataPartitionConfig,
        raft: Arc<dyn RaftPartition>,
        peers: Arc<dyn PeerClient>,
    ) -> Result<Arc<Self>> {
        let dir = config.store.data_path.clone();
        let meta = load_metadata(&dir)?;
        if meta.partition_id != config.partition_id {
            return Err(Error::Configuration(format!(
                "{} holds partition {}, expected {}",
                dir.display(),
                meta.partition_id,
                config.partition_id
            )));
        }
        let applied = read_applied_id(&dir)?;
        config.store.is_create = false;
        let store = ExtentStore::open(config.store.clone())?;
        let punched = store.playback_tiny_delete()?;
        let dp = Self::new(config, store, raft, peers, applied, Some(meta));
        info!(
            partition_id = dp.partition_id(),
            applied_id = applied,
            tiny_punched = punched,
            "data partition opened"
        );
        Ok(Arc::new(dp))
    }

    fn new(
        mut config: DataPartitionConfig,
        store: ExtentStore,
        raft: Arc<dyn RaftPartition>,
        peers: Arc<dyn PeerClient>,
        applied: u64,
        meta: Option<PartitionMetadata>,
    ) -> Self {
        config.peers.sort();
        let (store_msg_tx, store_msg_rx) = mpsc::unbounded_channel();
        let (create_time, last_truncate_id, is_catch_up) = meta
            .as_ref()
            .map_or((unix_timestamp(), 0, false), |m| {
                (m.create_time, m.last_truncate_id, m.is_catch_up)
            });
        Self {
            path: config.store.data_path.clone(),
            config,
            store,
            raft,
            peers,
            issues: IssueProcessor::new(),
            stats: PartitionStats::default(),
            apply_id: AtomicU64::new(applied),
            persisted_apply_id: AtomicU64::new(applied),
            last_truncate_id: AtomicU64::new(last_truncate_id),
            persist_lock: Semaphore::new(1),
            persisted_meta: Mutex::new(meta),
            create_time,
            is_catch_up: AtomicBool::new(is_catch_up),
            store_tick_running: AtomicBool::new(false),
            store_msg_tx,
            store_msg_rx: Mutex::new(Some(store_msg_rx)),
            extent_reset: Notify::new(),
        }
    }

    pub const fn partition_id(&self) -> u64 {
        self.config.partition_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn peers(&self) -> &[String] {
        &self.config.peers
    }

    pub const fn store(&self) -> &ExtentStore {
        &self.store
    }

    pub const fn stats(&self) -> &PartitionStats {
        &self.stats
    }

    pub const fn issues(&self) -> &IssueProcessor {
        &self.issues
    }

    pub fn raft(&self) -> &Arc<dyn RaftPartition> {
        &self.raft
    }

    pub fn applied_id(&self) -> u64 {
        self.apply_id.load(Ordering::Acquire)
    }

    pub fn persisted_applied_id(&self) -> u64 {
        self.persisted_apply_id.load(Ordering::Acquire)
    }

    pub fn is_store_tick_running(&self) -> bool {
        self.store_tick_running.load(Ordering::Acquire)
    }

    pub fn set_catch_up(&self, caught_up: bool) {
        self.is_catch_up.store(caught_up, Ordering::Release);
    }

    /// Fill in normal extent sizes. Runs once after open.
    pub fn load(&self) -> Result<()> {
        self.store.load()
    }

    /// Resolves after a snapshot has replaced the extent info.
    pub async fn wait_extent_reset(&self) {
        self.extent_reset.notified().await;
    }

    /// Propose a random write and wait for the apply result.
    pub async fn submit(&self, cmd: RandomWriteCommand) -> Result<ResultCode> {
        if !cmd.opcode.is_random_write() {
            return Err(Error::param_mismatch(format!(
                "opcode {:?} is not a random write",
                cmd.opcode
            )));
        }
        if cmd.size != cmd.data.len() as u64 {
            return Err(Error::param_mismatch(format!(
                "random write size {} but {} bytes of data",
                cmd.size,
                cmd.data.len()
            )));
        }
        self.store
            .check_is_avail_random_write(cmd.extent_id, cmd.offset, cmd.size)?;
        self.raft.submit(cmd.encode()).await
    }

    /// Allocate and create a normal extent, or create `extent_id` when the
    /// leader already chose it.
    pub fn create_extent(&self, extent_id: Option<u64>) -> Result<u64> {
        let extent_id = match extent_id {
            Some(id) => id,
            None => self.store.next_extent_id()?,
        };
        self.store.create(extent_id)?;
        Ok(extent_id)
    }

    pub fn mark_delete(&self, extent_id: u64, offset: u64, size: u64) -> Result<()> {
        self.store.mark_delete(extent_id, offset, size)
    }

    /// Read `size` bytes at `offset`; returns the bytes and their crc.
    pub fn read(&self, extent_id: u64, offset: u64, size: u64, is_repair_read: bool) -> Result<(Vec<u8>, u32)> {
        let len = usize::try_from(size)
            .map_err(|_| Error::range_invalid(format!("read size {size}")))?;
        let mut buf = vec![0u8; len];
        let crc = self.store.read(extent_id, offset, &mut buf, is_repair_read)?;
        Ok((buf, crc))
    }

    /// A consistent read must be served by the leader once it has applied
    /// everything committed.
    pub fn random_read_check(&self) -> Result<()> {
        if !self.raft.is_leader() {
            return Err(Error::NotLeader(self.raft.leader().unwrap_or_default()));
        }
        if self.raft.applied_index() < self.raft.committed_index() {
            return Err(Error::PartitionLoading);
        }
        Ok(())
    }

    pub fn status(&self) -> PartitionStatus {
        PartitionStatus {
            partition_id: self.partition_id(),
            volume_id: self.config.volume_id.clone(),
            partition_size: self.config.partition_size,
            peers: self.config.peers.clone(),
            leader: self.raft.leader(),
            is_leader: self.raft.is_leader(),
            applied_id: self.applied_id(),
            persisted_applied_id: self.persisted_applied_id(),
            committed_index: self.raft.committed_index(),
            extent_count: self.store.extent_count(),
            used_size: self.store.store_used_size(),
            base_extent_id: self.store.base_extent_id(),
            tiny_available: self.store.tiny_extents().available_count(),
            tiny_broken: self.store.tiny_extents().broken_count(),
            issue_fragments: self.issues.len(),
            is_loaded: self.store.is_finish_load(),
        }
    }

    /// Execute a decoded random write. A disk error is returned as `Err` so
    /// raft escalates it as a fatal event; every other failure is resolved
    /// into a result code.
    async fn apply_random_write(&self, cmd: &RandomWriteCommand) -> Result<ResultCode> {
        let pid = self.partition_id();
        let (extent_id, offset, size) = (cmd.extent_id, cmd.offset, cmd.size);
        for attempt in 0..APPLY_ATTEMPTS {
            let err = match self.store.write(
                extent_id,
                offset,
                &cmd.data,
                cmd.crc,
                WriteMode::Random,
                cmd.is_sync(),
            ) {
                Ok(()) => {
                    self.stats.overwrite_bytes.fetch_add(size, Ordering::Relaxed);
                    self.issues.remove_by_range(extent_id, offset, size);
                    return Ok(ResultCode::OpOk);
                }
                Err(e) => e,
            };

            if err.is_disk_error() {
                self.stats.disk_errors.fetch_add(1, Ordering::Relaxed);
                self.issues.add_fragment(extent_id, offset, size);
                error!(partition_id = pid, extent_id, offset, size, error = %err, "random write hit a disk error");
                return Err(err);
            }
            match err {
                Error::ExtentNotFound(_) | Error::ExtentDeleted(_) => {
                    info!(partition_id = pid, extent_id, offset, size, "random write on deleted extent skipped");
                    return Ok(ResultCode::OpOk);
                }
                Error::IllegalOverwrite { block_no, .. } => {
                    warn!(partition_id = pid, extent_id, offset, size, block_no, attempt, "illegal overwrite, repairing");
                    match self.repair_data_on_random_write(extent_id, offset, size).await {
                        Ok(()) => continue,
                        Err(repair_err) => {
                            if self.check_delete_on_all_hosts(extent_id).await {
                                info!(partition_id = pid, extent_id, "extent gone on every peer, write dropped");
                                return Ok(ResultCode::OpOk);
                            }
                            warn!(partition_id = pid, extent_id, offset, size, error = %repair_err, "random write repair failed");
                        }
                    }
                }
                other => {
                    warn!(partition_id = pid, extent_id, offset, size, attempt, error = %other, "random write failed");
                }
            }
        }
        self.stats.apply_failures.fetch_add(1, Ordering::Relaxed);
        self.issues.add_fragment(extent_id, offset, size);
        Ok(ResultCode::OpDiskErr)
    }

    /// Flush the store, the raft log and the partition files.
    ///
    /// `applied` defaults to the current applied id. Only one persist runs
    /// at a time.
    pub async fn persist(&self, applied: Option<u64>) -> Result<()> {
        let _permit = self
            .persist_lock
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        let applied = applied.unwrap_or_else(|| self.applied_id());
        self.store.flush()?;
        self.raft.flush_wal(applied).await?;
        self.persist_applied_id(applied)?;
        self.persist_metadata()?;
        self.stats.persists.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn persist_applied_id(&self, applied: u64) -> Result<()> {
        if applied <= self.persisted_applied_id() {
            return Ok(());
        }
        atomic_write(
            &self.path,
            APPLIED_ID_TMP_FILE_NAME,
            APPLIED_ID_FILE_NAME,
            applied.to_string().as_bytes(),
        )?;
        self.persisted_apply_id.fetch_max(applied, Ordering::AcqRel);
        debug!(partition_id = self.partition_id(), applied_id = applied, "applied id persisted");
        Ok(())
    }

    fn current_metadata(&self) -> PartitionMetadata {
        PartitionMetadata {
            volume_id: self.config.volume_id.clone(),
            partition_id: self.partition_id(),
            partition_size: self.config.partition_size,
            peers: self.config.peers.clone(),
            create_type: self.config.create_type,
            last_truncate_id: self.last_truncate_id.load(Ordering::Acquire),
            last_update_time: unix_timestamp(),
            is_catch_up: self.is_catch_up.load(Ordering::Acquire),
            create_time: self.create_time,
        }
    }

    /// Rewrite `META` when any field other than the update time changed.
    fn persist_metadata(&self) -> Result<()> {
        let mut persisted = self.persisted_meta.lock();
        let meta = self.current_metadata();
        if persisted.as_ref().is_some_and(|p| p.same_content(&meta)) {
            return Ok(());
        }
        let raw = serde_json::to_vec(&meta)
            .map_err(|e| Error::Serialization(format!("partition meta: {e}")))?;
        atomic_write(&self.path, META_TMP_FILE_NAME, META_FILE_NAME, &raw)?;
        *persisted = Some(meta);
        Ok(())
    }

    /// Drop raft log entries already covered by a persisted applied id.
    pub async fn truncate_raft_log(&self) -> Result<u64> {
        let index = self.persisted_applied_id();
        if index <= self.last_truncate_id.load(Ordering::Acquire) {
            return Ok(index);
        }
        self.raft.truncate(index).await?;
        self.last_truncate_id.fetch_max(index, Ordering::AcqRel);
        self.persist_metadata()?;
        info!(partition_id = self.partition_id(), index, "raft log truncated");
        Ok(index)
    }

    /// Persist every `interval` and whenever a [`StoreMsg`] arrives.
    ///
    /// Runs until `cancel` fires; a final persist is made on the way out.
    /// Only the first call gets the message channel.
    pub async fn run_store_tick(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let rx = self.store_msg_rx.lock().take();
        let Some(mut rx) = rx else {
            warn!(partition_id = self.partition_id(), "store tick already running");
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            let applied = tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => None,
                Some(msg) = rx.recv() => match msg.op {
                    StoreOp::StoreTick => Some(msg.applied_id),
                },
            };
            if let Err(e) = self.persist(applied).await {
                error!(partition_id = self.partition_id(), error = %e, "partition persist failed");
            }
        }
        if let Err(e) = self.persist(None).await {
            error!(partition_id = self.partition_id(), error = %e, "final partition persist failed");
        }
    }

    /// Persist and close the store.
    pub async fn stop(&self) -> Result<()> {
        self.persist(None).await?;
        self.store.close()
    }
}

/// Address a leader connects to for checking its own HTTP listener
fn self_connect_addr(local_addr: &str, http_port: u16) -> String {
    format!("{}:{http_port}", host_ip(local_addr))
}

#[async_trait]
impl StateMachine for DataPartition {
    async fn apply(&self, command: Bytes, index: u64) -> Result<ResultCode> {
        let code = match RandomWriteCommand::decode(&command) {
            Ok(cmd) if cmd.opcode.is_random_write() => self.apply_random_write(&cmd).await?,
            Ok(cmd) => {
                warn!(partition_id = self.partition_id(), index, opcode = ?cmd.opcode, "unexpected opcode in raft log");
                ResultCode::OpArgMismatchErr
            }
            Err(e) => {
                warn!(partition_id = self.partition_id(), index, error = %e, "undecodable raft entry");
                ResultCode::OpArgMismatchErr
            }
        };
        self.apply_id.fetch_max(index, Ordering::AcqRel);
        self.stats.applied_entries.fetch_add(1, Ordering::Relaxed);
        Ok(code)
    }

    fn snapshot(&self) -> Result<Vec<SnapshotRecord>> {
        let applied = self.applied_id();
        let mut records: Vec<SnapshotRecord> = self
            .store
            .get_all_watermarks(ExtentKind::All, None)?
            .into_iter()
            .map(SnapshotRecord::ExtentInfo)
            .collect();
        records.push(SnapshotRecord::ApplyId(applied));
        Ok(records)
    }

    async fn apply_snapshot(&self, mut records: mpsc::Receiver<SnapshotRecord>) -> Result<()> {
        let mut infos = Vec::new();
        let mut applied = 0;
        while let Some(record) = records.recv().await {
            match record {
                SnapshotRecord::ExtentInfo(info) => infos.push(info),
                SnapshotRecord::ApplyId(id) => applied = applied.max(id),
            }
        }
        for info in infos.iter().filter(|i| is_normal_extent(i.file_id)) {
            self.store.update_base_extent_id(info.file_id)?;
        }
        let extents = infos.len();
        self.store.reset_info(infos);
        self.apply_id.fetch_max(applied, Ordering::AcqRel);
        // the receiver lives as long as the partition
        let _ = self.store_msg_tx.send(StoreMsg {
            op: StoreOp::StoreTick,
            applied_id: applied,
        });
        self.extent_reset.notify_one();
        info!(partition_id = self.partition_id(), extents, applied_id = applied, "snapshot applied");
        Ok(())
    }

    async fn handle_leader_change(&self, leader: &str) {
        if leader != self.config.local_addr {
            if self.store_tick_running.swap(false, Ordering::AcqRel) {
                info!(partition_id = self.partition_id(), leader, "leadership lost");
            }
            return;
        }
        self.store_tick_running.store(true, Ordering::Release);
        info!(partition_id = self.partition_id(), "became leader");

        let addr = self_connect_addr(&self.config.local_addr, self.config.peer.http_port);
        let timeout = self.config.peer.connect_timeout();
        let raft = Arc::clone(&self.raft);
        let partition_id = self.partition_id();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => debug!(partition_id, %addr, "leader listener reachable"),
                Ok(Err(e)) => {
                    warn!(partition_id, %addr, error = %e, "leader listener unreachable, campaigning again");
                    if let Err(e) = raft.try_to_leader().await {
                        warn!(partition_id, error = %e, "leader campaign failed");
                    }
                }
                Err(_) => {
                    warn!(partition_id, %addr, "leader listener connect timed out, campaigning again");
                    if let Err(e) = raft.try_to_leader().await {
                        warn!(partition_id, error = %e, "leader campaign failed");
                    }
                }
            }
        });
    }

    fn handle_fatal_event(&self, err: &Error) -> ! {
        error!(partition_id = self.partition_id(), error = %err, "raft fatal event");
        panic!("data partition {} raft fatal event: {err}", self.partition_id())
    }
}
