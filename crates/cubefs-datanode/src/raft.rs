//! Raft seams
//!
//! The data partition talks to its replica group through [`RaftPartition`]
//! and is driven by it through [`StateMachine`]. The consensus engine itself
//! lives outside this crate; [`LocalRaft`] is the in-process log used by a
//! single-replica deployment and by tests.

use crate::partition::SnapshotRecord;
use async_trait::async_trait;
use bytes::Bytes;
use cubefs_common::{Error, Result, ResultCode};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, Weak};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

/// The replica group a data partition proposes to
#[async_trait]
pub trait RaftPartition: Send + Sync {
    /// Propose `command` and wait for the local apply result
    async fn submit(&self, command: Bytes) -> Result<ResultCode>;

    /// Current leader address, if known
    fn leader(&self) -> Option<String>;

    fn is_leader(&self) -> bool;

    /// fsync the log up to `applied`
    async fn flush_wal(&self, applied: u64) -> Result<()>;

    /// Drop log entries at or below `index`
    async fn truncate(&self, index: u64) -> Result<()>;

    /// Campaign for leadership
    async fn try_to_leader(&self) -> Result<()>;

    fn committed_index(&self) -> u64;

    fn applied_index(&self) -> u64;
}

/// Callbacks raft delivers to a partition
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Execute one committed entry. An `Err` is fatal: raft hands it to
    /// [`StateMachine::handle_fatal_event`].
    async fn apply(&self, command: Bytes, index: u64) -> Result<ResultCode>;

    /// Records describing the partition state up to the applied index
    fn snapshot(&self) -> Result<Vec<SnapshotRecord>>;

    /// Rebuild from a snapshot stream; the stream ends when the sender drops
    async fn apply_snapshot(&self, records: mpsc::Receiver<SnapshotRecord>) -> Result<()>;

    async fn handle_leader_change(&self, leader: &str);

    /// Raft invariants are broken; the process must not continue.
    fn handle_fatal_event(&self, err: &Error) -> !;
}

struct LogState {
    entries: Vec<(u64, Bytes)>,
    last_index: u64,
}

/// Single-node raft log kept in memory
pub struct LocalRaft {
    local_addr: String,
    leader: RwLock<Option<String>>,
    log: Mutex<LogState>,
    committed: AtomicU64,
    applied: AtomicU64,
    wal_flushed: AtomicU64,
    truncated: AtomicU64,
    state_machine: OnceLock<Weak<dyn StateMachine>>,
}

impl LocalRaft {
    pub fn new(local_addr: impl Into<String>, leader: Option<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            leader: RwLock::new(leader),
            log: Mutex::new(LogState {
                entries: Vec::new(),
                last_index: 0,
            }),
            committed: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            wal_flushed: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
            state_machine: OnceLock::new(),
        }
    }

    /// Attach the state machine entries are applied to. Only the first call
    /// has an effect.
    pub fn bind(&self, state_machine: Weak<dyn StateMachine>) {
        let _ = self.state_machine.set(state_machine);
    }

    /// Continue numbering after `index`, e.g. the applied id a partition
    /// recovered from disk.
    pub async fn start_at(&self, index: u64) {
        let mut log = self.log.lock().await;
        log.last_index = log.last_index.max(index);
        self.committed.fetch_max(index, Ordering::AcqRel);
        self.applied.fetch_max(index, Ordering::AcqRel);
    }

    /// Entries with an index greater than `index`, in log order
    pub async fn entries_after(&self, index: u64) -> Vec<(u64, Bytes)> {
        self.log
            .lock()
            .await
            .entries
            .iter()
            .filter(|(i, _)| *i > index)
            .cloned()
            .collect()
    }

    /// Change the leader and tell the state machine
    pub async fn set_leader(&self, leader: impl Into<String>) {
        let leader = leader.into();
        *self.leader.write() = Some(leader.clone());
        if let Some(sm) = self.state_machine.get().and_then(Weak::upgrade) {
            sm.handle_leader_change(&leader).await;
        }
    }

    pub fn wal_flushed_index(&self) -> u64 {
        self.wal_flushed.load(Ordering::Acquire)
    }

    pub fn truncated_index(&self) -> u64 {
        self.truncated.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RaftPartition for LocalRaft {
    async fn submit(&self, command: Bytes) -> Result<ResultCode> {
        if !self.is_leader() {
            return Err(Error::NotLeader(self.leader().unwrap_or_default()));
        }
        let sm = self
            .state_machine
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::internal("raft has no state machine"))?;

        // holding the log lock across apply keeps apply in log order
        let mut log = self.log.lock().await;
        let index = log.last_index + 1;
        log.last_index = index;
        log.entries.push((index, command.clone()));
        self.committed.store(index, Ordering::Release);

        let code = match sm.apply(command, index).await {
            Ok(code) => code,
            Err(e) => sm.handle_fatal_event(&e),
        };
        self.applied.store(index, Ordering::Release);
        debug!(index, ?code, "raft entry applied");
        Ok(code)
    }

    fn leader(&self) -> Option<String> {
        self.leader.read().clone()
    }

    fn is_leader(&self) -> bool {
        self.leader.read().as_deref() == Some(self.local_addr.as_str())
    }

    async fn flush_wal(&self, applied: u64) -> Result<()> {
        self.wal_flushed.fetch_max(applied, Ordering::AcqRel);
        Ok(())
    }

    async fn truncate(&self, index: u64) -> Result<()> {
        self.log.lock().await.entries.retain(|(i, _)| *i > index);
        self.truncated.fetch_max(index, Ordering::AcqRel);
        Ok(())
    }

    async fn try_to_leader(&self) -> Result<()> {
        if self.is_leader() {
            return Ok(());
        }
        info!(addr = %self.local_addr, "campaigning for leadership");
        self.set_leader(self.local_addr.clone()).await;
        Ok(())
    }

    fn committed_index(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        applied: parking_lot::Mutex<Vec<(u64, Bytes)>>,
        leaders: parking_lot::Mutex<Vec<String>>,
        disk_broken: bool,
    }

    #[async_trait]
    impl StateMachine for Recorder {
        async fn apply(&self, command: Bytes, index: u64) -> Result<ResultCode> {
            if self.disk_broken {
                return Err(Error::Io(std::io::Error::other("input/output error")));
            }
            self.applied.lock().push((index, command));
            Ok(ResultCode::OpOk)
        }

        fn snapshot(&self) -> Result<Vec<SnapshotRecord>> {
            Ok(Vec::new())
        }

        async fn apply_snapshot(&self, _records: mpsc::Receiver<SnapshotRecord>) -> Result<()> {
            Ok(())
        }

        async fn handle_leader_change(&self, leader: &str) {
            self.leaders.lock().push(leader.to_string());
        }

        fn handle_fatal_event(&self, err: &Error) -> ! {
            panic!("fatal raft event: {err}")
        }
    }

    #[tokio::test]
    async fn test_submit_applies_in_order() {
        let raft = LocalRaft::new("a:1", Some("a:1".to_string()));
        let sm = Arc::new(Recorder::default());
        let weak: Weak<dyn StateMachine> = Arc::downgrade(&sm) as Weak<dyn StateMachine>;
        raft.bind(weak);
        raft.start_at(10).await;

        for n in 0..3u8 {
            let code = raft.submit(Bytes::from(vec![n])).await.unwrap();
            assert!(code.is_ok());
        }
        let applied = sm.applied.lock().clone();
        assert_eq!(
            applied.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![11, 12, 13]
        );
        assert_eq!(raft.applied_index(), 13);
        assert_eq!(raft.entries_after(12).await.len(), 1);

        raft.truncate(12).await.unwrap();
        assert_eq!(raft.entries_after(0).await.len(), 1);
    }

    #[tokio::test]
    async fn test_follower_rejects_submit() {
        let raft = LocalRaft::new("b:1", Some("a:1".to_string()));
        let sm = Arc::new(Recorder::default());
        let weak: Weak<dyn StateMachine> = Arc::downgrade(&sm) as Weak<dyn StateMachine>;
        raft.bind(weak);
        assert!(matches!(
            raft.submit(Bytes::new()).await,
            Err(Error::NotLeader(leader)) if leader == "a:1"
        ));

        raft.try_to_leader().await.unwrap();
        assert!(raft.is_leader());
        assert_eq!(*sm.leaders.lock(), vec!["b:1".to_string()]);
        // already leader: no second notification
        raft.try_to_leader().await.unwrap();
        assert_eq!(sm.leaders.lock().len(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "fatal raft event")]
    async fn test_apply_error_is_fatal() {
        let raft = LocalRaft::new("a:1", Some("a:1".to_string()));
        let sm = Arc::new(Recorder {
            disk_broken: true,
            ..Recorder::default()
        });
        let weak: Weak<dyn StateMachine> = Arc::downgrade(&sm) as Weak<dyn StateMachine>;
        raft.bind(weak);
        let _ = raft.submit(Bytes::from_static(b"entry")).await;
    }
}
