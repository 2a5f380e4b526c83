//! Tiny extent arbiter
//!
//! Two bounded FIFO queues gate which tiny extents writers may append to.
//! New and suspicious extents sit in `broken` until the repair loop confirms
//! the replica is in sync and promotes them to `available`.

use cubefs_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

struct BoundedQueue {
    order: VecDeque<u64>,
    members: HashSet<u64>,
    capacity: usize,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, extent_id: u64) -> bool {
        if self.members.contains(&extent_id) || self.order.len() >= self.capacity {
            return false;
        }
        self.members.insert(extent_id);
        self.order.push_back(extent_id);
        true
    }

    fn pop(&mut self) -> Option<u64> {
        let id = self.order.pop_front()?;
        self.members.remove(&id);
        Some(id)
    }

    fn remove(&mut self, extent_id: u64) -> bool {
        if !self.members.remove(&extent_id) {
            return false;
        }
        self.order.retain(|&id| id != extent_id);
        true
    }
}

pub struct TinyExtentArbiter {
    available: Mutex<BoundedQueue>,
    broken: Mutex<BoundedQueue>,
}

impl TinyExtentArbiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(BoundedQueue::new(capacity)),
            broken: Mutex::new(BoundedQueue::new(capacity)),
        }
    }

    /// Take an extent to append to; never blocks
    pub fn get_available(&self) -> Result<u64> {
        self.available.lock().pop().ok_or(Error::NoAvailableExtent)
    }

    /// Take an extent to repair; never blocks
    pub fn get_broken(&self) -> Result<u64> {
        self.broken.lock().pop().ok_or(Error::NoBrokenExtent)
    }

    /// Returns false if the id was already queued or the queue is full.
    pub fn send_to_available(&self, extent_id: u64) -> bool {
        self.broken.lock().remove(extent_id);
        self.available.lock().push(extent_id)
    }

    /// Returns false if the id was already queued or the queue is full.
    pub fn send_to_broken(&self, extent_id: u64) -> bool {
        self.available.lock().remove(extent_id);
        self.broken.lock().push(extent_id)
    }

    pub fn send_all_to_broken(&self, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            self.send_to_broken(id);
        }
    }

    /// Move up to `count` available extents to broken after an I/O failure.
    pub fn move_all_to_broken(&self, count: usize) -> usize {
        let mut moved = 0;
        while moved < count {
            let Some(id) = self.available.lock().pop() else {
                break;
            };
            self.broken.lock().push(id);
            moved += 1;
        }
        moved
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().order.len()
    }

    pub fn broken_count(&self) -> usize {
        self.broken.lock().order.len()
    }

    pub fn available_ids(&self) -> Vec<u64> {
        self.available.lock().order.iter().copied().collect()
    }

    pub fn broken_ids(&self) -> Vec<u64> {
        self.broken.lock().order.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_queues_error() {
        let arbiter = TinyExtentArbiter::new(4);
        assert!(matches!(arbiter.get_available(), Err(Error::NoAvailableExtent)));
        assert!(matches!(arbiter.get_broken(), Err(Error::NoBrokenExtent)));
    }

    #[test]
    fn test_fifo_and_dedup() {
        let arbiter = TinyExtentArbiter::new(4);
        assert!(arbiter.send_to_available(1));
        assert!(arbiter.send_to_available(2));
        assert!(!arbiter.send_to_available(1));
        assert_eq!(arbiter.available_count(), 2);
        assert_eq!(arbiter.get_available().unwrap(), 1);
        assert_eq!(arbiter.get_available().unwrap(), 2);
    }

    #[test]
    fn test_bounded() {
        let arbiter = TinyExtentArbiter::new(2);
        assert!(arbiter.send_to_broken(1));
        assert!(arbiter.send_to_broken(2));
        assert!(!arbiter.send_to_broken(3));
        assert_eq!(arbiter.broken_count(), 2);
    }

    #[test]
    fn test_promote_and_demote() {
        let arbiter = TinyExtentArbiter::new(8);
        arbiter.send_all_to_broken([10, 11, 12]);
        assert!(arbiter.send_to_available(11));
        assert_eq!(arbiter.broken_ids(), vec![10, 12]);
        assert_eq!(arbiter.available_ids(), vec![11]);

        arbiter.send_to_available(10);
        arbiter.send_to_available(12);
        assert_eq!(arbiter.move_all_to_broken(2), 2);
        assert_eq!(arbiter.available_ids(), vec![12]);
        assert_eq!(arbiter.broken_ids(), vec![11, 10]);
    }
}
