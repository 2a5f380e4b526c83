//! Issue processor
//!
//! Byte ranges whose apply failed and still need repair, per extent. A later
//! successful apply over a range clears whatever part of it was recorded.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Fragment {
    pub extent_id: u64,
    pub offset: u64,
    pub size: u64,
}

impl Fragment {
    const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Default)]
pub struct IssueProcessor {
    fragments: Mutex<BTreeMap<u64, Vec<Fragment>>>,
}

impl IssueProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `[offset, offset + size)` of `extent_id`, merging with
    /// overlapping or adjacent ranges.
    pub fn add_fragment(&self, extent_id: u64, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut fragments = self.fragments.lock();
        let list = fragments.entry(extent_id).or_default();
        let mut merged = Fragment {
            extent_id,
            offset,
            size,
        };
        list.retain(|f| {
            if f.offset > merged.end() || f.end() < merged.offset {
                return true;
            }
            let start = f.offset.min(merged.offset);
            let end = f.end().max(merged.end());
            merged.offset = start;
            merged.size = end - start;
            false
        });
        list.push(merged);
        list.sort_by_key(|f| f.offset);
    }

    /// Clear `[offset, offset + size)` of `extent_id`. Returns true if any
    /// recorded bytes were removed.
    pub fn remove_by_range(&self, extent_id: u64, offset: u64, size: u64) -> bool {
        let end = offset + size;
        let mut fragments = self.fragments.lock();
        let Some(list) = fragments.get_mut(&extent_id) else {
            return false;
        };
        let mut changed = false;
        let mut kept = Vec::with_capacity(list.len());
        for f in list.drain(..) {
            if f.end() <= offset || f.offset >= end {
                kept.push(f);
                continue;
            }
            changed = true;
            if f.offset < offset {
                kept.push(Fragment {
                    extent_id,
                    offset: f.offset,
                    size: offset - f.offset,
                });
            }
            if f.end() > end {
                kept.push(Fragment {
                    extent_id,
                    offset: end,
                    size: f.end() - end,
                });
            }
        }
        if kept.is_empty() {
            fragments.remove(&extent_id);
        } else {
            *list = kept;
        }
        changed
    }

    /// Outstanding fragments ordered by extent and offset
    pub fn fragments(&self) -> Vec<Fragment> {
        self.fragments
            .lock()
            .values()
            .flat_map(|l| l.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fragments.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.lock().is_empty()
    }
}
