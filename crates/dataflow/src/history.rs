//! Append-only log that keeps the newest `capacity` entries.
//!
//! Uses the same slot-vector layout as [`crate::queue::BoundedFifoQueue`]:
//! eviction empties the oldest slot and advances `head`, and the consumed
//! prefix is drained once it passes the shared compaction threshold.

use crate::queue::should_compact;

/// Default number of retained state snapshots.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Bounded log, oldest first.
#[derive(Debug, Clone)]
pub struct BoundedHistoryLog<T> {
    capacity: usize,
    slots: Vec<Option<T>>,
    head: usize,
}

impl<T> BoundedHistoryLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::new(),
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.len().saturating_sub(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an entry, evicting the oldest one if the log is over capacity.
    pub fn push(&mut self, item: T) {
        self.slots.push(Some(item));
        if self.len() > self.capacity {
            self.evict_oldest();
        }
    }

    /// Remove and return the newest entry.
    ///
    /// Slots emptied by eviction are popped as `None`; `head` is clamped to
    /// the new storage length.
    pub fn pop(&mut self) -> Option<T> {
        let item = self.slots.pop().flatten();
        if self.head > self.slots.len() {
            self.head = self.slots.len();
        }
        item
    }

    /// The newest entry.
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        self.slots.last().and_then(Option::as_ref)
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots[self.head.min(self.slots.len())..]
            .iter()
            .filter_map(Option::as_ref)
    }

    pub fn storage_len(&self) -> usize {
        self.slots.len()
    }

    pub fn head_index(&self) -> usize {
        self.head
    }

    fn evict_oldest(&mut self) {
        match self.slots.get_mut(self.head) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                self.head += 1;
            }
            _ => return,
        }

        if should_compact(self.head, self.slots.len()) {
            self.slots.drain(..self.head);
            self.head = 0;
        }
    }
}

impl<T: Clone> BoundedHistoryLog<T> {
    /// Snapshot of the live entries, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T> Default for BoundedHistoryLog<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
