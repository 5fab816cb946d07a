//! Slot-array FIFO queue with head-change notifications.
//!
//! The store's primary queue and every composite action's private queue are
//! instances of [`BoundedFifoQueue`]. Items are never shifted on dequeue:
//! the slot at `head` is emptied and `head` advances. Once the consumed
//! prefix grows past a quarter of a storage vector longer than 50 slots it is
//! drained in one go, so storage stays within roughly 1.33x the live count
//! while enqueue/dequeue remain amortized O(1).
//!
//! # Head notifications
//!
//! [`BoundedFifoQueue::head_changes`] hands out a receiver that yields a
//! clone of the new head exactly when the head transitions:
//!
//! - enqueue into an empty queue
//! - dequeue that exposes a new head
//!
//! Enqueues behind an existing head and dequeues that empty the queue are
//! silent.

use tokio::sync::mpsc;

/// Storage length that must be exceeded before compaction is considered.
pub(crate) const COMPACTION_MIN_LEN: usize = 50;

/// Consumed-prefix ratio that must be exceeded before compaction.
pub(crate) const COMPACTION_RATIO: f64 = 0.25;

/// Whether a slot vector of `len` slots whose first `head` slots are consumed
/// should drop its prefix.
pub(crate) fn should_compact(head: usize, len: usize) -> bool {
    len > COMPACTION_MIN_LEN && head as f64 / len as f64 > COMPACTION_RATIO
}

/// FIFO queue backed by an append-only slot vector and a head index.
pub struct BoundedFifoQueue<T> {
    slots: Vec<Option<T>>,
    head: usize,
    head_tx: Option<mpsc::UnboundedSender<T>>,
}

impl<T: Clone> BoundedFifoQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: 0,
            head_tx: None,
        }
    }

    /// Subscribe to head transitions.
    ///
    /// Only one subscriber is kept; subscribing again replaces the previous
    /// receiver. The current head (if any) is not replayed.
    pub fn head_changes(&mut self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.head_tx = Some(tx);
        rx
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.slots.len() - self.head
    }

    /// Returns true if there are no live items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an item at the tail.
    pub fn enqueue(&mut self, item: T) {
        self.slots.push(Some(item));
        if self.len() == 1 {
            if let Some(head) = self.peek().cloned() {
                self.notify(head);
            }
        }
    }

    /// Remove and return the head.
    ///
    /// Returns `None` without compacting or notifying when the queue is empty.
    pub fn dequeue(&mut self) -> Option<T> {
        let item = self.slots.get_mut(self.head)?.take()?;
        self.head += 1;

        if should_compact(self.head, self.slots.len()) {
            self.slots.drain(..self.head);
            self.head = 0;
        }

        if let Some(next) = self.peek().cloned() {
            self.notify(next);
        }

        Some(item)
    }

    /// The current head without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.slots.get(self.head).and_then(Option::as_ref)
    }

    /// Physical length of the slot vector, consumed slots included.
    pub fn storage_len(&self) -> usize {
        self.slots.len()
    }

    /// Index of the head slot inside the slot vector.
    pub fn head_index(&self) -> usize {
        self.head
    }

    fn notify(&mut self, head: T) {
        if let Some(tx) = &self.head_tx {
            if tx.send(head).is_err() {
                self.head_tx = None;
            }
        }
    }
}

impl<T: Clone> Default for BoundedFifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BoundedFifoQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedFifoQueue")
            .field("len", &(self.slots.len() - self.head))
            .field("head", &self.head)
            .field("storage_len", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = BoundedFifoQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);

        assert_eq!(queue.peek(), Some(&1));
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_trim_internal_storage() {
        let mut queue = BoundedFifoQueue::new();
        for i in 0..1000 {
            queue.enqueue(i);
        }
        assert_eq!(queue.storage_len(), 1000);
        assert_eq!(queue.head_index(), 0);

        for _ in 0..250 {
            queue.dequeue();
        }
        // 250 / 1000 is not above the ratio yet
        assert_eq!(queue.storage_len(), 1000);
        assert_eq!(queue.head_index(), 250);

        assert_eq!(queue.dequeue(), Some(250));
        assert_eq!(queue.storage_len(), 749);
        assert_eq!(queue.head_index(), 0);
        assert_eq!(queue.peek(), Some(&251));
        assert_eq!(queue.len(), 749);
    }

    #[test]
    fn test_small_queue_never_compacts() {
        let mut queue = BoundedFifoQueue::new();
        for i in 0..50 {
            queue.enqueue(i);
        }
        for _ in 0..49 {
            queue.dequeue();
        }
        assert_eq!(queue.storage_len(), 50);
        assert_eq!(queue.head_index(), 49);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dequeue_empty_is_silent() {
        let mut queue: BoundedFifoQueue<u32> = BoundedFifoQueue::new();
        let mut heads = queue.head_changes();

        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.storage_len(), 0);
        assert!(heads.try_recv().is_err());
    }

    #[test]
    fn test_head_notification_on_first_enqueue_only() {
        let mut queue = BoundedFifoQueue::new();
        let mut heads = queue.head_changes();

        queue.enqueue("a");
        assert_eq!(heads.try_recv().ok(), Some("a"));

        queue.enqueue("b");
        queue.enqueue("c");
        assert!(heads.try_recv().is_err(), "no notification while head unchanged");

        queue.dequeue();
        assert_eq!(heads.try_recv().ok(), Some("b"));
        assert!(heads.try_recv().is_err());
    }

    #[test]
    fn test_dequeue_last_item_does_not_notify() {
        let mut queue = BoundedFifoQueue::new();
        let mut heads = queue.head_changes();

        queue.enqueue(7);
        assert_eq!(heads.try_recv().ok(), Some(7));

        assert_eq!(queue.dequeue(), Some(7));
        assert!(heads.try_recv().is_err());

        // Queue is empty again, so the next enqueue is a new head
        queue.enqueue(8);
        assert_eq!(heads.try_recv().ok(), Some(8));
    }

    #[test]
    fn test_notification_after_compaction_carries_new_head() {
        let mut queue = BoundedFifoQueue::new();
        for i in 0..100 {
            queue.enqueue(i);
        }
        let mut heads = queue.head_changes();

        for _ in 0..26 {
            queue.dequeue();
        }
        assert_eq!(queue.head_index(), 0, "26/100 should have compacted");

        let mut last = None;
        while let Ok(head) = heads.try_recv() {
            last = Some(head);
        }
        assert_eq!(last, Some(26));
        assert_eq!(queue.peek(), Some(&26));
    }

    #[test]
    fn test_dropped_receiver_is_tolerated() {
        let mut queue = BoundedFifoQueue::new();
        drop(queue.head_changes());

        queue.enqueue(1);
        queue.enqueue(2);
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_debug_impl() {
        let mut queue = BoundedFifoQueue::new();
        queue.enqueue(1);
        let debug = format!("{:?}", queue);
        assert!(debug.contains("BoundedFifoQueue"));
        assert!(debug.contains("len"));
    }
}
