//! Pending work queue.
//!
//! Terminals offer their finished reads here and the dispatcher takes them
//! one at a time. The queue keeps at most one entry per terminal: offering a
//! new entry drops the stale one of the same terminal before appending.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Entry that belongs to one terminal.
pub trait Keyed {
    /// Name of the terminal the entry belongs to.
    fn key(&self) -> &str;
}

/// Deduplicating FIFO queue.
pub struct PendingQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> fmt::Debug for PendingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQueue")
            .field("len", &self.items.lock().len())
            .finish()
    }
}

impl<T: Keyed> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Keyed> PendingQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    /// Append `item`, replacing any entry with the same key.
    ///
    /// Returns `true` if a stale entry was dropped.
    pub fn offer(&self, item: T) -> bool {
        let replaced = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|queued| queued.key() != item.key());
            let replaced = items.len() != before;
            if replaced {
                debug!(terminal = %item.key(), "Dropped stale queue entry");
            }
            items.push_back(item);
            replaced
        };
        self.available.notify_one();
        replaced
    }

    /// Take the oldest entry, waiting for one if the queue is empty.
    ///
    /// Cancel safe: dropping the future never loses an entry.
    pub async fn take(&self) -> T {
        loop {
            if let Some(item) = self.try_take() {
                return item;
            }
            self.available.notified().await;
        }
    }

    /// Take the oldest entry if there is one.
    pub fn try_take(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Keys of the queued entries, oldest first.
    pub fn keys(&self) -> Vec<String> {
        self.items
            .lock()
            .iter()
            .map(|item| item.key().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Entry(&'static str, u32);

    impl Keyed for Entry {
        fn key(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = PendingQueue::new();
        queue.offer(Entry("T1", 1));
        queue.offer(Entry("T2", 1));

        assert_eq!(queue.try_take(), Some(Entry("T1", 1)));
        assert_eq!(queue.try_take(), Some(Entry("T2", 1)));
        assert_eq!(queue.try_take(), None);
    }

    #[test]
    fn test_offer_replaces_same_key() {
        let queue = PendingQueue::new();
        assert!(!queue.offer(Entry("T1", 1)));
        assert!(!queue.offer(Entry("T2", 1)));
        assert!(queue.offer(Entry("T1", 2)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.keys(), vec!["T2", "T1"]);
        assert_eq!(queue.try_take(), Some(Entry("T2", 1)));
        assert_eq!(queue.try_take(), Some(Entry("T1", 2)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_at_most_one_entry_per_key() {
        let queue = PendingQueue::new();
        for round in 0..10 {
            queue.offer(Entry("T1", round));
            queue.offer(Entry("T2", round));
            queue.offer(Entry("T3", round));
        }

        let mut keys = queue.keys();
        keys.sort();
        assert_eq!(keys, vec!["T1", "T2", "T3"]);
    }

    #[tokio::test]
    async fn test_take_waits_for_offer() {
        let queue = Arc::new(PendingQueue::new());
        let taker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!taker.is_finished());

        queue.offer(Entry("T1", 7));
        assert_eq!(taker.await.unwrap(), Entry("T1", 7));
    }

    #[tokio::test]
    async fn test_dropped_take_keeps_entry() {
        let queue = PendingQueue::new();
        let timed_out = tokio::time::timeout(Duration::from_millis(10), queue.take()).await;
        assert!(timed_out.is_err());

        queue.offer(Entry("T1", 1));
        assert_eq!(queue.take().await, Entry("T1", 1));
    }
}
