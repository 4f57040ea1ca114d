//! Bounded drop-oldest queue.
//!
//! `put` never blocks: when the queue is full the oldest queued item is evicted
//! to admit the newest. A capacity of 1 gives overwrite-latest mailbox
//! semantics, which is how frames are handed from producer to consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::error::QueueError;

/// Cloneable handle to a bounded drop-oldest queue.
///
/// Both ends live in every handle so a producer can evict from the head. Safe
/// for one producer and one consumer (or a few producers) without extra locking.
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl<T> Clone for DropOldestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
            evicted: self.evicted.clone(),
        }
    }
}

impl<T> DropOldestQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Insert `item`, evicting the oldest queued item if full.
    ///
    /// Returns the evicted item, if any.
    pub fn put(&self, item: T) -> Option<T> {
        let mut pending = item;
        let mut evicted = None;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    pending = back;
                    // The consumer may drain the head first; then the retry succeeds.
                    if let Ok(old) = self.rx.try_recv() {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        evicted = Some(old);
                    }
                }
                // Unreachable while this handle holds a receiver.
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Wait up to `timeout` for the oldest queued item.
    pub fn get(&self, timeout: Duration) -> Result<T, QueueError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => QueueError::Timeout,
            RecvTimeoutError::Disconnected => QueueError::Disconnected,
        })
    }

    /// Take the oldest queued item without waiting.
    pub fn try_get(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Remove and return everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items evicted by overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn keeps_most_recent_items_in_arrival_order() {
        let q = DropOldestQueue::new(3);
        for i in 0..10 {
            q.put(i);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.evicted(), 7);
        assert_eq!(q.drain(), vec![7, 8, 9]);
    }

    #[test]
    fn never_returns_evicted_items() {
        let q = DropOldestQueue::new(4);
        let puts = 25;
        for i in 0..puts {
            q.put(i);
        }
        let mut seen = Vec::new();
        while let Ok(item) = q.get(SHORT) {
            seen.push(item);
        }
        assert!(seen.iter().all(|&i| i >= puts - 4));
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn put_reports_the_evicted_item() {
        let q = DropOldestQueue::new(2);
        assert_eq!(q.put("a"), None);
        assert_eq!(q.put("b"), None);
        assert_eq!(q.put("c"), Some("a"));
    }

    #[test]
    fn mailbox_returns_only_the_latest() {
        let q = DropOldestQueue::new(1);
        q.put('a');
        q.put('b');
        q.put('c');
        assert_eq!(q.get(SHORT), Ok('c'));
        assert_eq!(q.get(SHORT), Err(QueueError::Timeout));
    }

    #[test]
    fn mailbox_get_blocks_until_next_put() {
        let q = DropOldestQueue::new(1);
        q.put(1u32);
        assert_eq!(q.get(SHORT), Ok(1));

        let producer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.put(2);
        });
        let start = Instant::now();
        assert_eq!(q.get(Duration::from_secs(2)), Ok(2));
        assert!(start.elapsed() >= Duration::from_millis(40));
        handle.join().unwrap();
    }

    #[test]
    fn get_times_out_on_empty_queue() {
        let q: DropOldestQueue<u8> = DropOldestQueue::new(2);
        let start = Instant::now();
        assert_eq!(q.get(Duration::from_millis(30)), Err(QueueError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn concurrent_producer_never_blocks() {
        let q = DropOldestQueue::new(1);
        let producer = q.clone();
        let handle = thread::spawn(move || {
            for i in 0..10_000u32 {
                producer.put(i);
            }
        });
        let mut last = None;
        while let Ok(v) = q.get(Duration::from_millis(200)) {
            if let Some(prev) = last {
                assert!(v > prev, "items must arrive in order");
            }
            last = Some(v);
        }
        handle.join().unwrap();
        assert_eq!(last, Some(9_999));
        assert!(q.len() <= q.capacity());
    }
}
