//! Per-source publication slots shared between the consumer stage and readers.
//!
//! - `SharedFrameBuffer`: fixed-capacity region holding the latest annotated frame.
//!   Writers never wait for the lock; a contended write is skipped.
//! - `StatusSlot`: small fixed-size text buffer, overwritten wholesale each cycle.
//!
//! Readers copy out under the lock and never hand out references into the region.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::frame::Frame;

/// Default status slot size in bytes.
pub const DEFAULT_STATUS_CAPACITY: usize = 100;

// ----------------------------------------------------------------------------
// SharedFrameBuffer
// ----------------------------------------------------------------------------

/// Result of a non-blocking write attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The lock was held by someone else; nothing was written.
    Contended,
    /// The frame does not fit the fixed capacity; nothing was written.
    TooLarge,
}

/// Contents of the buffer region. Only reachable through a lock guard.
pub struct FrameRegion {
    bytes: Box<[u8]>,
    len: usize,
    width: u32,
    height: u32,
    captured_at: f64,
    sequence: u64,
}

impl FrameRegion {
    /// Bytes of the current frame (empty before the first write).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn captured_at(&self) -> f64 {
        self.captured_at
    }

    /// Number of successful writes so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Latest-frame region for one source.
pub struct SharedFrameBuffer {
    source_id: Arc<str>,
    capacity: usize,
    region: Mutex<FrameRegion>,
}

impl SharedFrameBuffer {
    /// Allocate `capacity` bytes up front; the region never grows.
    pub fn new(source_id: Arc<str>, capacity: usize) -> Self {
        Self {
            source_id,
            capacity,
            region: Mutex::new(FrameRegion {
                bytes: vec![0u8; capacity].into_boxed_slice(),
                len: 0,
                width: 0,
                height: 0,
                captured_at: 0.0,
                sequence: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `frame` in if the lock is free right now.
    pub fn try_write(&self, frame: &Frame) -> WriteOutcome {
        let len = frame.byte_len();
        if len > self.capacity {
            return WriteOutcome::TooLarge;
        }
        let mut region = match self.region.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return WriteOutcome::Contended,
        };
        region.bytes[..len].copy_from_slice(frame.pixels());
        region.len = len;
        region.width = frame.width;
        region.height = frame.height;
        region.captured_at = frame.captured_at;
        region.sequence += 1;
        WriteOutcome::Written
    }

    /// Blocking lock for readers. Hold it only long enough to copy out.
    pub fn lock(&self) -> MutexGuard<'_, FrameRegion> {
        self.region.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy the current frame out under the lock. `None` before the first write.
    pub fn copy_out(&self) -> Option<Frame> {
        let region = self.lock();
        if region.sequence == 0 {
            return None;
        }
        Frame::new(
            self.source_id.clone(),
            region.width,
            region.height,
            region.bytes().to_vec(),
            region.captured_at,
        )
        .ok()
    }

    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }
}

// ----------------------------------------------------------------------------
// StatusSlot
// ----------------------------------------------------------------------------

/// Fixed-size status text ("cam1 can see [person]").
pub struct StatusSlot {
    capacity: usize,
    text: Mutex<String>,
}

impl StatusSlot {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            text: Mutex::new(String::with_capacity(capacity)),
        }
    }

    /// Overwrite the slot, truncating at a char boundary to fit.
    pub fn write(&self, status: &str) {
        let mut end = status.len().min(self.capacity);
        while !status.is_char_boundary(end) {
            end -= 1;
        }
        let mut text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        text.clear();
        text.push_str(&status[..end]);
    }

    pub fn read(&self) -> String {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for StatusSlot {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn frame(width: u32, height: u32, fill: u8, ts: f64) -> Frame {
        let len = crate::frame::byte_len(width, height).unwrap();
        Frame::new(Arc::from("cam"), width, height, vec![fill; len], ts).unwrap()
    }

    #[test]
    fn write_then_copy_out() {
        let buf = SharedFrameBuffer::new(Arc::from("cam"), 4 * 4 * 3);
        assert!(buf.copy_out().is_none());
        assert_eq!(buf.try_write(&frame(4, 4, 9, 2.5)), WriteOutcome::Written);
        let out = buf.copy_out().unwrap();
        assert_eq!((out.width, out.height), (4, 4));
        assert_eq!(out.captured_at, 2.5);
        assert!(out.pixels().iter().all(|&b| b == 9));
        assert_eq!(buf.sequence(), 1);
    }

    #[test]
    fn held_lock_makes_write_skip_immediately() {
        let buf = SharedFrameBuffer::new(Arc::from("cam"), 2 * 2 * 3);
        buf.try_write(&frame(2, 2, 1, 1.0));

        let guard = buf.lock();
        let start = Instant::now();
        assert_eq!(buf.try_write(&frame(2, 2, 7, 2.0)), WriteOutcome::Contended);
        assert!(start.elapsed() < Duration::from_millis(50));
        drop(guard);

        let out = buf.copy_out().unwrap();
        assert!(out.pixels().iter().all(|&b| b == 1));
        assert_eq!(out.captured_at, 1.0);
        assert_eq!(buf.sequence(), 1);
    }

    #[test]
    fn held_lock_from_another_thread() {
        let buf = Arc::new(SharedFrameBuffer::new(Arc::from("cam"), 12));
        let reader = buf.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let _guard = reader.lock();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        locked_rx.recv().unwrap();
        assert_eq!(buf.try_write(&frame(2, 2, 5, 1.0)), WriteOutcome::Contended);
        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert_eq!(buf.try_write(&frame(2, 2, 5, 1.0)), WriteOutcome::Written);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let buf = SharedFrameBuffer::new(Arc::from("cam"), 10);
        assert_eq!(buf.try_write(&frame(2, 2, 0, 0.0)), WriteOutcome::TooLarge);
        assert!(buf.copy_out().is_none());
    }

    #[test]
    fn status_slot_overwrites_and_truncates() {
        let slot = StatusSlot::new(12);
        slot.write("cam1 can see [dog]");
        assert_eq!(slot.read(), "cam1 can see");
        slot.write("short");
        assert_eq!(slot.read(), "short");
        slot.write("ééééééé");
        assert_eq!(slot.read(), "éééééé");
    }
}
