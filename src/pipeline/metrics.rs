use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// f64 stored as bits so stages can publish figures without a lock.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Live counters written by the stages of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    video_fps: AtomicF64,
    detection_fps: AtomicF64,
    source_fps: AtomicF64,
    detector_ms: AtomicF64,
    queue_delay_ms: AtomicF64,
    frames_read: AtomicU64,
    frames_analyzed: AtomicU64,
    frames_dropped: AtomicU64,
    read_failures: AtomicU64,
    consecutive_failures: AtomicU32,
    published: AtomicU64,
    contended: AtomicU64,
    /// Epoch seconds of the consumer's last loop iteration.
    last_beat: AtomicF64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_source_fps(&self, fps: f64) {
        self.source_fps.store(fps);
    }

    pub(crate) fn record_read(&self, video_fps: f64) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.video_fps.store(video_fps);
    }

    pub(crate) fn record_read_failure(&self, consecutive: u32) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(consecutive, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_analysis(&self, detection_fps: f64, detector_ms: f64, queue_delay_ms: f64) {
        self.frames_analyzed.fetch_add(1, Ordering::Relaxed);
        self.detection_fps.store(detection_fps);
        self.detector_ms.store(detector_ms);
        self.queue_delay_ms.store(queue_delay_ms);
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_contended(&self) {
        self.contended.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn beat(&self, now: f64) {
        self.last_beat.store(now);
    }

    /// When the consumer last made progress; 0 before it started. A consumer
    /// stuck inside the detector stops moving this.
    pub fn last_beat(&self) -> f64 {
        self.last_beat.load()
    }

    pub fn video_fps(&self) -> f64 {
        self.video_fps.load()
    }

    pub fn detection_fps(&self) -> f64 {
        self.detection_fps.load()
    }

    pub fn source_fps(&self) -> f64 {
        self.source_fps.load()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            video_fps: self.video_fps.load(),
            detection_fps: self.detection_fps.load(),
            source_fps: self.source_fps.load(),
            detector_ms: self.detector_ms.load(),
            queue_delay_ms: self.queue_delay_ms.load(),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_analyzed: self.frames_analyzed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `PipelineMetrics`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub video_fps: f64,
    pub detection_fps: f64,
    pub source_fps: f64,
    pub detector_ms: f64,
    pub queue_delay_ms: f64,
    pub frames_read: u64,
    pub frames_analyzed: u64,
    /// Frames overwritten in the frame queue before analysis.
    pub frames_dropped: u64,
    pub read_failures: u64,
    pub consecutive_failures: u32,
    /// Successful shared-buffer writes.
    pub published: u64,
    /// Shared-buffer writes skipped because a reader held the lock.
    pub contended: u64,
}
