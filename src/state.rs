//! Aggregated per-source state.
//!
//! The supervisor's pump threads are the only writers (`update`, `touch`,
//! `mark_stopped`). Any number of publishers, dashboards and API handlers read
//! through `snapshot`, `latest_frame` and friends, which always return copies.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;

use crate::detect::Detection;
use crate::error::RegistryError;
use crate::messages::FramePacket;
use crate::pipeline::PipelineState;
use crate::shared::{SharedFrameBuffer, StatusSlot};

const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Latest known values for one source.
pub struct SourceState {
    id: String,
    inner: RwLock<StateInner>,
}

struct StateInner {
    uri: String,
    /// Bumped on every `update`; lets readers skip unchanged sources.
    update_seq: u64,
    /// Bumped on every `update` and every pipeline state change.
    change_seq: u64,
    frame_count: u64,
    last_update: f64,
    last_seen: f64,
    width: u32,
    height: u32,
    frame_ts: f64,
    video_fps: f64,
    detection_fps: f64,
    source_fps: f64,
    detector_ms: f64,
    queue_delay_ms: f64,
    detections: Vec<Detection>,
    status: String,
    jpeg: Option<Arc<[u8]>>,
    pipeline_state: PipelineState,
    shutdown_reason: Option<String>,
    frame_buffer: Option<Arc<SharedFrameBuffer>>,
    status_slot: Option<Arc<StatusSlot>>,
}

impl SourceState {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            inner: RwLock::new(StateInner {
                uri: String::new(),
                update_seq: 0,
                change_seq: 0,
                frame_count: 0,
                last_update: 0.0,
                last_seen: 0.0,
                width: 0,
                height: 0,
                frame_ts: 0.0,
                video_fps: 0.0,
                detection_fps: 0.0,
                source_fps: 0.0,
                detector_ms: 0.0,
                queue_delay_ms: 0.0,
                detections: Vec::new(),
                status: String::new(),
                jpeg: None,
                pipeline_state: PipelineState::Created,
                shutdown_reason: None,
                frame_buffer: None,
                status_slot: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn read(&self) -> RwLockReadGuard<'_, StateInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StateInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_from_packet(&self, packet: &FramePacket) -> u64 {
        let mut s = self.write();
        s.update_seq += 1;
        s.change_seq += 1;
        s.frame_count += 1;
        s.last_update = packet.result.timestamp;
        s.last_seen = s.last_seen.max(packet.result.timestamp);
        s.width = packet.width;
        s.height = packet.height;
        s.frame_ts = packet.captured_at;
        s.video_fps = packet.video_fps;
        s.detection_fps = packet.detection_fps;
        s.source_fps = packet.source_fps;
        s.detector_ms = packet.result.inference_ms;
        s.queue_delay_ms = packet.queue_delay_ms;
        s.detections = packet.result.detections.clone();
        s.status = packet.status.clone();
        if let Some(jpeg) = &packet.jpeg {
            s.jpeg = Some(Arc::from(jpeg.as_slice()));
        }
        if matches!(
            s.pipeline_state,
            PipelineState::Created | PipelineState::Starting
        ) {
            s.pipeline_state = PipelineState::Running;
        }
        s.update_seq
    }

    fn snapshot(&self) -> Snapshot {
        let s = self.read();
        Snapshot {
            source_id: self.id.clone(),
            uri: s.uri.clone(),
            update_seq: s.update_seq,
            change_seq: s.change_seq,
            frame_count: s.frame_count,
            last_update: s.last_update,
            width: s.width,
            height: s.height,
            video_fps: s.video_fps,
            detection_fps: s.detection_fps,
            source_fps: s.source_fps,
            detector_latency_ms: s.detector_ms,
            queue_delay_ms: s.queue_delay_ms,
            detections: s.detections.clone(),
            status: s.status.clone(),
            state: s.pipeline_state,
            shutdown_reason: s.shutdown_reason.clone(),
            has_frame: s.jpeg.is_some()
                || s.frame_buffer.as_ref().is_some_and(|buffer| buffer.sequence() > 0),
        }
    }
}

/// Immutable copy of one source's state, ready for publication.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub source_id: String,
    pub uri: String,
    pub update_seq: u64,
    /// Moves on frames and on state transitions such as `Stopped`.
    pub change_seq: u64,
    pub frame_count: u64,
    /// Seconds since the Unix epoch; 0 before the first result.
    pub last_update: f64,
    pub width: u32,
    pub height: u32,
    pub video_fps: f64,
    pub detection_fps: f64,
    pub source_fps: f64,
    pub detector_latency_ms: f64,
    pub queue_delay_ms: f64,
    pub detections: Vec<Detection>,
    pub status: String,
    pub state: PipelineState,
    pub shutdown_reason: Option<String>,
    pub has_frame: bool,
}

/// Encoded latest frame of a source.
#[derive(Clone, Debug, PartialEq)]
pub struct LatestFrame {
    pub jpeg: Arc<[u8]>,
    /// Capture time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
}

/// Liveness of one source for health checks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    /// Analysed a frame within the window and the pipeline is still active.
    pub alive: bool,
    /// Heard from (frame or heartbeat) within the window.
    pub responsive: bool,
    /// Seconds since the last analysed frame, if any.
    pub last_frame_age: Option<f64>,
    pub frame_count: u64,
    pub video_fps: f64,
    pub detection_fps: f64,
    pub state: PipelineState,
    pub reason: Option<String>,
}

/// Thread-safe map from source id to `SourceState`.
pub struct StateRegistry {
    sources: RwLock<HashMap<String, Arc<SourceState>>>,
    jpeg_quality: u8,
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::with_jpeg_quality(DEFAULT_JPEG_QUALITY)
    }

    /// Quality used when encoding frames read out of shared buffers.
    pub fn with_jpeg_quality(quality: u8) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            jpeg_quality: quality.clamp(1, 100),
        }
    }

    /// Return the entry for `id`, creating it if needed.
    pub fn ensure(&self, id: &str) -> Arc<SourceState> {
        if let Some(state) = self.get(id) {
            return state;
        }
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        sources
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(SourceState::new(id)))
            .clone()
    }

    /// Ensure `id` exists and record where it reads from.
    pub fn register_source(&self, id: &str, uri: &str) -> Arc<SourceState> {
        let state = self.ensure(id);
        state.write().uri = uri.to_string();
        state
    }

    /// Point `id` at its in-process publication slots.
    pub fn attach(&self, id: &str, buffer: Option<Arc<SharedFrameBuffer>>, status: Arc<StatusSlot>) {
        let state = self.ensure(id);
        let mut s = state.write();
        s.frame_buffer = buffer;
        s.status_slot = Some(status);
    }

    fn get(&self, id: &str) -> Option<Arc<SourceState>> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn lookup(&self, id: &str) -> Result<Arc<SourceState>, RegistryError> {
        self.get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Merge one analysed frame into `id`'s state. Returns the new update sequence.
    pub fn update(&self, id: &str, packet: &FramePacket) -> u64 {
        self.ensure(id).update_from_packet(packet)
    }

    /// Record that `id` is responsive without new results (heartbeats).
    pub fn touch(&self, id: &str, timestamp: f64, state: PipelineState) {
        let entry = self.ensure(id);
        {
            let mut s = entry.write();
            s.last_seen = s.last_seen.max(timestamp);
        }
        self.set_state(id, state);
    }

    /// Mirror the live pipeline state. A recorded `Stopped` is never overwritten.
    pub fn set_state(&self, id: &str, state: PipelineState) {
        let entry = self.ensure(id);
        let mut s = entry.write();
        if s.pipeline_state != PipelineState::Stopped && s.pipeline_state != state {
            s.pipeline_state = state;
            s.change_seq += 1;
        }
    }

    /// Record a pipeline's terminal state. Last known values are kept.
    pub fn mark_stopped(&self, id: &str, reason: &str, state: PipelineState) {
        let entry = self.ensure(id);
        let mut s = entry.write();
        s.pipeline_state = state;
        s.shutdown_reason = Some(reason.to_string());
        s.change_seq += 1;
    }

    pub fn snapshot(&self, id: &str) -> Result<Snapshot, RegistryError> {
        Ok(self.lookup(id)?.snapshot())
    }

    /// Snapshots of every source, ordered by id.
    pub fn snapshot_all(&self) -> Vec<Snapshot> {
        let mut all: Vec<Snapshot> = self.entries().iter().map(|s| s.snapshot()).collect();
        all.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        all
    }

    /// Latest annotated frame as JPEG, copied out of the shared buffer when the
    /// pipeline runs in-process. `Ok(None)` before the first frame.
    pub fn latest_frame(&self, id: &str) -> Result<Option<LatestFrame>, RegistryError> {
        let state = self.lookup(id)?;
        let (jpeg, buffer, width, height, ts) = {
            let s = state.read();
            (s.jpeg.clone(), s.frame_buffer.clone(), s.width, s.height, s.frame_ts)
        };
        if let Some(jpeg) = jpeg {
            return Ok(Some(LatestFrame {
                jpeg,
                timestamp: ts,
                width,
                height,
            }));
        }
        let Some(frame) = buffer.and_then(|buffer| buffer.copy_out()) else {
            return Ok(None);
        };
        match frame.encode_jpeg(self.jpeg_quality) {
            Ok(bytes) => Ok(Some(LatestFrame {
                jpeg: Arc::from(bytes.as_slice()),
                timestamp: frame.captured_at,
                width: frame.width,
                height: frame.height,
            })),
            Err(err) => {
                log::warn!("[{}] failed to encode latest frame: {:#}", id, err);
                Ok(None)
            }
        }
    }

    /// Current status text, from the live status slot when attached.
    pub fn status(&self, id: &str) -> Result<String, RegistryError> {
        let state = self.lookup(id)?;
        let s = state.read();
        Ok(match &s.status_slot {
            Some(slot) => slot.read(),
            None => s.status.clone(),
        })
    }

    /// Whether `id` has been updated after sequence `seen`.
    pub fn has_update_since(&self, id: &str, seen: u64) -> Result<bool, RegistryError> {
        Ok(self.lookup(id)?.read().update_seq > seen)
    }

    /// Whether `id` got a frame or changed state after change sequence `seen`.
    pub fn has_changed_since(&self, id: &str, seen: u64) -> Result<bool, RegistryError> {
        Ok(self.lookup(id)?.read().change_seq > seen)
    }

    /// Liveness of every source at `now` (epoch seconds).
    pub fn health(&self, now: f64, window: Duration) -> Vec<SourceHealth> {
        let window = window.as_secs_f64();
        let mut out: Vec<SourceHealth> = self
            .entries()
            .iter()
            .map(|state| {
                let s = state.read();
                let recent = |ts: f64| ts > 0.0 && now - ts < window;
                SourceHealth {
                    source_id: state.id.clone(),
                    alive: recent(s.last_update) && s.pipeline_state.is_active(),
                    responsive: recent(s.last_seen),
                    last_frame_age: (s.last_update > 0.0).then(|| (now - s.last_update).max(0.0)),
                    frame_count: s.frame_count,
                    video_fps: s.video_fps,
                    detection_fps: s.detection_fps,
                    state: s.pipeline_state,
                    reason: s.shutdown_reason.clone(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        out
    }

    /// Known source ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// `(id, uri)` for every source, sorted by id.
    pub fn sources(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .entries()
            .iter()
            .map(|state| (state.id.clone(), state.read().uri.clone()))
            .collect();
        out.sort();
        out
    }

    fn entries(&self) -> Vec<Arc<SourceState>> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, DetectionResult};
    use crate::frame::Frame;
    use crate::shared::WriteOutcome;

    fn packet(id: &str, ts: f64, jpeg: Option<Vec<u8>>) -> FramePacket {
        FramePacket {
            result: DetectionResult {
                source_id: id.to_string(),
                detections: vec![Detection::new("cat", 0.9, BoundingBox::new(0.0, 0.0, 2.0, 2.0))],
                inference_ms: 4.0,
                timestamp: ts,
            },
            sequence: 1,
            captured_at: ts - 0.1,
            width: 8,
            height: 6,
            jpeg,
            video_fps: 10.0,
            detection_fps: 8.0,
            source_fps: 10.0,
            queue_delay_ms: 2.0,
            status: format!("{} can see [cat]", id),
        }
    }

    #[test]
    fn unknown_source_is_not_found() {
        let registry = StateRegistry::new();
        assert_eq!(
            registry.snapshot("ghost"),
            Err(RegistryError::NotFound("ghost".into()))
        );
        assert!(registry.latest_frame("ghost").is_err());
        assert!(registry.status("ghost").is_err());
    }

    #[test]
    fn update_counts_frames_and_tracks_sequence() {
        let registry = StateRegistry::new();
        registry.register_source("a", "stub://a");
        assert!(!registry.has_update_since("a", 0).unwrap());

        let seq = registry.update("a", &packet("a", 100.0, None));
        assert_eq!(seq, 1);
        registry.update("a", &packet("a", 101.0, None));

        let snap = registry.snapshot("a").unwrap();
        assert_eq!(snap.frame_count, 2);
        assert_eq!(snap.uri, "stub://a");
        assert_eq!(snap.last_update, 101.0);
        assert_eq!(snap.detections.len(), 1);
        assert_eq!(snap.state, PipelineState::Running);
        assert!(registry.has_update_since("a", 1).unwrap());
        assert!(!registry.has_update_since("a", 2).unwrap());
        assert_eq!(registry.status("a").unwrap(), "a can see [cat]");
    }

    #[test]
    fn latest_frame_prefers_inline_jpeg_then_shared_buffer() {
        let registry = StateRegistry::new();
        registry.update("inline", &packet("inline", 10.0, Some(vec![1, 2, 3])));
        let frame = registry.latest_frame("inline").unwrap().unwrap();
        assert_eq!(&*frame.jpeg, &[1, 2, 3]);
        assert_eq!(frame.timestamp, 10.0 - 0.1);

        let buffer = Arc::new(SharedFrameBuffer::new(Arc::from("shared"), 4 * 4 * 3));
        registry.attach("shared", Some(buffer.clone()), Arc::new(StatusSlot::default()));
        assert!(registry.latest_frame("shared").unwrap().is_none());
        let mut f = Frame::blank(Arc::from("shared"), 4, 4).unwrap();
        f.captured_at = 42.0;
        assert_eq!(buffer.try_write(&f), WriteOutcome::Written);
        let latest = registry.latest_frame("shared").unwrap().unwrap();
        assert_eq!((latest.width, latest.height, latest.timestamp), (4, 4, 42.0));
        assert_eq!(&latest.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn health_reports_stale_and_stopped_sources() {
        let registry = StateRegistry::new();
        registry.update("fresh", &packet("fresh", 100.0, None));
        registry.update("stale", &packet("stale", 90.0, None));
        registry.update("dead", &packet("dead", 100.0, None));
        registry.mark_stopped("dead", "source failed", PipelineState::Stopped);

        let health = registry.health(101.0, Duration::from_secs(5));
        let by_id = |id: &str| health.iter().find(|h| h.source_id == id).unwrap().clone();
        assert!(by_id("fresh").alive);
        assert!(!by_id("stale").alive);
        assert_eq!(by_id("stale").last_frame_age, Some(11.0));
        let dead = by_id("dead");
        assert!(!dead.alive);
        assert_eq!(dead.reason.as_deref(), Some("source failed"));
        assert_eq!(dead.frame_count, 1);
    }

    #[test]
    fn state_changes_move_change_seq_not_update_seq() {
        let registry = StateRegistry::new();
        registry.register_source("cam", "stub://cam");
        assert!(!registry.has_changed_since("cam", 0).unwrap());

        registry.set_state("cam", PipelineState::Starting);
        registry.set_state("cam", PipelineState::Starting);
        assert_eq!(registry.snapshot("cam").unwrap().change_seq, 1);

        registry.mark_stopped("cam", "camera unplugged", PipelineState::Stopped);
        let snap = registry.snapshot("cam").unwrap();
        assert_eq!(snap.change_seq, 2);
        assert_eq!(snap.update_seq, 0);
        assert!(registry.has_changed_since("cam", 1).unwrap());
        assert!(!registry.has_update_since("cam", 0).unwrap());
    }

    #[test]
    fn heartbeat_marks_quiet_source_responsive_not_alive() {
        let registry = StateRegistry::new();
        registry.touch("quiet", 100.0, PipelineState::Running);
        let health = registry.health(102.0, Duration::from_secs(5));
        assert!(health[0].responsive);
        assert!(!health[0].alive);
        assert_eq!(health[0].last_frame_age, None);
        assert_eq!(health[0].state, PipelineState::Running);
    }
}
