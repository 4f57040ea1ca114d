//! Publication adapters: turn registry snapshots into whatever a sink wants.
//!
//! Sinks only see sources whose change sequence moved since the last poll, so a
//! slow sink skips intermediate frames instead of queueing them. State changes
//! without a frame (a source dying) move the sequence too.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::Engine;
use serde::Serialize;

use crate::state::{LatestFrame, Snapshot, StateRegistry};

/// A consumer of published state.
pub trait Sink: Send {
    fn publish(&mut self, snapshot: &Snapshot, frame: Option<&LatestFrame>) -> Result<()>;

    /// Whether `publish` wants the encoded frame. Encoding is skipped otherwise.
    fn wants_frames(&self) -> bool {
        false
    }

    /// Called once after each poll that delivered at least one snapshot.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn publish(&mut self, snapshot: &Snapshot, frame: Option<&LatestFrame>) -> Result<()> {
        (**self).publish(snapshot, frame)
    }

    fn wants_frames(&self) -> bool {
        (**self).wants_frames()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// One `info` line per update.
#[derive(Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn publish(&mut self, snap: &Snapshot, _frame: Option<&LatestFrame>) -> Result<()> {
        log::info!(
            "[{}] {} | {}x{} | video {:.1} fps | detect {:.1} fps | {:.0} ms | {}",
            snap.source_id,
            snap.state,
            snap.width,
            snap.height,
            snap.video_fps,
            snap.detection_fps,
            snap.detector_latency_ms,
            snap.status
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    #[serde(flatten)]
    snapshot: &'a Snapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_jpeg: Option<String>,
}

/// Snapshots as JSON lines, optionally with the frame as base64 JPEG.
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
    include_frames: bool,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            include_frames: false,
        }
    }

    pub fn with_frames(mut self, include: bool) -> Self {
        self.include_frames = include;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn publish(&mut self, snapshot: &Snapshot, frame: Option<&LatestFrame>) -> Result<()> {
        let record = JsonRecord {
            snapshot,
            frame_jpeg: frame
                .filter(|_| self.include_frames)
                .map(|f| base64::engine::general_purpose::STANDARD.encode(&f.jpeg)),
        };
        serde_json::to_writer(&mut self.out, &record).context("encode snapshot")?;
        self.out.write_all(b"\n").context("write snapshot")?;
        Ok(())
    }

    fn wants_frames(&self) -> bool {
        self.include_frames
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().context("flush snapshots")
    }
}

/// Remembers the last change sequence seen per source.
#[derive(Debug, Default)]
pub struct Subscription {
    seen: HashMap<String, u64>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots of sources that changed since the previous poll, by id.
    pub fn poll(&mut self, registry: &StateRegistry) -> Vec<Snapshot> {
        let mut changed = Vec::new();
        for id in registry.ids() {
            let seen = self.seen.get(&id).copied().unwrap_or(0);
            if !registry.has_changed_since(&id, seen).unwrap_or(false) {
                continue;
            }
            if let Ok(snapshot) = registry.snapshot(&id) {
                self.seen.insert(id, snapshot.change_seq);
                changed.push(snapshot);
            }
        }
        changed
    }
}

/// Deliver changed snapshots to every sink. A failing sink is logged and skipped
/// for this round only.
pub fn publish_once(
    registry: &StateRegistry,
    subscription: &mut Subscription,
    sinks: &mut [Box<dyn Sink>],
) -> usize {
    let changed = subscription.poll(registry);
    if changed.is_empty() {
        return 0;
    }
    let want_frames = sinks.iter().any(|s| s.wants_frames());
    for snapshot in &changed {
        let frame = if want_frames {
            registry.latest_frame(&snapshot.source_id).ok().flatten()
        } else {
            None
        };
        for sink in sinks.iter_mut() {
            if let Err(err) = sink.publish(snapshot, frame.as_ref()) {
                log::warn!("[{}] sink publish failed: {:#}", snapshot.source_id, err);
            }
        }
    }
    for sink in sinks.iter_mut() {
        if let Err(err) = sink.flush() {
            log::warn!("sink flush failed: {:#}", err);
        }
    }
    changed.len()
}

/// Background loop polling the registry every `interval`.
pub struct Publisher;

impl Publisher {
    pub fn spawn(
        registry: Arc<StateRegistry>,
        sinks: Vec<Box<dyn Sink>>,
        interval: Duration,
    ) -> Result<PublisherHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let published = Arc::new(Mutex::new(0u64));
        let join = {
            let shutdown = shutdown.clone();
            let published = published.clone();
            thread::Builder::new()
                .name("publisher".to_string())
                .spawn(move || {
                    let mut sinks = sinks;
                    let mut subscription = Subscription::new();
                    while !shutdown.load(Ordering::Acquire) {
                        let started = Instant::now();
                        let n = publish_once(&registry, &mut subscription, &mut sinks);
                        *published.lock().unwrap_or_else(PoisonError::into_inner) += n as u64;
                        thread::sleep(interval.saturating_sub(started.elapsed()));
                    }
                    // Final round so the last state of every source is seen.
                    publish_once(&registry, &mut subscription, &mut sinks);
                })
                .context("spawn publisher thread")?
        };
        Ok(PublisherHandle {
            shutdown,
            published,
            join: Some(join),
        })
    }
}

pub struct PublisherHandle {
    shutdown: Arc<AtomicBool>,
    published: Arc<Mutex<u64>>,
    join: Option<JoinHandle<()>>,
}

impl PublisherHandle {
    /// Snapshots delivered so far.
    pub fn published(&self) -> u64 {
        *self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow::anyhow!("publisher thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionResult;
    use crate::messages::FramePacket;
    use crate::pipeline::PipelineState;

    fn packet(id: &str, jpeg: Option<Vec<u8>>) -> FramePacket {
        FramePacket {
            result: DetectionResult {
                source_id: id.into(),
                detections: Vec::new(),
                inference_ms: 3.0,
                timestamp: 50.0,
            },
            sequence: 1,
            captured_at: 49.9,
            width: 2,
            height: 2,
            jpeg,
            video_fps: 10.0,
            detection_fps: 9.0,
            source_fps: 10.0,
            queue_delay_ms: 1.0,
            status: format!("{} sees nothing", id),
        }
    }

    #[test]
    fn subscription_reports_only_changed_sources() {
        let registry = StateRegistry::new();
        registry.register_source("a", "stub://a");
        registry.register_source("b", "stub://b");
        let mut sub = Subscription::new();
        assert!(sub.poll(&registry).is_empty());

        registry.update("a", &packet("a", None));
        let changed = sub.poll(&registry);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].source_id, "a");
        assert!(sub.poll(&registry).is_empty());

        registry.update("a", &packet("a", None));
        registry.update("a", &packet("a", None));
        registry.update("b", &packet("b", None));
        let ids: Vec<String> = sub.poll(&registry).into_iter().map(|s| s.source_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn subscription_delivers_stop_without_frames() {
        let registry = StateRegistry::new();
        registry.register_source("cam", "stub://cam");
        let mut sub = Subscription::new();
        assert!(sub.poll(&registry).is_empty());

        registry.mark_stopped("cam", "camera unplugged", PipelineState::Stopped);
        let changed = sub.poll(&registry);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].state, PipelineState::Stopped);
        assert_eq!(changed[0].frame_count, 0);
        assert_eq!(changed[0].shutdown_reason.as_deref(), Some("camera unplugged"));
        assert!(sub.poll(&registry).is_empty());
    }

    #[test]
    fn json_sink_writes_lines_with_frames() {
        let registry = StateRegistry::new();
        registry.update("cam", &packet("cam", Some(vec![0xFF, 0xD8, 0xFF])));
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(
            JsonLinesSink::new(Vec::new()).with_frames(true),
        )];
        let mut sub = Subscription::new();
        assert_eq!(publish_once(&registry, &mut sub, &mut sinks), 1);
        assert_eq!(publish_once(&registry, &mut sub, &mut sinks), 0);

        let mut out = Vec::new();
        let snap = registry.snapshot("cam").unwrap();
        let frame = registry.latest_frame("cam").unwrap();
        JsonLinesSink::new(&mut out)
            .with_frames(true)
            .publish(&snap, frame.as_ref())
            .unwrap();
        let line: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(line["source_id"], "cam");
        assert_eq!(line["frame_count"], 1);
        assert_eq!(line["frame_jpeg"], "/9j/");
    }
}
