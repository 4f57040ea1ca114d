//! Detection consumer stage: analyse frames, annotate, publish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::detect::{filter_confident, Detection, DetectionResult, DetectorBackend};
use crate::error::QueueError;
use crate::frame::{scaled_height, Frame};
use crate::messages::{FramePacket, WorkerEvent};
use crate::queue::DropOldestQueue;
use crate::rate::FpsTracker;
use crate::shared::{SharedFrameBuffer, StatusSlot, WriteOutcome};

use super::context::StageContext;
use super::producer::FramePair;

// Upper bound on how long a frame wait goes without checking the stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Where annotated frames go.
pub(crate) enum FrameOutlet {
    /// Non-blocking write into the in-process buffer.
    Shared(Arc<SharedFrameBuffer>),
    /// JPEG inside each `FramePacket`, for process workers.
    Inline { quality: u8 },
}

/// Run until stopped, frames stop arriving, or the detector fails.
pub(crate) fn run(
    ctx: &StageContext,
    detector: &mut dyn DetectorBackend,
    frames: &DropOldestQueue<FramePair>,
    outlet: &FrameOutlet,
    status: &StatusSlot,
) -> Result<()> {
    let id = ctx.id();
    let settings = &ctx.settings;
    warm_up(ctx, detector)?;

    let mut tracker = FpsTracker::default();
    let mut sequence = 0u64;

    while let Some(pair) = next_frame(ctx, frames)? {
        let dequeued_at = crate::now_secs();
        let queue_delay_ms = ((dequeued_at - pair.display.captured_at) * 1000.0).max(0.0);

        let started = Instant::now();
        let raw = detector
            .detect(&pair.analysis)
            .with_context(|| format!("detector {} failed", detector.name()))?;
        let inference_ms = started.elapsed().as_secs_f64() * 1000.0;
        ctx.metrics.beat(crate::now_secs());
        tracker.tick();

        let detections = to_display_space(
            filter_confident(raw, settings.confidence_threshold),
            &pair.analysis,
            &pair.display,
        );
        let text = status_text(id, &detections);
        status.write(&text);

        let mut annotated = pair.display;
        annotated.draw_detections(&detections)?;

        let jpeg = match outlet {
            FrameOutlet::Shared(buffer) => {
                match buffer.try_write(&annotated) {
                    WriteOutcome::Written => ctx.metrics.record_published(),
                    WriteOutcome::Contended => {
                        ctx.metrics.record_contended();
                        log::debug!("[{}] frame buffer busy, skipped publish", id);
                    }
                    WriteOutcome::TooLarge => log::warn!(
                        "[{}] {}x{} frame exceeds buffer capacity {}",
                        id,
                        annotated.width,
                        annotated.height,
                        buffer.capacity()
                    ),
                }
                None
            }
            FrameOutlet::Inline { quality } => Some(annotated.encode_jpeg(*quality)?),
        };

        sequence += 1;
        let detection_fps = tracker.rate();
        ctx.metrics
            .record_analysis(detection_fps, inference_ms, queue_delay_ms);
        let packet = FramePacket {
            result: DetectionResult {
                source_id: id.to_string(),
                detections,
                inference_ms,
                timestamp: crate::now_secs(),
            },
            sequence,
            captured_at: annotated.captured_at,
            width: annotated.width,
            height: annotated.height,
            jpeg,
            video_fps: ctx.metrics.video_fps(),
            detection_fps,
            source_fps: ctx.metrics.source_fps(),
            queue_delay_ms,
            status: text,
        };
        if ctx.results.put(WorkerEvent::Frame(packet)).is_some() {
            log::debug!("[{}] result queue full, dropped oldest result", id);
        }
    }
    Ok(())
}

fn warm_up(ctx: &StageContext, detector: &mut dyn DetectorBackend) -> Result<()> {
    let (width, height) = ctx.spec.analysis_target(&ctx.settings);
    let height = height.unwrap_or_else(|| scaled_height(4, 3, width));
    let blank = Frame::blank(Arc::from(ctx.id()), width, height)?;
    for run in 1..=ctx.settings.warmup_runs {
        let started = Instant::now();
        if let Err(err) = detector.warm_up(&blank) {
            log::warn!("[{}] detector warm-up {} failed: {:#}", ctx.id(), run, err);
        }
        ctx.metrics.beat(crate::now_secs());
        log::debug!(
            "[{}] detector warm-up {} took {:?}",
            ctx.id(),
            run,
            started.elapsed()
        );
    }
    Ok(())
}

/// Wait for the next frame. `Ok(None)` once the pipeline is stopping; an error
/// if nothing arrives within the frame timeout.
fn next_frame(
    ctx: &StageContext,
    frames: &DropOldestQueue<FramePair>,
) -> Result<Option<FramePair>> {
    let timeout = ctx.settings.frame_timeout;
    let deadline = Instant::now() + timeout;
    loop {
        if ctx.stop.is_cancelled() {
            return Ok(None);
        }
        ctx.metrics.beat(crate::now_secs());
        let now = Instant::now();
        if now >= deadline {
            return Err(anyhow!("no frame received for {:?}", timeout));
        }
        match frames.get(STOP_POLL.min(deadline - now)) {
            Ok(pair) => return Ok(Some(pair)),
            Err(QueueError::Timeout) => continue,
            Err(QueueError::Disconnected) => return Ok(None),
        }
    }
}

/// Map boxes from analysis-frame pixels to display-frame pixels.
fn to_display_space(detections: Vec<Detection>, analysis: &Frame, display: &Frame) -> Vec<Detection> {
    let sx = display.width as f32 / analysis.width.max(1) as f32;
    let sy = display.height as f32 / analysis.height.max(1) as f32;
    detections
        .into_iter()
        .map(|det| Detection {
            bbox: det
                .bbox
                .scaled(sx, sy)
                .clamped(display.width as f32, display.height as f32),
            ..det
        })
        .collect()
}

/// "cam1 can see [cat, dog]" or "cam1 sees nothing".
pub fn status_text(source_id: &str, detections: &[Detection]) -> String {
    if detections.is_empty() {
        return format!("{} sees nothing", source_id);
    }
    let mut categories: Vec<&str> = Vec::new();
    for det in detections {
        if !categories.contains(&det.category.as_str()) {
            categories.push(&det.category);
        }
    }
    format!("{} can see [{}]", source_id, categories.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn status_lists_distinct_categories() {
        assert_eq!(status_text("cam1", &[]), "cam1 sees nothing");
        let dets = vec![
            Detection::new("cat", 0.9, BoundingBox::default()),
            Detection::new("dog", 0.8, BoundingBox::default()),
            Detection::new("cat", 0.7, BoundingBox::default()),
        ];
        assert_eq!(status_text("cam1", &dets), "cam1 can see [cat, dog]");
    }

    #[test]
    fn boxes_scale_to_display_frame() {
        let display = Frame::blank(Arc::from("cam"), 200, 100).unwrap();
        let analysis = Frame::blank(Arc::from("cam"), 100, 50).unwrap();
        let dets = vec![Detection::new("cat", 0.9, BoundingBox::new(10.0, 5.0, 120.0, 20.0))];
        let mapped = to_display_space(dets, &analysis, &display);
        assert_eq!(mapped[0].bbox, BoundingBox::new(20.0, 10.0, 200.0, 40.0));
    }
}
