//! One source pipeline: a producer and a consumer stage joined by a
//! capacity-1 drop-oldest frame queue.
//!
//! - `producer`: open the source, pace reads, resize, hand off frames
//! - `consumer`: run the detector, annotate, publish, emit results
//! - `SourcePipeline::spawn`: start both stages on named threads
//!
//! Either stage exiting stops the other. The last one out marks the pipeline
//! `Stopped` and emits exactly one `WorkerEvent::Shutdown` on the result queue.

mod consumer;
mod context;
mod metrics;
mod producer;
mod state;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::{PipelineSettings, SourceSpec};
use crate::detect::DetectorBackend;
use crate::frame::byte_len;
use crate::ingest::SourceOpener;
use crate::messages::WorkerEvent;
use crate::queue::DropOldestQueue;
use crate::shared::{SharedFrameBuffer, StatusSlot};

use consumer::FrameOutlet;
use context::StageContext;

pub use consumer::status_text;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use producer::FramePair;
pub use state::{PipelineState, StateCell, StopToken};

// Frame buffer edge when display width is unbounded.
const UNBOUNDED_BUFFER_EDGE: u32 = 1920;

/// How annotated frames leave the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishMode {
    /// Into a `SharedFrameBuffer` readers copy out of (same process).
    SharedBuffer,
    /// As JPEG bytes inside each `FramePacket` (crosses a process boundary).
    InlineJpeg,
}

/// Longest side of a published frame. The producer fits every display frame
/// into this square.
pub fn display_edge(settings: &PipelineSettings) -> u32 {
    match settings.display_max_width {
        0 => UNBOUNDED_BUFFER_EDGE,
        width => width,
    }
}

/// Byte capacity of a source's frame buffer: the display square.
pub fn frame_buffer_capacity(settings: &PipelineSettings) -> usize {
    let edge = display_edge(settings);
    byte_len(edge, edge).unwrap_or(usize::MAX)
}

pub struct SourcePipeline;

impl SourcePipeline {
    /// Start the producer and consumer threads for `spec`.
    pub fn spawn(
        spec: SourceSpec,
        settings: PipelineSettings,
        opener: Arc<dyn SourceOpener>,
        detector: Box<dyn DetectorBackend>,
        mode: PublishMode,
    ) -> Result<PipelineHandle> {
        let id = spec.id.clone();
        let results = DropOldestQueue::new(settings.result_queue_capacity);
        let frames: DropOldestQueue<FramePair> = DropOldestQueue::new(settings.frame_queue_capacity);
        let status = Arc::new(StatusSlot::new(settings.status_capacity));
        let buffer = match mode {
            PublishMode::SharedBuffer => Some(Arc::new(SharedFrameBuffer::new(
                Arc::from(id.as_str()),
                frame_buffer_capacity(&settings),
            ))),
            PublishMode::InlineJpeg => None,
        };
        let outlet = match &buffer {
            Some(buffer) => FrameOutlet::Shared(buffer.clone()),
            None => FrameOutlet::Inline {
                quality: settings.jpeg_quality,
            },
        };
        let ctx = StageContext::new(Arc::new(spec), Arc::new(settings), results.clone());

        let producer_guard = ctx.enter_stage("producer");
        let consumer_guard = ctx.enter_stage("consumer");

        let producer = {
            let ctx = ctx.clone();
            let frames = frames.clone();
            thread::Builder::new()
                .name(format!("{}-producer", id))
                .spawn(move || {
                    let _guard = producer_guard;
                    if let Err(err) = producer::run(&ctx, opener.as_ref(), &frames) {
                        log::error!("[{}] producer failed: {:#}", ctx.id(), err);
                        ctx.set_reason(format!("{:#}", err));
                    }
                })
                .with_context(|| format!("spawn producer thread for {}", id))?
        };

        let consumer = {
            let ctx = ctx.clone();
            let status = status.clone();
            let mut detector = detector;
            thread::Builder::new()
                .name(format!("{}-consumer", id))
                .spawn(move || {
                    let _guard = consumer_guard;
                    if let Err(err) =
                        consumer::run(&ctx, detector.as_mut(), &frames, &outlet, &status)
                    {
                        log::error!("[{}] consumer failed: {:#}", ctx.id(), err);
                        ctx.set_reason(format!("{:#}", err));
                    }
                })
                .with_context(|| format!("spawn consumer thread for {}", id))?
        };

        log::info!("[{}] pipeline started", id);
        Ok(PipelineHandle {
            ctx,
            results,
            buffer,
            status,
            threads: vec![producer, consumer],
        })
    }
}

/// Owner-side handle to a running pipeline.
pub struct PipelineHandle {
    ctx: StageContext,
    results: DropOldestQueue<WorkerEvent>,
    buffer: Option<Arc<SharedFrameBuffer>>,
    status: Arc<StatusSlot>,
    threads: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn source_id(&self) -> &str {
        self.ctx.id()
    }

    pub fn state(&self) -> PipelineState {
        self.ctx.state.get()
    }

    /// Shared view of the state, for observers that outlive a borrow.
    pub fn state_cell(&self) -> StateCell {
        self.ctx.state.clone()
    }

    /// Ask both stages to exit after their current iteration.
    pub fn stop(&self) {
        self.ctx.stop.cancel();
    }

    pub fn stop_token(&self) -> StopToken {
        self.ctx.stop.clone()
    }

    /// Wait up to `timeout` for both stages to exit and join them.
    /// Returns `false` if a stage is still running.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.threads.iter().all(JoinHandle::is_finished) {
                for handle in self.threads.drain(..) {
                    if handle.join().is_err() {
                        log::warn!("[{}] stage thread panicked", self.ctx.id());
                    }
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn is_finished(&self) -> bool {
        self.threads.iter().all(JoinHandle::is_finished)
    }

    /// Result queue; ends with a `Shutdown` event.
    pub fn results(&self) -> DropOldestQueue<WorkerEvent> {
        self.results.clone()
    }

    /// Latest annotated frame; `None` for inline-JPEG pipelines.
    pub fn frame_buffer(&self) -> Option<Arc<SharedFrameBuffer>> {
        self.buffer.clone()
    }

    pub fn status_slot(&self) -> Arc<StatusSlot> {
        self.status.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Live counters, for observers that outlive a borrow.
    pub fn live_metrics(&self) -> Arc<PipelineMetrics> {
        self.ctx.metrics.clone()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.ctx.stop.cancel();
    }
}
