//! Frame producer stage: read, prepare and hand off frames for one source.

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};

use crate::error::SourceError;
use crate::frame::{analysis_shape, Frame};
use crate::ingest::{effective_fps, SourceOpener};
use crate::queue::DropOldestQueue;
use crate::rate::{FpsTracker, Pacer};

use super::context::StageContext;
use super::display_edge;
use super::state::PipelineState;

/// Display-sized frame plus the copy the detector sees.
#[derive(Debug)]
pub struct FramePair {
    pub display: Frame,
    pub analysis: Frame,
}

/// Run until stopped, the source ends, or reads keep failing.
///
/// The first read only confirms the source works: on success it moves the
/// pipeline to `Running` and is not handed off; on failure the pipeline stops
/// without retrying. Later failures count toward `failure_threshold`.
pub(crate) fn run(
    ctx: &StageContext,
    opener: &dyn SourceOpener,
    frames: &DropOldestQueue<FramePair>,
) -> Result<()> {
    let id = ctx.id();
    let settings = &ctx.settings;
    ctx.state.transition(PipelineState::Starting);

    let mut source = opener
        .open(&ctx.spec)
        .with_context(|| format!("failed to open source {}", ctx.spec.uri))?;
    let fps = effective_fps(source.as_ref(), ctx.spec.fps);
    ctx.metrics.set_source_fps(fps);
    let paced = !source.is_live();
    let loop_on_eof = ctx.spec.loops_on_eof(settings) && !source.is_live();
    let (target_width, target_height) = ctx.spec.analysis_target(settings);
    log::info!(
        "[{}] reading {} at {:.1} fps (paced {}, loop {})",
        id,
        source.describe(),
        fps,
        paced,
        loop_on_eof
    );

    let mut pacer = Pacer::new(fps);
    let mut tracker = FpsTracker::default();
    let mut failures: u32 = 0;
    let mut started = false;

    while !ctx.stop.is_cancelled() {
        let read_started = Instant::now();
        let read = source.read();
        let read_took = read_started.elapsed();
        if read_took > settings.slow_read_warning {
            log::warn!("[{}] slow frame read: {:?}", id, read_took);
        }

        let failure = match read {
            Ok(frame) => {
                failures = 0;
                tracker.tick();
                ctx.metrics.record_read(tracker.rate());
                if !started {
                    started = true;
                    ctx.state.transition(PipelineState::Running);
                    log::info!("[{}] first frame {}x{}", id, frame.width, frame.height);
                    pacer.reset();
                    if paced {
                        pacer.wait();
                    }
                    continue;
                }
                ctx.state.transition(PipelineState::Running);

                let display = frame.fit_within(display_edge(settings))?;
                let (width, height) =
                    analysis_shape(display.width, display.height, target_width, target_height);
                let analysis = display.resized(width, height)?;
                if frames.put(FramePair { display, analysis }).is_some() {
                    ctx.metrics.record_dropped();
                    log::debug!("[{}] consumer busy, replaced queued frame", id);
                }
                if paced {
                    pacer.wait();
                }
                continue;
            }
            Err(SourceError::EndOfStream) if !started => {
                bail!("source ended before the first frame");
            }
            Err(SourceError::Read(err)) if !started => {
                ctx.metrics.record_read_failure(1);
                return Err(err.context("failed to read first frame"));
            }
            Err(SourceError::EndOfStream) if loop_on_eof => {
                log::info!("[{}] end of stream, rewinding", id);
                pacer.reset();
                match source.rewind() {
                    Ok(()) => continue,
                    Err(err) => err.context("rewind failed"),
                }
            }
            Err(SourceError::EndOfStream) => {
                ctx.set_reason("end of stream");
                return Ok(());
            }
            Err(SourceError::Read(err)) => err,
        };

        failures += 1;
        ctx.metrics.record_read_failure(failures);
        ctx.state.transition(PipelineState::Degraded);
        log::warn!(
            "[{}] read failed ({}/{}): {:#}",
            id,
            failures,
            settings.failure_threshold,
            failure
        );
        if failures >= settings.failure_threshold {
            return Err(anyhow!(
                "{} consecutive read failures, last: {:#}",
                failures,
                failure
            ));
        }
        if paced {
            pacer.wait();
        }
    }
    Ok(())
}
