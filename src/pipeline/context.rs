use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{PipelineSettings, SourceSpec};
use crate::messages::WorkerEvent;
use crate::queue::DropOldestQueue;

use super::metrics::PipelineMetrics;
use super::state::{PipelineState, StateCell, StopToken};

/// Everything a stage of one pipeline shares with its sibling and its owner.
#[derive(Clone)]
pub(crate) struct StageContext {
    pub spec: Arc<SourceSpec>,
    pub settings: Arc<PipelineSettings>,
    pub stop: StopToken,
    pub state: StateCell,
    pub metrics: Arc<PipelineMetrics>,
    pub results: DropOldestQueue<WorkerEvent>,
    live_stages: Arc<AtomicUsize>,
    reason: Arc<Mutex<Option<String>>>,
}

impl StageContext {
    pub fn new(
        spec: Arc<SourceSpec>,
        settings: Arc<PipelineSettings>,
        results: DropOldestQueue<WorkerEvent>,
    ) -> Self {
        Self {
            spec,
            settings,
            stop: StopToken::new(),
            state: StateCell::new(),
            metrics: Arc::new(PipelineMetrics::new()),
            results,
            live_stages: Arc::new(AtomicUsize::new(0)),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Record why the pipeline is ending. The first reason wins.
    pub fn set_reason(&self, reason: impl Into<String>) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason.into());
        }
    }

    fn take_reason(&self) -> String {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| "stop requested".to_string())
    }

    /// Register a stage before its thread is spawned. The returned guard must
    /// move into that thread; dropping it marks the stage as exited.
    pub fn enter_stage(&self, stage: &'static str) -> StageExitGuard {
        self.live_stages.fetch_add(1, Ordering::AcqRel);
        StageExitGuard {
            ctx: self.clone(),
            stage,
        }
    }
}

/// Runs when a stage exits for any reason, including a panic.
///
/// The exiting stage stops its sibling. The last stage out marks the pipeline
/// `Stopped` and emits its single `Shutdown` event.
pub(crate) struct StageExitGuard {
    ctx: StageContext,
    stage: &'static str,
}

impl Drop for StageExitGuard {
    fn drop(&mut self) {
        let ctx = &self.ctx;
        if std::thread::panicking() {
            ctx.set_reason(format!("{} stage panicked", self.stage));
        }
        ctx.stop.cancel();
        ctx.state.transition(PipelineState::Stopping);
        log::debug!("[{}] {} stage exited", ctx.id(), self.stage);

        if ctx.live_stages.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        ctx.state.transition(PipelineState::Stopped);
        let reason = ctx.take_reason();
        log::info!("[{}] pipeline stopped: {}", ctx.id(), reason);
        ctx.results.put(WorkerEvent::Shutdown {
            source_id: ctx.id().to_string(),
            reason,
            final_state: ctx.state.get(),
        });
    }
}
