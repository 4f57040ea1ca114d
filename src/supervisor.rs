//! Owns every source pipeline and pumps their results into the registry.
//!
//! Each source gets its own result queue and its own pump thread, so a busy or
//! dead source never delays another one. Pipelines run either as a thread pair
//! in this process or as a `sightline_worker` child process; the pump treats
//! both the same way.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::config::{SightlineConfig, SourceSpec, WorkerMode};
use crate::detect::BackendRegistry;
use crate::error::QueueError;
use crate::ingest::SourceOpener;
use crate::messages::{WorkerAssignment, WorkerEvent};
use crate::pipeline::{
    PipelineHandle, PipelineMetrics, PipelineState, PublishMode, SourcePipeline, StateCell,
};
use crate::queue::DropOldestQueue;
use crate::state::StateRegistry;
use crate::worker::{default_worker_exe, ProcessWorker};

const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What `Supervisor::stop` had to do to bring every source down.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ShutdownReport {
    /// Exited on their own within the grace period.
    pub stopped: Vec<String>,
    /// Worker processes that had to be signalled or killed.
    pub killed: Vec<String>,
    /// Thread pipelines (or pumps) still running when we gave up on them.
    pub detached: Vec<String>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.killed.is_empty() && self.detached.is_empty()
    }
}

/// A source pipeline, wherever it runs.
pub enum WorkerHandle {
    Thread(PipelineHandle),
    Process(ProcessWorker),
}

impl WorkerHandle {
    fn request_stop(&mut self) {
        match self {
            WorkerHandle::Thread(handle) => handle.stop(),
            WorkerHandle::Process(worker) => worker.request_stop(),
        }
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        match self {
            WorkerHandle::Thread(handle) => handle.wait(timeout),
            WorkerHandle::Process(worker) => worker.wait(timeout),
        }
    }

    fn is_finished(&mut self) -> bool {
        match self {
            WorkerHandle::Thread(handle) => handle.is_finished(),
            WorkerHandle::Process(worker) => worker.is_finished(),
        }
    }
}

struct ManagedSource {
    id: String,
    worker: Option<WorkerHandle>,
    state: Option<StateCell>,
    pump: Option<JoinHandle<()>>,
    pump_stop: Arc<AtomicBool>,
}

pub struct Supervisor {
    config: SightlineConfig,
    opener: Arc<dyn SourceOpener>,
    backends: BackendRegistry,
    registry: Arc<StateRegistry>,
    sources: Vec<ManagedSource>,
    started: bool,
}

impl Supervisor {
    pub fn new(
        config: SightlineConfig,
        opener: Arc<dyn SourceOpener>,
        registry: Arc<StateRegistry>,
    ) -> Self {
        Self {
            config,
            opener,
            backends: BackendRegistry::with_builtins(),
            registry,
            sources: Vec::new(),
            started: false,
        }
    }

    /// Replace the detector registry used for thread-mode pipelines.
    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    pub fn registry(&self) -> Arc<StateRegistry> {
        self.registry.clone()
    }

    pub fn mode(&self) -> WorkerMode {
        self.config.mode
    }

    /// Start every configured source.
    ///
    /// A source that cannot be started is recorded as `Stopped` with the
    /// reason; the others still start.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            bail!("supervisor already started");
        }
        self.started = true;
        let worker_exe = match self.config.mode {
            WorkerMode::Process => Some(self.worker_exe()?),
            WorkerMode::Thread => None,
        };

        for spec in self.config.sources.clone() {
            self.registry.register_source(&spec.id, &spec.uri);
            let started = match &worker_exe {
                Some(exe) => self.start_process(&spec, exe),
                None => self.start_thread(&spec),
            };
            match started {
                Ok(managed) => self.sources.push(managed),
                Err(err) => {
                    log::error!("[{}] failed to start: {:#}", spec.id, err);
                    self.registry
                        .mark_stopped(&spec.id, &format!("{:#}", err), PipelineState::Stopped);
                }
            }
        }
        log::info!(
            "supervisor started {}/{} sources ({:?} mode)",
            self.sources.len(),
            self.config.sources.len(),
            self.config.mode
        );
        Ok(())
    }

    fn worker_exe(&self) -> Result<PathBuf> {
        let exe = match &self.config.worker_exe {
            Some(exe) => exe.clone(),
            None => default_worker_exe()?,
        };
        if !exe.exists() {
            bail!("worker executable {} not found", exe.display());
        }
        Ok(exe)
    }

    fn start_thread(&self, spec: &SourceSpec) -> Result<ManagedSource> {
        let detector = self
            .backends
            .build(&spec.detector)
            .with_context(|| format!("build detector for {}", spec.id))?;
        let handle = SourcePipeline::spawn(
            spec.clone(),
            self.config.pipeline.clone(),
            self.opener.clone(),
            detector,
            PublishMode::SharedBuffer,
        )?;
        self.registry
            .attach(&spec.id, handle.frame_buffer(), handle.status_slot());
        let live = LiveView {
            state: handle.state_cell(),
            metrics: handle.live_metrics(),
        };
        let results = handle.results();
        self.manage(spec, WorkerHandle::Thread(handle), Some(live), results)
    }

    fn start_process(&self, spec: &SourceSpec, exe: &Path) -> Result<ManagedSource> {
        let results = DropOldestQueue::new(self.config.pipeline.result_queue_capacity);
        let assignment = WorkerAssignment {
            source: spec.clone(),
            settings: self.config.pipeline.clone(),
        };
        let worker = ProcessWorker::spawn(exe, &assignment, results.clone())?;
        self.manage(spec, WorkerHandle::Process(worker), None, results)
    }

    fn manage(
        &self,
        spec: &SourceSpec,
        worker: WorkerHandle,
        live: Option<LiveView>,
        results: DropOldestQueue<WorkerEvent>,
    ) -> Result<ManagedSource> {
        let state = live.as_ref().map(|live| live.state.clone());
        let pump_stop = Arc::new(AtomicBool::new(false));
        let pump = Pump {
            id: spec.id.clone(),
            registry: self.registry.clone(),
            results,
            live,
            poll: self.config.pipeline.result_poll,
            stop: pump_stop.clone(),
        };
        let pump = thread::Builder::new()
            .name(format!("{}-pump", spec.id))
            .spawn(move || pump.run())
            .with_context(|| format!("spawn pump thread for {}", spec.id))?;
        Ok(ManagedSource {
            id: spec.id.clone(),
            worker: Some(worker),
            state,
            pump: Some(pump),
            pump_stop,
        })
    }

    /// Live state of a thread-mode pipeline, or the registry's view otherwise.
    pub fn pipeline_state(&self, id: &str) -> Option<PipelineState> {
        if let Some(state) = self
            .sources
            .iter()
            .find(|s| s.id == id)
            .and_then(|s| s.state.as_ref())
        {
            return Some(state.get());
        }
        self.registry.snapshot(id).ok().map(|snap| snap.state)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.pipeline_state(id)
            .map(PipelineState::is_active)
            .unwrap_or(false)
    }

    /// Stop every source, waiting at most the shutdown grace period for all of
    /// them together before forcing or detaching the rest.
    pub fn stop(&mut self) -> ShutdownReport {
        let started = Instant::now();
        let mut report = ShutdownReport::default();
        if self.sources.is_empty() {
            return report;
        }
        let grace = self.config.pipeline.shutdown_grace;
        log::info!("stopping {} sources (grace {:?})", self.sources.len(), grace);

        for source in &mut self.sources {
            if let Some(worker) = source.worker.as_mut() {
                worker.request_stop();
            }
        }

        let deadline = started + grace;
        for source in &mut self.sources {
            let Some(mut worker) = source.worker.take() else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if worker.wait(remaining) {
                report.stopped.push(source.id.clone());
                continue;
            }
            match worker {
                WorkerHandle::Process(mut process) => {
                    log::warn!("[{}] worker ignored stop, terminating", source.id);
                    process.terminate();
                    report.killed.push(source.id.clone());
                }
                WorkerHandle::Thread(mut handle) => {
                    if handle.is_finished() {
                        handle.wait(Duration::ZERO);
                        report.stopped.push(source.id.clone());
                    } else {
                        log::error!("[{}] stages still running after {:?}, detaching", source.id, grace);
                        self.registry.mark_stopped(
                            &source.id,
                            "detached after shutdown grace period",
                            handle.state(),
                        );
                        report.detached.push(source.id.clone());
                    }
                }
            }
        }

        for source in &mut self.sources {
            source.pump_stop.store(true, Ordering::Release);
        }
        for source in &mut self.sources {
            let Some(pump) = source.pump.take() else {
                continue;
            };
            let deadline = Instant::now() + PUMP_JOIN_TIMEOUT;
            while !pump.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if pump.is_finished() {
                if pump.join().is_err() {
                    log::warn!("[{}] pump thread panicked", source.id);
                }
            } else {
                log::error!("[{}] pump did not exit, detaching", source.id);
                if !report.detached.contains(&source.id) {
                    report.detached.push(source.id.clone());
                }
            }
        }
        self.sources.clear();

        report.elapsed = started.elapsed();
        log::info!(
            "shutdown finished in {:?}: {} stopped, {} killed, {} detached",
            report.elapsed,
            report.stopped.len(),
            report.killed.len(),
            report.detached.len()
        );
        report
    }

    /// Whether every started pipeline has exited on its own.
    pub fn all_finished(&mut self) -> bool {
        self.sources.iter_mut().all(|s| {
            s.worker
                .as_mut()
                .map(WorkerHandle::is_finished)
                .unwrap_or(true)
        })
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.sources.is_empty() {
            self.stop();
        }
    }
}

// ----------------------------------------------------------------------------
// Pump
// ----------------------------------------------------------------------------

/// In-process view of a thread pipeline.
struct LiveView {
    state: StateCell,
    metrics: Arc<PipelineMetrics>,
}

/// Drains one source's result queue into the registry.
struct Pump {
    id: String,
    registry: Arc<StateRegistry>,
    results: DropOldestQueue<WorkerEvent>,
    /// Thread pipelines only; process workers report the same in events.
    live: Option<LiveView>,
    poll: Duration,
    stop: Arc<AtomicBool>,
}

impl Pump {
    fn run(self) {
        log::debug!("[{}] pump started", self.id);
        loop {
            match self.results.get(self.poll) {
                Ok(WorkerEvent::Frame(packet)) => {
                    self.registry.update(&self.id, &packet);
                    if let Some(live) = &self.live {
                        self.registry.set_state(&self.id, live.state.get());
                    }
                }
                Ok(WorkerEvent::Heartbeat {
                    timestamp, state, ..
                }) => self.registry.touch(&self.id, timestamp, state),
                Ok(WorkerEvent::Shutdown {
                    reason,
                    final_state,
                    ..
                }) => {
                    log::info!("[{}] pipeline reported shutdown: {}", self.id, reason);
                    self.registry.mark_stopped(&self.id, &reason, final_state);
                    break;
                }
                Err(QueueError::Timeout) => {
                    // Liveness follows the consumer's own progress, never the
                    // pump's clock.
                    if let Some(live) = &self.live {
                        let current = live.state.get();
                        if current.is_active() {
                            self.registry
                                .touch(&self.id, live.metrics.last_beat(), current);
                        }
                    }
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(QueueError::Disconnected) => break,
            }
        }
        log::debug!("[{}] pump exited", self.id);
    }
}
