use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Lifecycle of one source pipeline.
///
/// `Created -> Starting -> Running <-> Degraded -> Stopping -> Stopped`.
/// `Stopping` only moves to `Stopped`, and `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

impl PipelineState {
    fn as_u8(self) -> u8 {
        match self {
            PipelineState::Created => 0,
            PipelineState::Starting => 1,
            PipelineState::Running => 2,
            PipelineState::Degraded => 3,
            PipelineState::Stopping => 4,
            PipelineState::Stopped => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Created,
            1 => PipelineState::Starting,
            2 => PipelineState::Running,
            3 => PipelineState::Degraded,
            4 => PipelineState::Stopping,
            _ => PipelineState::Stopped,
        }
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        match self {
            PipelineState::Stopped => false,
            PipelineState::Stopping => next == PipelineState::Stopped,
            _ => next != self,
        }
    }

    /// Producer and consumer may still be running.
    pub fn is_active(self) -> bool {
        !matches!(self, PipelineState::Stopping | PipelineState::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Created => "created",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Degraded => "degraded",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free holder of a `PipelineState`.
#[derive(Clone, Debug)]
pub struct StateCell {
    inner: Arc<AtomicU8>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(PipelineState::Created.as_u8())),
        }
    }

    pub fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn transition(&self, next: PipelineState) -> bool {
        let mut current = self.inner.load(Ordering::Acquire);
        loop {
            if !PipelineState::from_u8(current).can_transition_to(next) {
                return false;
            }
            match self.inner.compare_exchange_weak(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-pipeline cancellation flag, checked once per stage iteration.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Sleep up to `duration`, waking early on cancel. Returns `true` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(25);
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}
