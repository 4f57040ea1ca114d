#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use sightline::{
    Detection, DetectorBackend, Frame, FrameSource, PipelineSettings, SourceError, SourceOpener,
    SourceSpec,
};

pub const WIDTH: u32 = 8;
pub const HEIGHT: u32 = 6;

#[derive(Clone, Copy, Debug)]
pub enum Step {
    Frame,
    Fail,
    Eof,
}

/// Plays back a fixed script of reads, then repeats `then` forever.
pub struct ScriptedSource {
    id: Arc<str>,
    script: VecDeque<Step>,
    then: Step,
    delay: Duration,
}

impl ScriptedSource {
    pub fn new(id: &str, script: impl IntoIterator<Item = Step>, then: Step) -> Self {
        Self {
            id: Arc::from(id),
            script: script.into_iter().collect(),
            then,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl FrameSource for ScriptedSource {
    fn read(&mut self) -> Result<Frame, SourceError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match self.script.pop_front().unwrap_or(self.then) {
            Step::Frame => {
                let data = vec![90; (WIDTH * HEIGHT * 3) as usize];
                Ok(Frame::new(self.id.clone(), WIDTH, HEIGHT, data, sightline::now_secs())?)
            }
            Step::Fail => Err(SourceError::Read(anyhow!("scripted read failure"))),
            Step::Eof => Err(SourceError::EndOfStream),
        }
    }

    fn native_fps(&self) -> Option<f64> {
        Some(200.0)
    }

    fn rewind(&mut self) -> Result<()> {
        Err(anyhow!("scripted sources do not rewind"))
    }

    fn is_live(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("scripted:{}", self.id)
    }
}

type SourceFactory = dyn Fn(&SourceSpec) -> Result<Box<dyn FrameSource>> + Send + Sync;

/// Opener backed by a closure.
pub struct FnOpener(Box<SourceFactory>);

impl FnOpener {
    pub fn new<F>(f: F) -> Arc<Self>
    where
        F: Fn(&SourceSpec) -> Result<Box<dyn FrameSource>> + Send + Sync + 'static,
    {
        Arc::new(Self(Box::new(f)))
    }

    /// Opens the same script every time.
    pub fn scripted(script: Vec<Step>, then: Step, delay: Duration) -> Arc<Self> {
        let script = Mutex::new(Some(script));
        Self::new(move |spec| {
            let steps = script.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedSource::new(&spec.id, steps, then).with_delay(delay)))
        })
    }
}

impl SourceOpener for FnOpener {
    fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>> {
        (self.0)(spec)
    }
}

/// Counts `detect` calls; optionally panics on the first one.
pub struct CountingDetector {
    pub calls: Arc<AtomicUsize>,
    pub panic: bool,
}

impl CountingDetector {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
                panic: false,
            },
            calls,
        )
    }
}

impl DetectorBackend for CountingDetector {
    fn name(&self) -> &str {
        "counting"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("detector blew up");
        }
        Ok(Vec::new())
    }
}

/// Small, fast settings for tests.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        analysis_width: WIDTH,
        warmup_runs: 0,
        frame_timeout: Duration::from_secs(2),
        result_poll: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(2),
        ..PipelineSettings::default()
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
