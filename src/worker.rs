//! Process-isolated source pipelines.
//!
//! - `run_worker`: body of the `sightline_worker` binary. Reads one
//!   `WorkerAssignment` line, runs that source's pipeline with inline-JPEG
//!   publication, and writes every `WorkerEvent` as a JSON line.
//! - `ProcessWorker`: supervisor side. Spawns the worker, feeds its events into a
//!   drop-oldest queue, and stops it with a `Stop` line, SIGTERM, then kill.
//!
//! Nothing is shared across the boundary except the two pipes.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::detect::BackendRegistry;
use crate::error::QueueError;
use crate::ingest::SourceOpener;
use crate::messages::{WorkerAssignment, WorkerCommand, WorkerEvent};
use crate::pipeline::{PipelineState, PublishMode, SourcePipeline, StopToken};
use crate::queue::DropOldestQueue;

/// Idle time after which a worker reports a heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_POLL: Duration = Duration::from_millis(200);
const WORKER_BIN: &str = "sightline_worker";
const KILL_WAIT: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Worker process side
// ----------------------------------------------------------------------------

/// Run one assigned pipeline, streaming its events to `output` until it stops.
///
/// A `Stop` command or EOF on `input` stops the pipeline. The last line written
/// is always a `Shutdown` event.
pub fn run_worker<R, W>(
    input: R,
    output: W,
    opener: Arc<dyn SourceOpener>,
    backends: &BackendRegistry,
) -> Result<()>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    run_worker_until(input, output, opener, backends, Arc::new(AtomicBool::new(false)))
}

/// `run_worker`, also stopping the pipeline once `interrupted` is set.
pub fn run_worker_until<R, W>(
    mut input: R,
    mut output: W,
    opener: Arc<dyn SourceOpener>,
    backends: &BackendRegistry,
    interrupted: Arc<AtomicBool>,
) -> Result<()>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("read worker assignment")?;
    let assignment: WorkerAssignment =
        serde_json::from_str(line.trim()).context("parse worker assignment")?;
    let source_id = assignment.source.id.clone();
    let grace = assignment.settings.shutdown_grace;
    log::info!("[{}] worker {} assigned {}", source_id, std::process::id(), assignment.source.uri);

    let started = backends
        .build(&assignment.source.detector)
        .and_then(|detector| {
            SourcePipeline::spawn(
                assignment.source,
                assignment.settings,
                opener,
                detector,
                PublishMode::InlineJpeg,
            )
        });
    let mut handle = match started {
        Ok(handle) => handle,
        Err(err) => {
            let event = WorkerEvent::Shutdown {
                source_id: source_id.clone(),
                reason: format!("{:#}", err),
                final_state: PipelineState::Stopped,
            };
            write_line(&mut output, &event)?;
            return Err(err);
        }
    };

    let stop = handle.stop_token();
    let command_reader = thread::Builder::new()
        .name(format!("{}-commands", source_id))
        .spawn(move || read_commands(input, stop))
        .context("spawn command reader")?;

    let results = handle.results();
    let mut outcome = Ok(());
    let mut last_write = Instant::now();
    loop {
        if interrupted.load(Ordering::Acquire) && !handle.stop_token().is_cancelled() {
            log::info!("[{}] interrupted, stopping pipeline", source_id);
            handle.stop();
        }
        let event = match results.get(EVENT_POLL) {
            Ok(event) => event,
            Err(QueueError::Timeout) => {
                if last_write.elapsed() < HEARTBEAT_INTERVAL {
                    continue;
                }
                // Stamped with the consumer's last progress, so a hung
                // detector shows up as a stale heartbeat.
                WorkerEvent::Heartbeat {
                    source_id: source_id.clone(),
                    timestamp: handle.live_metrics().last_beat(),
                    state: handle.state(),
                }
            }
            Err(QueueError::Disconnected) => break,
        };
        last_write = Instant::now();
        let last = event.is_shutdown();
        if let Err(err) = write_line(&mut output, &event) {
            // Supervisor went away; nobody is left to report to.
            handle.stop();
            outcome = Err(err);
            break;
        }
        if last {
            break;
        }
    }

    if !handle.wait(grace) {
        log::warn!("[{}] pipeline did not exit within {:?}", source_id, grace);
    }
    // The command reader blocks on stdin until the supervisor closes it.
    drop(command_reader);
    outcome
}

fn read_commands<R: BufRead>(input: R, stop: StopToken) {
    for line in input.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerCommand>(line.trim()) {
            Ok(WorkerCommand::Stop) => {
                log::info!("worker {} received stop", std::process::id());
                break;
            }
            Err(err) => log::warn!("ignoring malformed command {:?}: {}", line, err),
        }
    }
    stop.cancel();
}

fn write_line<W: Write>(output: &mut W, event: &WorkerEvent) -> Result<()> {
    serde_json::to_writer(&mut *output, event).context("encode worker event")?;
    output.write_all(b"\n").context("write worker event")?;
    output.flush().context("flush worker event")
}

// ----------------------------------------------------------------------------
// Supervisor side
// ----------------------------------------------------------------------------

/// `sightline_worker` next to the running executable.
pub fn default_worker_exe() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locate current executable")?;
    Ok(exe.with_file_name(format!("{}{}", WORKER_BIN, std::env::consts::EXE_SUFFIX)))
}

/// Supervisor-side handle to one worker process.
pub struct ProcessWorker {
    source_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessWorker {
    /// Start `exe`, send it `assignment`, and forward its events into `results`.
    pub fn spawn(
        exe: &Path,
        assignment: &WorkerAssignment,
        results: DropOldestQueue<WorkerEvent>,
    ) -> Result<Self> {
        let source_id = assignment.source.id.clone();
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn worker {} for {}", exe.display(), source_id))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout not captured"))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker stdin not captured"))?;

        let reader = {
            let source_id = source_id.clone();
            thread::Builder::new()
                .name(format!("{}-reader", source_id))
                .spawn(move || forward_events(&source_id, BufReader::new(stdout), &results))
        };
        let reader = match reader {
            Ok(reader) => reader,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("spawn reader thread for {}: {}", source_id, err));
            }
        };

        let mut line = serde_json::to_string(assignment).context("encode worker assignment")?;
        line.push('\n');
        if let Err(err) = stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()) {
            log::error!("[{}] failed to send assignment: {}", source_id, err);
        }
        log::info!("[{}] worker process {} started", source_id, child.id());

        Ok(Self {
            source_id,
            child,
            stdin: Some(stdin),
            reader: Some(reader),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Send `Stop` and close stdin. Does not wait.
    pub fn request_stop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let mut line = serde_json::to_string(&WorkerCommand::Stop).unwrap_or_default();
            line.push('\n');
            if let Err(err) = stdin.write_all(line.as_bytes()) {
                log::debug!("[{}] stop command not delivered: {}", self.source_id, err);
            }
        }
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("[{}] worker exited: {}", self.source_id, status);
                    self.join_reader();
                    return true;
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("[{}] failed to poll worker: {}", self.source_id, err);
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// SIGTERM, short wait, then SIGKILL.
    pub fn terminate(&mut self) {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: kill(2) with a pid we spawned and still own.
            let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
            if rc == 0 && self.wait(KILL_WAIT) {
                return;
            }
        }
        log::warn!("[{}] killing worker {}", self.source_id, self.child.id());
        if let Err(err) = self.child.kill() {
            log::warn!("[{}] kill failed: {}", self.source_id, err);
        }
        let _ = self.child.wait();
        self.join_reader();
    }

    pub fn is_finished(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::warn!("[{}] event reader panicked", self.source_id);
            }
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.request_stop();
            if !self.wait(KILL_WAIT) {
                self.terminate();
            }
        }
    }
}

/// Parse worker stdout into `results` until EOF. Synthesises a `Shutdown`
/// event if the worker exits without sending one.
fn forward_events<R: BufRead>(source_id: &str, stdout: R, results: &DropOldestQueue<WorkerEvent>) {
    let mut shutdown_seen = false;
    for line in stdout.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::warn!("[{}] worker stdout read failed: {}", source_id, err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerEvent>(&line) {
            Ok(event) => {
                shutdown_seen |= event.is_shutdown();
                results.put(event);
            }
            Err(err) => log::warn!("[{}] malformed worker event: {}", source_id, err),
        }
    }
    if !shutdown_seen {
        log::error!("[{}] worker exited without a shutdown notice", source_id);
        results.put(WorkerEvent::Shutdown {
            source_id: source_id.to_string(),
            reason: "worker process exited unexpectedly".to_string(),
            final_state: PipelineState::Stopped,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reader_synthesises_shutdown_on_silent_exit() {
        let results = DropOldestQueue::new(4);
        let stdout = Cursor::new(
            "{\"type\":\"heartbeat\",\"source_id\":\"a\",\"timestamp\":1.0,\"state\":\"running\"}\nnot json\n",
        );
        forward_events("a", stdout, &results);
        let events = results.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WorkerEvent::Heartbeat { .. }));
        assert!(events[1].is_shutdown());
    }

    #[test]
    fn reader_keeps_worker_shutdown() {
        let results = DropOldestQueue::new(4);
        let stdout = Cursor::new(
            "{\"type\":\"shutdown\",\"source_id\":\"a\",\"reason\":\"end of stream\",\"final_state\":\"stopped\"}\n",
        );
        forward_events("a", stdout, &results);
        let events = results.drain();
        assert_eq!(
            events,
            vec![WorkerEvent::Shutdown {
                source_id: "a".into(),
                reason: "end of stream".into(),
                final_state: PipelineState::Stopped,
            }]
        );
    }

    #[test]
    fn stop_command_and_eof_cancel() {
        let token = StopToken::new();
        read_commands(Cursor::new("garbage\n{\"command\":\"stop\"}\n"), token.clone());
        assert!(token.is_cancelled());

        let token = StopToken::new();
        read_commands(Cursor::new(""), token.clone());
        assert!(token.is_cancelled());
    }
}
