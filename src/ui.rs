use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::publish::{LogSink, Sink};
use crate::state::{LatestFrame, Snapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty)
    }

    pub fn is_pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.is_pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Sink matching this mode: live per-source lines, or log lines.
    pub fn sink(&self) -> Box<dyn Sink> {
        if self.is_pretty() {
            Box::new(Dashboard::new())
        } else {
            Box::new(LogSink)
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

/// One spinner line per source, redrawn on every update.
pub struct Dashboard {
    multi: MultiProgress,
    lines: HashMap<String, ProgressBar>,
    style: ProgressStyle,
}

impl Default for Dashboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Dashboard {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::with_template("{spinner} {prefix:>12} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        Self {
            multi: MultiProgress::with_draw_target(target),
            lines: HashMap::new(),
            style,
        }
    }

    fn line(&mut self, id: &str) -> &ProgressBar {
        let multi = &self.multi;
        let style = &self.style;
        self.lines.entry(id.to_string()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_style(style.clone());
            bar.set_prefix(id.to_string());
            bar
        })
    }
}

impl Sink for Dashboard {
    fn publish(&mut self, snap: &Snapshot, _frame: Option<&LatestFrame>) -> Result<()> {
        let message = dashboard_line(snap);
        let finished = !snap.state.is_active();
        let line = self.line(&snap.source_id);
        if finished {
            line.finish_with_message(message);
        } else {
            line.set_message(message);
            line.tick();
        }
        Ok(())
    }
}

fn dashboard_line(snap: &Snapshot) -> String {
    let mut line = format!(
        "{:<8} {:>5.1} fps video {:>5.1} fps detect {:>6.1} ms  {}",
        snap.state.as_str(),
        snap.video_fps,
        snap.detection_fps,
        snap.detector_latency_ms,
        snap.status
    );
    if let Some(reason) = &snap.shutdown_reason {
        line.push_str(&format!("  ({})", reason));
    }
    line
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
