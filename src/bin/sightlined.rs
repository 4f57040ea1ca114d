//! sightlined - multi-source video analysis daemon
//!
//! This daemon:
//! 1. Loads the source list and pipeline settings (TOML + env)
//! 2. Starts one pipeline per source, as threads or worker processes
//! 3. Publishes per-source state to the dashboard or log
//! 4. Optionally serves the state over HTTP
//! 5. Shuts everything down within the grace period on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sightline::{
    api::ApiServer,
    publish::{JsonLinesSink, Publisher, Sink},
    ui, DefaultOpener, SightlineConfig, StateRegistry, Supervisor, WorkerMode,
};

const PUBLISH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML config file.
    #[arg(long, env = "SIGHTLINE_CONFIG")]
    config: Option<PathBuf>,
    /// Host pipelines as threads or worker processes.
    #[arg(long, value_name = "thread|process")]
    mode: Option<WorkerMode>,
    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
    /// Serve the HTTP state API on this address.
    #[arg(long, value_name = "ADDR")]
    api: Option<String>,
    /// Also write every update as a JSON line on stdout.
    #[arg(long)]
    json: bool,
    /// Stop after this many seconds.
    #[arg(long)]
    seconds: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let mut config = {
        let _stage = ui.stage("Load configuration");
        SightlineConfig::load_from(args.config.as_deref())?
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(addr) = args.api {
        config.api.addr = addr;
        config.api.enabled = true;
    }
    let settings = config.pipeline.clone();
    let api_settings = config.api.clone();
    let sources = config.sources.clone();
    log::info!(
        "sightlined {} starting {} sources in {:?} mode",
        env!("CARGO_PKG_VERSION"),
        sources.len(),
        config.mode
    );

    let registry = Arc::new(StateRegistry::with_jpeg_quality(settings.jpeg_quality));
    let mut supervisor = Supervisor::new(config, Arc::new(DefaultOpener), registry.clone());
    {
        let _stage = ui.stage("Start sources");
        supervisor.start()?;
    }

    let api_handle = if api_settings.enabled {
        Some(
            ApiServer::new(api_settings, registry.clone(), &sources)
                .with_liveness_window(settings.liveness_window)
                .spawn()?,
        )
    } else {
        None
    };

    let mut sinks: Vec<Box<dyn Sink>> = vec![ui.sink()];
    if args.json {
        sinks.push(Box::new(JsonLinesSink::new(std::io::stdout())));
    }
    let publisher = Publisher::spawn(registry.clone(), sinks, PUBLISH_INTERVAL)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let started = Instant::now();
    let limit = args.seconds.map(Duration::from_secs);
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            log::info!("run limit reached");
            break;
        }
        if api_handle.is_none() && supervisor.all_finished() {
            log::info!("all sources stopped");
            break;
        }
    }

    let report = {
        let _stage = ui.stage("Stop sources");
        supervisor.stop()
    };
    if !report.is_clean() {
        log::warn!(
            "forced shutdown: killed {:?}, detached {:?}",
            report.killed,
            report.detached
        );
    }
    publisher.stop()?;
    if let Some(handle) = api_handle {
        handle.stop()?;
    }
    for health in registry.health(sightline::now_secs(), settings.liveness_window) {
        log::info!(
            "[{}] final state {} after {} frames{}",
            health.source_id,
            health.state,
            health.frame_count,
            health
                .reason
                .as_deref()
                .map(|reason| format!(" ({})", reason))
                .unwrap_or_default()
        );
    }
    Ok(())
}
