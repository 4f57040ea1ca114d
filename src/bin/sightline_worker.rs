//! sightline_worker - one isolated source pipeline
//!
//! Spawned by `sightlined` in process mode. Reads a `WorkerAssignment` JSON line
//! on stdin, writes `WorkerEvent` JSON lines on stdout, logs to stderr. Exits
//! after a `stop` command, on stdin EOF, or when the pipeline stops itself.

use anyhow::Result;
use std::io::{self, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sightline::{worker::run_worker_until, BackendRegistry, DefaultOpener};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    // SIGINT/SIGTERM stop the pipeline the same way a `stop` line does, so the
    // shutdown notice still goes out.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::Release))
        .expect("error setting Ctrl-C handler");

    let input = BufReader::new(io::stdin());
    let output = io::stdout().lock();
    run_worker_until(
        input,
        output,
        Arc::new(DefaultOpener),
        &BackendRegistry::with_builtins(),
        interrupted,
    )
}
