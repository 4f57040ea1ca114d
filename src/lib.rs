//! Sightline
//!
//! Multi-source video pipeline: decode frames per source, run a pluggable
//! detector on them without ever blocking ingestion, and republish the latest
//! annotated frame and results to dashboards and polling clients.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> producer -> DropOldestQueue(1) -> consumer -> SharedFrameBuffer
//!                                                     |
//!                                                     v
//!                                 DropOldestQueue(results) -> Supervisor pump
//!                                                     |
//!                                                     v
//!                                 StateRegistry -> Publisher / API / dashboard
//! ```
//!
//! Each source runs independently, either as a thread pair in this process or
//! inside an isolated `sightline_worker` process that ships JPEG frames back
//! over a JSON-lines channel.
//!
//! # Module Structure
//!
//! - `rate`, `queue`, `shared`: the concurrency primitives
//! - `frame`, `detect`, `ingest`: frames, detectors and decode sources
//! - `pipeline`: producer and consumer stages for one source
//! - `messages`, `worker`, `supervisor`: worker lifecycle in both hosting modes
//! - `state`, `publish`, `ui`, `api`: aggregated state and its consumers
//! - `config`, `error`: configuration surface and typed errors

use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod messages;
pub mod pipeline;
pub mod publish;
pub mod queue;
pub mod rate;
pub mod shared;
pub mod state;
pub mod supervisor;
pub mod ui;
pub mod worker;

pub use config::{PipelineSettings, SightlineConfig, SourceSpec, WorkerMode};
pub use detect::{
    BackendRegistry, BoundingBox, Detection, DetectionResult, DetectorBackend, DetectorSpec,
};
pub use error::{QueueError, RegistryError, SourceError};
pub use frame::Frame;
pub use ingest::{DefaultOpener, FrameSource, SourceOpener};
pub use messages::{FramePacket, WorkerEvent};
pub use pipeline::{PipelineHandle, PipelineState, SourcePipeline, StopToken};
pub use queue::DropOldestQueue;
pub use rate::{FpsTracker, Pacer};
pub use shared::{SharedFrameBuffer, StatusSlot, WriteOutcome};
pub use state::{LatestFrame, Snapshot, SourceHealth, StateRegistry};
pub use supervisor::{ShutdownReport, Supervisor};

/// Wall-clock seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
