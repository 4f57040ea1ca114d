//! Messages that cross a worker boundary.
//!
//! Thread-hosted pipelines push `WorkerEvent`s straight onto their result queue.
//! Process-hosted pipelines serialise the same events as JSON lines on the
//! worker's stdout, with the annotated frame carried as base64 JPEG since no
//! memory is shared across that boundary.

use serde::{Deserialize, Serialize};

use crate::config::{PipelineSettings, SourceSpec};
use crate::detect::DetectionResult;
use crate::pipeline::PipelineState;

/// One analysed frame plus the metrics measured while producing it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FramePacket {
    pub result: DetectionResult,
    /// Per-pipeline sequence number of analysed frames, starting at 1.
    pub sequence: u64,
    /// Capture time of the frame, seconds since the Unix epoch.
    pub captured_at: f64,
    /// Dimensions of the published (display) frame.
    pub width: u32,
    pub height: u32,
    /// Annotated frame, present only when frames travel inside messages.
    #[serde(default, with = "jpeg_base64", skip_serializing_if = "Option::is_none")]
    pub jpeg: Option<Vec<u8>>,
    pub video_fps: f64,
    pub detection_fps: f64,
    pub source_fps: f64,
    pub queue_delay_ms: f64,
    pub status: String,
}

impl FramePacket {
    pub fn source_id(&self) -> &str {
        &self.result.source_id
    }
}

/// Everything a pipeline reports to its supervisor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Frame(FramePacket),
    /// Sent while idle so the supervisor can tell a quiet source from a dead one.
    Heartbeat {
        source_id: String,
        timestamp: f64,
        state: PipelineState,
    },
    /// Final message of every pipeline.
    Shutdown {
        source_id: String,
        reason: String,
        final_state: PipelineState,
    },
}

impl WorkerEvent {
    pub fn source_id(&self) -> &str {
        match self {
            WorkerEvent::Frame(packet) => packet.source_id(),
            WorkerEvent::Heartbeat { source_id, .. } | WorkerEvent::Shutdown { source_id, .. } => {
                source_id
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, WorkerEvent::Shutdown { .. })
    }
}

/// Supervisor to worker process, one JSON line each.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    Stop,
}

/// First line a worker process reads: which source to run and how.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub source: SourceSpec,
    pub settings: PipelineSettings,
}

mod jpeg_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
