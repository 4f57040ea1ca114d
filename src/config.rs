use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::detect::DetectorSpec;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8799";
const DEFAULT_SOURCE_ID: &str = "demo";
const DEFAULT_SOURCE_URI: &str = "stub://demo?width=640&height=360&fps=15";

const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 1;
const DEFAULT_RESULT_QUEUE_CAPACITY: usize = 4;
const DEFAULT_FAILURE_THRESHOLD: u32 = 25;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_RESULT_POLL_MS: u64 = 200;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
const DEFAULT_ANALYSIS_WIDTH: u32 = 640;
const DEFAULT_DISPLAY_MAX_WIDTH: u32 = 1024;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_LIVENESS_WINDOW_MS: u64 = 5_000;
const DEFAULT_STATUS_CAPACITY: usize = crate::shared::DEFAULT_STATUS_CAPACITY;
const DEFAULT_WARMUP_RUNS: u32 = 2;
const DEFAULT_SLOW_READ_WARNING_MS: u64 = 1_000;

#[derive(Debug, Deserialize, Default)]
struct SightlineConfigFile {
    mode: Option<String>,
    pipeline: Option<PipelineConfigFile>,
    sources: Option<Vec<SourceSpec>>,
    api: Option<ApiConfigFile>,
    worker: Option<WorkerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    frame_queue_capacity: Option<usize>,
    result_queue_capacity: Option<usize>,
    failure_threshold: Option<u32>,
    confidence_threshold: Option<f32>,
    frame_timeout_ms: Option<u64>,
    result_poll_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    loop_on_eof: Option<bool>,
    analysis_width: Option<u32>,
    analysis_height: Option<u32>,
    display_max_width: Option<u32>,
    jpeg_quality: Option<u8>,
    liveness_window_ms: Option<u64>,
    status_capacity: Option<usize>,
    warmup_runs: Option<u32>,
    slow_read_warning_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    enabled: Option<bool>,
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    exe: Option<PathBuf>,
}

/// How source pipelines are hosted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Producer and consumer threads inside this process.
    #[default]
    Thread,
    /// One `sightline_worker` child process per source.
    Process,
}

impl FromStr for WorkerMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "thread" | "threads" => Ok(WorkerMode::Thread),
            "process" | "processes" => Ok(WorkerMode::Process),
            other => Err(anyhow!("unknown worker mode '{}' (thread|process)", other)),
        }
    }
}

/// Every pipeline tunable, resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub frame_queue_capacity: usize,
    pub result_queue_capacity: usize,
    /// Consecutive read failures that stop a source.
    pub failure_threshold: u32,
    pub confidence_threshold: f32,
    /// Longest the consumer waits for a frame before giving up.
    pub frame_timeout: Duration,
    pub result_poll: Duration,
    pub shutdown_grace: Duration,
    pub loop_on_eof: bool,
    pub analysis_width: u32,
    pub analysis_height: Option<u32>,
    pub display_max_width: u32,
    pub jpeg_quality: u8,
    pub liveness_window: Duration,
    pub status_capacity: usize,
    pub warmup_runs: u32,
    pub slow_read_warning: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            result_queue_capacity: DEFAULT_RESULT_QUEUE_CAPACITY,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            frame_timeout: Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS),
            result_poll: Duration::from_millis(DEFAULT_RESULT_POLL_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            loop_on_eof: true,
            analysis_width: DEFAULT_ANALYSIS_WIDTH,
            analysis_height: None,
            display_max_width: DEFAULT_DISPLAY_MAX_WIDTH,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            liveness_window: Duration::from_millis(DEFAULT_LIVENESS_WINDOW_MS),
            status_capacity: DEFAULT_STATUS_CAPACITY,
            warmup_runs: DEFAULT_WARMUP_RUNS,
            slow_read_warning: Duration::from_millis(DEFAULT_SLOW_READ_WARNING_MS),
        }
    }
}

impl PipelineSettings {
    fn from_file(file: PipelineConfigFile) -> Self {
        let d = Self::default();
        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);
        Self {
            frame_queue_capacity: file.frame_queue_capacity.unwrap_or(d.frame_queue_capacity),
            result_queue_capacity: file.result_queue_capacity.unwrap_or(d.result_queue_capacity),
            failure_threshold: file.failure_threshold.unwrap_or(d.failure_threshold),
            confidence_threshold: file.confidence_threshold.unwrap_or(d.confidence_threshold),
            frame_timeout: ms(file.frame_timeout_ms, d.frame_timeout),
            result_poll: ms(file.result_poll_ms, d.result_poll),
            shutdown_grace: ms(file.shutdown_grace_ms, d.shutdown_grace),
            loop_on_eof: file.loop_on_eof.unwrap_or(d.loop_on_eof),
            analysis_width: file.analysis_width.unwrap_or(d.analysis_width),
            analysis_height: file.analysis_height.or(d.analysis_height),
            display_max_width: file.display_max_width.unwrap_or(d.display_max_width),
            jpeg_quality: file.jpeg_quality.unwrap_or(d.jpeg_quality),
            liveness_window: ms(file.liveness_window_ms, d.liveness_window),
            status_capacity: file.status_capacity.unwrap_or(d.status_capacity),
            warmup_runs: file.warmup_runs.unwrap_or(d.warmup_runs),
            slow_read_warning: ms(file.slow_read_warning_ms, d.slow_read_warning),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_queue_capacity == 0 || self.result_queue_capacity == 0 {
            bail!("queue capacities must be at least 1");
        }
        if self.failure_threshold == 0 {
            bail!("failure_threshold must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!("confidence_threshold must be within [0, 1]");
        }
        if self.frame_timeout.is_zero() || self.result_poll.is_zero() {
            bail!("frame_timeout and result_poll must be greater than zero");
        }
        if self.analysis_width == 0 || self.analysis_height == Some(0) {
            bail!("analysis dimensions must be non-zero");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("jpeg_quality must be within 1..=100");
        }
        if self.status_capacity == 0 {
            bail!("status_capacity must be at least 1");
        }
        Ok(())
    }
}

/// One configured video source. Immutable once its pipeline starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub id: String,
    /// File path, device, `rtsp://...` or `stub://...`.
    pub uri: String,
    /// Pacing rate when the decoder does not report one.
    #[serde(default)]
    pub fps: Option<f64>,
    /// Per-source override of `PipelineSettings::analysis_width`.
    #[serde(default)]
    pub analysis_width: Option<u32>,
    #[serde(default)]
    pub analysis_height: Option<u32>,
    #[serde(default)]
    pub loop_on_eof: Option<bool>,
    #[serde(default)]
    pub detector: DetectorSpec,
}

impl SourceSpec {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            fps: None,
            analysis_width: None,
            analysis_height: None,
            loop_on_eof: None,
            detector: DetectorSpec::default(),
        }
    }

    pub fn with_detector(mut self, detector: DetectorSpec) -> Self {
        self.detector = detector;
        self
    }

    /// Analysis target as `(width, fixed height)`.
    pub fn analysis_target(&self, settings: &PipelineSettings) -> (u32, Option<u32>) {
        (
            self.analysis_width.unwrap_or(settings.analysis_width),
            self.analysis_height.or(settings.analysis_height),
        )
    }

    pub fn loops_on_eof(&self, settings: &PipelineSettings) -> bool {
        self.loop_on_eof.unwrap_or(settings.loop_on_eof)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiSettings {
    pub enabled: bool,
    pub addr: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: DEFAULT_API_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SightlineConfig {
    pub mode: WorkerMode,
    pub pipeline: PipelineSettings,
    pub sources: Vec<SourceSpec>,
    pub api: ApiSettings,
    /// Worker executable for process mode; defaults to `sightline_worker`
    /// next to the running binary.
    pub worker_exe: Option<PathBuf>,
}

impl SightlineConfig {
    /// Load from `SIGHTLINE_CONFIG` (if set), apply env overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SIGHTLINE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Config holding only `sources`, everything else at defaults.
    pub fn with_sources(sources: Vec<SourceSpec>) -> Self {
        Self {
            mode: WorkerMode::default(),
            pipeline: PipelineSettings::default(),
            sources,
            api: ApiSettings::default(),
            worker_exe: None,
        }
    }

    fn from_file(file: SightlineConfigFile) -> Result<Self> {
        let mode = match file.mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => WorkerMode::default(),
        };
        let pipeline = PipelineSettings::from_file(file.pipeline.unwrap_or_default());
        let sources = file
            .sources
            .unwrap_or_else(|| vec![SourceSpec::new(DEFAULT_SOURCE_ID, DEFAULT_SOURCE_URI)]);
        let api_file = file.api.unwrap_or_default();
        let api = ApiSettings {
            enabled: api_file.enabled.unwrap_or(false),
            addr: api_file
                .addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
        };
        let worker_exe = file.worker.and_then(|worker| worker.exe);
        Ok(Self {
            mode,
            pipeline,
            sources,
            api,
            worker_exe,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("SIGHTLINE_MODE") {
            if !mode.trim().is_empty() {
                self.mode = mode.parse()?;
            }
        }
        if let Ok(addr) = std::env::var("SIGHTLINE_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
                self.api.enabled = true;
            }
        }
        if let Ok(sources) = std::env::var("SIGHTLINE_SOURCES") {
            let parsed = parse_sources(&sources)?;
            if !parsed.is_empty() {
                self.sources = parsed;
            }
        }
        if let Ok(confidence) = std::env::var("SIGHTLINE_CONFIDENCE") {
            self.pipeline.confidence_threshold = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("SIGHTLINE_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Ok(exe) = std::env::var("SIGHTLINE_WORKER_EXE") {
            if !exe.trim().is_empty() {
                self.worker_exe = Some(PathBuf::from(exe));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if self.sources.is_empty() {
            bail!("at least one source must be configured");
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            validate_source_id(&source.id)?;
            if source.uri.trim().is_empty() {
                bail!("source '{}' has an empty uri", source.id);
            }
            if !seen.insert(source.id.as_str()) {
                bail!("duplicate source id '{}'", source.id);
            }
            if source.analysis_width == Some(0) || source.analysis_height == Some(0) {
                bail!("source '{}' analysis dimensions must be non-zero", source.id);
            }
        }
        Ok(())
    }
}

/// Source ids appear in URLs and log prefixes.
pub fn validate_source_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 {
        bail!("source id must be 1..=64 characters");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        bail!("source id '{}' may only contain [A-Za-z0-9_.-]", id);
    }
    Ok(())
}

/// Parse `"id=uri,id=uri"`.
pub fn parse_sources(value: &str) -> Result<Vec<SourceSpec>> {
    split_csv(value)
        .into_iter()
        .map(|entry| {
            let (id, uri) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("source entry '{}' must look like id=uri", entry))?;
            Ok(SourceSpec::new(id.trim(), uri.trim()))
        })
        .collect()
}

fn read_config_file(path: &Path) -> Result<SightlineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = SightlineConfig::from_file(SightlineConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.pipeline.failure_threshold, 25);
        assert_eq!(cfg.pipeline.frame_queue_capacity, 1);
        assert_eq!(cfg.pipeline.frame_timeout, Duration::from_secs(15));
        assert_eq!(cfg.sources.len(), 1);
    }

    #[test]
    fn parses_source_list() {
        let sources = parse_sources("a=stub://a?fps=5&width=8, b = /videos/b.mp4").unwrap();
        assert_eq!(sources[0].id, "a");
        assert_eq!(sources[0].uri, "stub://a?fps=5&width=8");
        assert_eq!(sources[1].uri, "/videos/b.mp4");
        assert!(parse_sources("nouri").is_err());
    }

    #[test]
    fn rejects_bad_ids_and_duplicates() {
        assert!(validate_source_id("cam-1.front_2").is_ok());
        assert!(validate_source_id("cam/1").is_err());
        assert!(validate_source_id("").is_err());

        let cfg = SightlineConfig::with_sources(vec![
            SourceSpec::new("a", "stub://a"),
            SourceSpec::new("a", "stub://b"),
        ]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_mode_parses() {
        assert_eq!("Process".parse::<WorkerMode>().unwrap(), WorkerMode::Process);
        assert_eq!("thread".parse::<WorkerMode>().unwrap(), WorkerMode::Thread);
        assert!("fork".parse::<WorkerMode>().is_err());
    }
}
