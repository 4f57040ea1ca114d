mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::wait_until;
use sightline::api::ApiServer;
use sightline::config::ApiSettings;
use sightline::publish::{publish_once, JsonLinesSink, Sink, Subscription};
use sightline::{
    BackendRegistry, BoundingBox, DefaultOpener, Detection, DetectorBackend, DetectorSpec, Frame,
    PipelineState, SightlineConfig, SourceSpec, StateRegistry, Supervisor, WorkerMode,
};

fn fixed_cat() -> DetectorSpec {
    DetectorSpec::Fixed {
        label: "cat".into(),
        confidence: 0.9,
        bbox: BoundingBox::new(4.0, 4.0, 20.0, 20.0),
    }
}

fn stub_config(mode: WorkerMode) -> SightlineConfig {
    let mut config = SightlineConfig::with_sources(vec![
        SourceSpec::new("cam1", "stub://cam1?width=64&height=48&fps=10&frames=10")
            .with_detector(fixed_cat()),
    ]);
    config.mode = mode;
    config.pipeline = common::test_settings();
    config.pipeline.analysis_width = 32;
    config
}

fn http_get(addr: std::net::SocketAddr, path: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    write!(stream, "GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response header");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    (head, raw[split + 4..].to_vec())
}

#[test]
fn looping_stub_source_publishes_annotated_frames() {
    let registry = Arc::new(StateRegistry::new());
    let mut supervisor = Supervisor::new(
        stub_config(WorkerMode::Thread),
        Arc::new(DefaultOpener),
        registry.clone(),
    );
    let started = Instant::now();
    supervisor.start().unwrap();

    // 1.5 s at 10 fps, looping back over the ten-frame clip once.
    std::thread::sleep(Duration::from_millis(1500).saturating_sub(started.elapsed()));
    let snap = registry.snapshot("cam1").unwrap();
    assert!(
        (10..=15).contains(&snap.frame_count),
        "frame_count {}",
        snap.frame_count
    );
    assert_eq!(snap.state, PipelineState::Running);
    assert!(snap.video_fps > 0.0);
    assert!(snap.detection_fps > 0.0);
    assert_eq!(snap.source_fps, 10.0);
    assert_eq!((snap.width, snap.height), (64, 48));
    assert_eq!(snap.detections.len(), 1);
    // Boxes come back in display coordinates (analysis ran at half size).
    assert_eq!(snap.detections[0].bbox, BoundingBox::new(8.0, 8.0, 40.0, 40.0));

    let frame = registry.latest_frame("cam1").unwrap().unwrap();
    assert_eq!(&frame.jpeg[..2], &[0xFF, 0xD8]);

    let mut sub = Subscription::new();
    let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(JsonLinesSink::new(Vec::new()))];
    assert_eq!(publish_once(&registry, &mut sub, &mut sinks), 1);

    let report = supervisor.stop();
    assert_eq!(report.stopped, vec!["cam1".to_string()]);
    assert!(report.elapsed < Duration::from_secs(2));
    let snap = registry.snapshot("cam1").unwrap();
    assert_eq!(snap.state, PipelineState::Stopped);
    assert_eq!(snap.shutdown_reason.as_deref(), Some("stop requested"));
}

/// Reports a confident cat and a doubtful dog on every frame.
struct CatAndMaybeDog;

impl DetectorBackend for CatAndMaybeDog {
    fn name(&self) -> &str {
        "cat_and_maybe_dog"
    }

    fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        Ok(vec![
            Detection::new("cat", 0.9, BoundingBox::new(2.0, 2.0, 10.0, 10.0)),
            Detection::new("dog", 0.2, BoundingBox::new(12.0, 2.0, 20.0, 10.0)),
        ])
    }
}

#[test]
fn low_confidence_detections_are_never_published() {
    let mut backends = BackendRegistry::new();
    backends.register("cat_and_maybe_dog", || Ok(Box::new(CatAndMaybeDog)));
    let mut config = stub_config(WorkerMode::Thread);
    config.sources[0].detector = DetectorSpec::Custom {
        name: "cat_and_maybe_dog".into(),
    };
    let registry = Arc::new(StateRegistry::new());
    let mut supervisor =
        Supervisor::new(config, Arc::new(DefaultOpener), registry.clone()).with_backends(backends);
    supervisor.start().unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        registry.snapshot("cam1").unwrap().frame_count >= 2
    }));
    let snap = registry.snapshot("cam1").unwrap();
    let categories: Vec<&str> = snap.detections.iter().map(|d| d.category.as_str()).collect();
    assert_eq!(categories, vec!["cat"]);
    assert_eq!(snap.status, "cam1 can see [cat]");
    assert_eq!(registry.status("cam1").unwrap(), "cam1 can see [cat]");

    assert!(supervisor.stop().is_clean());
}

#[test]
fn portrait_source_publishes_frames_in_thread_mode() {
    let mut config = SightlineConfig::with_sources(vec![SourceSpec::new(
        "tall",
        "stub://tall?width=48&height=96&fps=20",
    )]);
    config.pipeline = common::test_settings();
    config.pipeline.display_max_width = 64;
    let registry = Arc::new(StateRegistry::new());
    let mut supervisor = Supervisor::new(config, Arc::new(DefaultOpener), registry.clone());
    supervisor.start().unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        registry.snapshot("tall").unwrap().frame_count >= 3
    }));
    let snap = registry.snapshot("tall").unwrap();
    assert!(snap.has_frame);
    assert_eq!((snap.width, snap.height), (32, 64));
    let frame = registry.latest_frame("tall").unwrap().expect("published frame");
    assert_eq!((frame.width, frame.height), (32, 64));

    assert!(supervisor.stop().is_clean());
}

#[test]
fn api_serves_registry_over_http() {
    let registry = Arc::new(StateRegistry::new());
    let config = stub_config(WorkerMode::Thread);
    let sources = config.sources.clone();
    let mut supervisor = Supervisor::new(config, Arc::new(DefaultOpener), registry.clone());
    supervisor.start().unwrap();
    let api = ApiServer::new(
        ApiSettings {
            enabled: true,
            addr: "127.0.0.1:0".into(),
        },
        registry.clone(),
        &sources,
    )
    .spawn()
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        registry.snapshot("cam1").unwrap().frame_count > 0
    }));

    let (head, body) = http_get(api.addr, "/sources");
    assert!(head.starts_with("HTTP/1.1 200"));
    let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed[0]["id"], "cam1");

    let (head, body) = http_get(api.addr, "/state/cam1");
    assert!(head.starts_with("HTTP/1.1 200"));
    let state: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["source_id"], "cam1");
    assert!(state["frame_count"].as_u64().unwrap() > 0);

    let (head, body) = http_get(api.addr, "/frame/cam1");
    assert!(head.contains("Content-Type: image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    let (_, body) = http_get(api.addr, "/status/cam1");
    assert_eq!(String::from_utf8(body).unwrap(), "cam1 can see [cat]");

    let (head, _) = http_get(api.addr, "/state/ghost");
    assert!(head.starts_with("HTTP/1.1 404"));

    let (_, body) = http_get(api.addr, "/health");
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");

    api.stop().unwrap();
    assert!(supervisor.stop().is_clean());
}

#[test]
fn process_workers_stream_frames_and_stop_cleanly() {
    let mut config = stub_config(WorkerMode::Process);
    config.worker_exe = Some(PathBuf::from(env!("CARGO_BIN_EXE_sightline_worker")));
    config.sources.push(SourceSpec::new(
        "dead",
        "stub://dead?refuse=true",
    ));
    let registry = Arc::new(StateRegistry::new());
    let mut supervisor = Supervisor::new(config, Arc::new(DefaultOpener), registry.clone());
    supervisor.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        registry.snapshot("cam1").unwrap().frame_count >= 3
    }));
    let snap = registry.snapshot("cam1").unwrap();
    assert_eq!(snap.detections[0].category, "cat");
    let frame = registry.latest_frame("cam1").unwrap().unwrap();
    assert_eq!((frame.width, frame.height), (64, 48));
    assert_eq!(&frame.jpeg[..2], &[0xFF, 0xD8]);

    assert!(wait_until(Duration::from_secs(3), || {
        registry.snapshot("dead").unwrap().state == PipelineState::Stopped
    }));
    assert!(registry.snapshot("cam1").unwrap().state.is_active());

    let report = supervisor.stop();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.stopped.len(), 2);
    assert_eq!(
        registry.snapshot("cam1").unwrap().state,
        PipelineState::Stopped
    );
}
