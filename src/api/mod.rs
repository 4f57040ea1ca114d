//! Minimal HTTP/1.1 polling surface over the state registry.
//!
//! `GET /sources`, `/state`, `/state/{id}`, `/health`, `/frame/{id}` (JPEG) and
//! `/status/{id}` (plain text). One request per connection; clients poll and
//! compare `change_seq` to skip unchanged sources.

use crate::config::{ApiSettings, SourceSpec};
use crate::error::RegistryError;
use crate::state::StateRegistry;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ApiHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, Serialize)]
struct SourceEntry {
    id: String,
    uri: String,
}

struct ApiContext {
    registry: Arc<StateRegistry>,
    sources: Vec<SourceEntry>,
    liveness_window: Duration,
}

pub struct ApiServer {
    settings: ApiSettings,
    ctx: ApiContext,
}

impl ApiServer {
    pub fn new(settings: ApiSettings, registry: Arc<StateRegistry>, sources: &[SourceSpec]) -> Self {
        let sources = sources
            .iter()
            .map(|s| SourceEntry {
                id: s.id.clone(),
                uri: s.uri.clone(),
            })
            .collect();
        Self {
            settings,
            ctx: ApiContext {
                registry,
                sources,
                liveness_window: DEFAULT_LIVENESS_WINDOW,
            },
        }
    }

    /// Window used by `/health` to decide whether a source is alive.
    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.ctx.liveness_window = window;
        self
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.settings.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = self.ctx;
        let join = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &ctx, shutdown_thread) {
                    log::error!("state api stopped: {}", err);
                }
            })?;
        log::info!("state api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: &ApiContext, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, ctx) {
                    log::warn!("state api request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    // Accepted sockets may inherit the listener's non-blocking flag.
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    let (status, content_type, body) = route(&request.path, ctx)?;
    write_response(&mut stream, status, content_type, &body)
}

type Reply = (u16, &'static str, Vec<u8>);

fn json<T: Serialize>(value: &T) -> Result<Reply> {
    Ok((200, "application/json", serde_json::to_vec(value)?))
}

fn not_found(err: RegistryError) -> Reply {
    let body = serde_json::json!({ "error": "not_found", "detail": err.to_string() });
    (404, "application/json", body.to_string().into_bytes())
}

fn route(path: &str, ctx: &ApiContext) -> Result<Reply> {
    let path = path.trim_end_matches('/');
    let (resource, id) = match path.trim_start_matches('/').split_once('/') {
        Some((resource, id)) => (resource, Some(id)),
        None => (path.trim_start_matches('/'), None),
    };
    let registry = &ctx.registry;
    match (resource, id) {
        ("sources", None) => json(&ctx.sources),
        ("state", None) => json(&registry.snapshot_all()),
        ("state", Some(id)) => match registry.snapshot(id) {
            Ok(snapshot) => json(&snapshot),
            Err(err) => Ok(not_found(err)),
        },
        ("health", None) => {
            let sources = registry.health(crate::now_secs(), ctx.liveness_window);
            let all_alive = !sources.is_empty() && sources.iter().all(|s| s.alive);
            let status = if all_alive { "ok" } else { "degraded" };
            json(&serde_json::json!({
                "status": status,
                "sources": sources,
            }))
        }
        ("frame", Some(id)) => match registry.latest_frame(id) {
            Ok(Some(frame)) => Ok((200, "image/jpeg", frame.jpeg.to_vec())),
            Ok(None) => Ok((
                404,
                "application/json",
                br#"{"error":"no_frame"}"#.to_vec(),
            )),
            Err(err) => Ok(not_found(err)),
        },
        ("status", Some(id)) => match registry.status(id) {
            Ok(text) => Ok((200, "text/plain; charset=utf-8", text.into_bytes())),
            Err(err) => Ok(not_found(err)),
        },
        _ => Ok((
            404,
            "application/json",
            br#"{"error":"not_found"}"#.to_vec(),
        )),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ApiContext {
        let registry = Arc::new(StateRegistry::new());
        registry.register_source("cam", "stub://cam");
        ApiContext {
            registry,
            sources: vec![SourceEntry {
                id: "cam".into(),
                uri: "stub://cam".into(),
            }],
            liveness_window: DEFAULT_LIVENESS_WINDOW,
        }
    }

    #[test]
    fn routes_known_and_unknown_sources() {
        let ctx = ctx();
        let (status, kind, body) = route("/sources", &ctx).unwrap();
        assert_eq!((status, kind), (200, "application/json"));
        assert_eq!(body, br#"[{"id":"cam","uri":"stub://cam"}]"#.to_vec());

        assert_eq!(route("/state/cam", &ctx).unwrap().0, 200);
        assert_eq!(route("/state/ghost", &ctx).unwrap().0, 404);
        assert_eq!(route("/status/ghost", &ctx).unwrap().0, 404);
        assert_eq!(route("/frame/cam", &ctx).unwrap().0, 404);
        assert_eq!(route("/nope", &ctx).unwrap().0, 404);
    }

    #[test]
    fn health_is_degraded_without_frames() {
        let (status, _, body) = route("/health", &ctx()).unwrap();
        assert_eq!(status, 200);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "degraded");
        assert_eq!(value["sources"][0]["alive"], false);
    }
}
