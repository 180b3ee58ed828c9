//! HTTP API.
//!
//! A non-blocking accept loop runs on its own thread and hands every
//! connection to a fresh thread, so slow detection requests never hold up
//! time queries or each other.

pub mod http;
pub mod multipart;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use serde_json::json;

use crate::pipeline::{DetectionPipeline, PipelineError};
use crate::status::{format_timestamp, StatusCell};
use self::http::{HttpRequest, ReadError};

const UPLOAD_PAGE: &str = include_str!("upload.html");
const IMAGE_FIELD: &str = "image";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// State shared by every request thread.
pub struct AppState {
    pub status: Arc<StatusCell>,
    pub pipeline: Arc<DetectionPipeline>,
    pub probe_cycles: Arc<AtomicU64>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Connections accepted and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting connections. Requests already being handled keep
    /// running on their own threads.
    pub fn stop(mut self) -> Result<()> {
        self.stop_accepting()
    }

    /// Stop accepting, then wait at most `grace` for in-flight requests.
    ///
    /// Returns `Ok(true)` when every request finished inside the grace period.
    pub fn drain(mut self, grace: Duration) -> Result<bool> {
        let deadline = Instant::now() + grace;
        self.stop_accepting()?;
        loop {
            let remaining = self.in_flight();
            if remaining == 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "{} request(s) still in flight after {} ms grace",
                    remaining,
                    grace.as_millis()
                );
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn stop_accepting(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Counts a connection as in flight until dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: AppState) -> Self {
        Self {
            cfg,
            state: Arc::new(state),
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let in_flight_thread = in_flight.clone();
        let cfg = self.cfg.clone();
        let state = self.state.clone();
        let join = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || {
                if let Err(err) =
                    run_api(listener, cfg, state, shutdown_thread, in_flight_thread)
                {
                    log::error!("http api stopped: {}", err);
                }
            })
            .context("spawn http accept thread")?;

        Ok(ApiHandle {
            addr,
            shutdown,
            in_flight,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    state: Arc<AppState>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                let max_body = cfg.max_body_bytes;
                let guard = InFlight::enter(&in_flight);
                let spawned = std::thread::Builder::new()
                    .name("http-conn".to_string())
                    .spawn(move || {
                        let _guard = guard;
                        if let Err(err) = handle_connection(stream, &state, max_body) {
                            log::warn!("request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("failed to spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // Transient accept failures (e.g. fd exhaustion) must not end the service.
                log::warn!("accept failed: {}", err);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, state: &AppState, max_body: usize) -> Result<()> {
    http::set_timeouts(&stream)?;

    let deadline = Instant::now() + http::REQUEST_DEADLINE;
    let request = match http::read_request(&mut stream, max_body, deadline) {
        Ok(request) => request,
        Err(ReadError::TooLarge { declared, limit }) => {
            http::write_error(&mut stream, 413, "payload_too_large")?;
            return Err(anyhow!("body of {} bytes exceeds limit {}", declared, limit));
        }
        Err(ReadError::LengthRequired) => {
            http::write_error(&mut stream, 411, "length_required")?;
            return Ok(());
        }
        Err(ReadError::Malformed(err)) => {
            http::write_error(&mut stream, 400, "bad_request")?;
            return Err(err);
        }
        Err(ReadError::TimedOut) => {
            http::write_error(&mut stream, 408, "request_timeout")?;
            return Err(anyhow!("timed out reading request"));
        }
        Err(ReadError::Io(err)) => return Err(err.into()),
    };

    route(&mut stream, &request, state)
}

fn route(stream: &mut TcpStream, request: &HttpRequest, state: &AppState) -> Result<()> {
    let allowed = match request.path.as_str() {
        "/get_current_time" | "/last_check" | "/upload" | "/health" => "GET",
        "/detect_objects" => "POST",
        _ => return http::write_error(stream, 404, "not_found"),
    };
    if request.method != allowed {
        return http::write_error(stream, 405, "method_not_allowed");
    }

    match request.path.as_str() {
        "/get_current_time" => http::write_json(stream, 200, &current_time_body(Local::now())),
        "/last_check" => {
            let body = serde_json::to_value(state.status.last_check())?;
            http::write_json(stream, 200, &body)
        }
        "/upload" => {
            http::write_response(stream, 200, "text/html; charset=utf-8", UPLOAD_PAGE.as_bytes())
        }
        "/health" => http::write_json(
            stream,
            200,
            &json!({
                "status": "ok",
                "probe_cycles": state.probe_cycles.load(Ordering::SeqCst),
            }),
        ),
        _ => detect_objects(stream, request, state),
    }
}

fn detect_objects(stream: &mut TcpStream, request: &HttpRequest, state: &AppState) -> Result<()> {
    let parts = match request.header("content-type").and_then(multipart::boundary) {
        Some(boundary) => match multipart::parse(&request.body, &boundary) {
            Ok(parts) => parts,
            Err(err) => {
                let message = format!("Malformed multipart body: {}", err);
                return http::write_error(stream, 400, &message);
            }
        },
        None => Vec::new(),
    };
    let upload = multipart::field(&parts, IMAGE_FIELD).map(|part| part.data);

    match state.pipeline.run(upload) {
        Ok(response) => {
            log::debug!("detect_objects: {} detections", response.detections.len());
            http::write_json(stream, 200, &serde_json::to_value(&response)?)
        }
        Err(err) => {
            log_pipeline_error(&err);
            http::write_error(stream, err.status(), &err.to_string())
        }
    }
}

fn log_pipeline_error(err: &PipelineError) {
    if err.is_client_error() {
        log::warn!("detect_objects rejected: {}", err);
    } else {
        log::error!("detect_objects failed: {}", err);
    }
}

/// Body of `/get_current_time` for the given instant.
pub fn current_time_body(now: DateTime<Local>) -> serde_json::Value {
    json!({
        "current_time": format_timestamp(&now),
        "timestamp": now.timestamp(),
    })
}
