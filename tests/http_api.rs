use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use probe_detect::api::{ApiConfig, ApiHandle, ApiServer, AppState};
use probe_detect::{
    DetectionPipeline, LifecycleController, RawDetection, StatusCell, StatusSnapshot,
    StubBackend, SystemClock,
};

const BOUNDARY: &str = "----probeDetectBoundary7MA4YWxk";

struct TestApi {
    status: Arc<StatusCell>,
    stub: Arc<StubBackend>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(stub: StubBackend) -> Result<Self> {
        Self::with_limit(stub, 1024 * 1024)
    }

    fn with_limit(stub: StubBackend, max_body_bytes: usize) -> Result<Self> {
        let stub = Arc::new(stub);
        let status = Arc::new(StatusCell::new());
        let state = AppState {
            status: status.clone(),
            pipeline: Arc::new(DetectionPipeline::new(stub.clone(), 0.25)),
            probe_cycles: Arc::new(AtomicU64::new(0)),
        };
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            max_body_bytes,
        };
        let api_handle = ApiServer::new(api_config, state).spawn()?;
        Ok(Self {
            status,
            stub,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn take_handle(&mut self) -> ApiHandle {
        self.api_handle
            .take()
            .expect("test API handle should be initialized")
    }

    fn send(&self, request: &[u8]) -> Result<(String, String)> {
        send_to(self.handle().addr, request)
    }

    fn get(&self, path: &str) -> Result<(String, String)> {
        self.send(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
    }

    fn post_multipart(&self, field: &str, data: &[u8]) -> Result<(String, String)> {
        self.send(&detect_request(field, data))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn send_to(addr: SocketAddr, request: &[u8]) -> Result<(String, String)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(request)?;
    read_response(&mut stream)
}

fn detect_request(field: &str, data: &[u8]) -> Vec<u8> {
    let body = multipart_body(field, data);
    let mut request = format!(
        "POST /detect_objects HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary={BOUNDARY}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    request
}

fn wait_for(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn multipart_body(field: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"upload.png\"\r\nContent-Type: image/png\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([120, 60, 200]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .expect("encode test png");
    out.into_inner()
}

#[test]
fn get_current_time_is_non_decreasing() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let (headers, first) = api.get("/get_current_time")?;
    assert!(headers.contains("200 OK"));
    let (_, second) = api.get("/get_current_time")?;

    let first: Value = serde_json::from_str(&first)?;
    let second: Value = serde_json::from_str(&second)?;
    assert!(first["current_time"].is_string());
    let t1 = first["timestamp"].as_i64().expect("integer timestamp");
    let t2 = second["timestamp"].as_i64().expect("integer timestamp");
    assert!(t2 >= t1);

    Ok(())
}

#[test]
fn last_check_before_and_after_probe() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let (headers, body) = api.get("/last_check")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert!(value["timestamp"].is_null());
    assert!(value["second"].is_null());
    assert!(value["divisible_by_2"].is_null());

    let snapshot = StatusSnapshot::from_instant(chrono::Local::now());
    api.status.publish(snapshot.clone());

    let (_, body) = api.get("/last_check")?;
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["timestamp"], snapshot.timestamp());
    assert_eq!(value["second"], snapshot.second());
    assert_eq!(value["divisible_by_2"], snapshot.second() % 2 == 0);

    Ok(())
}

#[test]
fn detect_objects_without_image_is_client_error() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let (headers, body) = api.post_multipart("not_image", &png(4, 4))?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("No image uploaded"));

    let (headers, body) = api.send(
        b"POST /detect_objects HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
    )?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("No image uploaded"));

    assert_eq!(api.stub.calls(), 0);
    Ok(())
}

#[test]
fn detect_objects_with_corrupt_image_is_decode_error() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let (headers, body) = api.post_multipart("image", b"GIF? no, just text")?;
    assert!(headers.contains("400 Bad Request"));
    let value: Value = serde_json::from_str(&body)?;
    let message = value["error"].as_str().expect("error message");
    assert!(message.starts_with("Invalid image"));
    assert_ne!(message, "No image uploaded");
    assert_eq!(api.stub.calls(), 0);

    Ok(())
}

#[test]
fn detect_objects_returns_detections_and_image() -> Result<()> {
    let stub = StubBackend::new().with_script(vec![
        RawDetection::new(0, 0.91, [10.0, 12.0, 30.0, 40.0]),
        RawDetection::new(16, 0.1, [0.0, 0.0, 5.0, 5.0]),
        RawDetection::new(2, 0.55, [1.0, 2.0, 3.0, 4.0]),
    ]);
    let api = TestApi::new(stub)?;

    let (headers, body) = api.post_multipart("image", &png(48, 32))?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;

    let detections = value["detections"].as_array().expect("detections array");
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0]["class_id"], 0);
    assert_eq!(detections[0]["class_name"], "person");
    assert_eq!(detections[0]["bbox"]["x1"], 10.0);
    assert_eq!(detections[0]["bbox"]["y2"], 40.0);
    assert_eq!(detections[1]["class_name"], "car");
    for det in detections {
        let conf = det["confidence"].as_f64().expect("confidence");
        assert!((0.0..=1.0).contains(&conf));
    }

    let jpeg = B64.decode(value["image_base64"].as_str().expect("image_base64"))?;
    let decoded = image::load_from_memory(&jpeg)?;
    assert_eq!((decoded.width(), decoded.height()), (48, 32));
    assert_eq!(api.stub.calls(), 1);

    Ok(())
}

#[test]
fn detector_failure_is_server_error_and_contained() -> Result<()> {
    let api = TestApi::new(StubBackend::new().failing("inference backend offline"))?;

    let (headers, body) = api.post_multipart("image", &png(8, 8))?;
    assert!(headers.contains("500 Internal Server Error"));
    assert!(body.contains("inference backend offline"));

    // The service keeps answering afterwards.
    let (headers, _) = api.get("/get_current_time")?;
    assert!(headers.contains("200 OK"));

    Ok(())
}

#[test]
fn detection_requests_run_concurrently() -> Result<()> {
    let latency = Duration::from_millis(200);
    let workers_count = 6;
    let api = Arc::new(TestApi::new(
        StubBackend::new()
            .with_latency(latency)
            .with_script(vec![RawDetection::new(0, 0.8, [0.0, 0.0, 2.0, 2.0])]),
    )?);
    let image = Arc::new(png(16, 16));

    let started = Instant::now();
    let workers: Vec<_> = (0..workers_count)
        .map(|_| {
            let api = api.clone();
            let image = image.clone();
            std::thread::spawn(move || api.post_multipart("image", &image))
        })
        .collect();
    for worker in workers {
        let (headers, body) = worker.join().expect("worker panicked")?;
        assert!(headers.contains("200 OK"));
        assert!(body.contains("\"person\""));
    }
    let elapsed = started.elapsed();

    assert_eq!(api.stub.calls(), workers_count);
    // One at a time would take workers_count * latency (1.2 s).
    assert!(
        elapsed < latency * 3,
        "{} detections took {:?}",
        workers_count,
        elapsed
    );

    Ok(())
}

#[test]
fn slow_detection_does_not_block_time_queries() -> Result<()> {
    let api = TestApi::new(StubBackend::new().with_latency(Duration::from_secs(1)))?;
    let addr = api.handle().addr;
    let request = detect_request("image", &png(8, 8));
    let detection = std::thread::spawn(move || send_to(addr, &request));

    assert!(wait_for(|| api.stub.calls() == 1, Duration::from_secs(2)));

    let started = Instant::now();
    let (headers, body) = api.get("/get_current_time")?;
    assert!(headers.contains("200 OK"));
    assert!(body.contains("current_time"));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!detection.is_finished());

    let (headers, _) = detection.join().expect("detection client panicked")?;
    assert!(headers.contains("200 OK"));
    Ok(())
}

#[test]
fn shutdown_grace_lets_in_flight_detection_finish() -> Result<()> {
    let mut api = TestApi::new(StubBackend::new().with_latency(Duration::from_millis(150)))?;
    let status = api.status.clone();
    let lifecycle = LifecycleController::new(Duration::from_secs(3600));
    lifecycle.start(Arc::new(SystemClock), status)?;

    let addr = api.handle().addr;
    let request = detect_request("image", &png(8, 8));
    let sent = Instant::now();
    let detection = std::thread::spawn(move || send_to(addr, &request));
    assert!(wait_for(|| api.stub.calls() == 1, Duration::from_secs(2)));
    assert_eq!(api.handle().in_flight(), 1);

    // Same sequence as the daemon: probe first, then drain what is left.
    let grace = Duration::from_millis(500);
    let report = lifecycle.shutdown(grace)?;
    assert!(report.probe_confirmed);
    let drained = api.take_handle().drain(grace.saturating_sub(report.waited))?;
    assert!(drained);
    // The sequence waited out the detector instead of returning right away.
    assert!(sent.elapsed() >= Duration::from_millis(150));

    let (headers, body) = detection.join().expect("detection client panicked")?;
    assert!(headers.contains("200 OK"));
    assert!(body.contains("image_base64"));
    Ok(())
}

#[test]
fn drain_gives_up_after_grace() -> Result<()> {
    let mut api = TestApi::new(StubBackend::new().with_latency(Duration::from_secs(2)))?;
    let addr = api.handle().addr;
    let request = detect_request("image", &png(8, 8));
    let detection = std::thread::spawn(move || send_to(addr, &request));
    assert!(wait_for(|| api.stub.calls() == 1, Duration::from_secs(2)));

    let started = Instant::now();
    let drained = api.take_handle().drain(Duration::from_millis(100))?;
    assert!(!drained);
    assert!(started.elapsed() < Duration::from_secs(1));

    // Stopping the listener does not cut off the request itself.
    let (headers, _) = detection.join().expect("detection client panicked")?;
    assert!(headers.contains("200 OK"));
    Ok(())
}

#[test]
fn upload_page_is_html() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;
    let (headers, body) = api.get("/upload")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("text/html"));
    assert!(body.contains("<form"));
    Ok(())
}

#[test]
fn unknown_routes_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let (headers, body) = api.get("/nope")?;
    assert!(headers.contains("404 Not Found"));
    assert!(body.contains(r#""error":"not_found""#));

    let (headers, _) = api.get("/detect_objects")?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = api.send(b"DELETE /last_check HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("405 Method Not Allowed"));

    Ok(())
}

#[test]
fn oversized_upload_is_rejected() -> Result<()> {
    let api = TestApi::with_limit(StubBackend::new(), 64)?;
    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.write_all(
        b"POST /detect_objects HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100000\r\n\r\n",
    )?;
    let (headers, body) = read_response(&mut stream)?;
    assert!(headers.contains("413 Payload Too Large"));
    assert!(body.contains("payload_too_large"));
    assert_eq!(api.stub.calls(), 0);
    Ok(())
}

#[test]
fn health_reports_ok() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;
    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["status"], "ok");
    assert_eq!(value["probe_cycles"], 0);
    Ok(())
}
