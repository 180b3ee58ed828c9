//! Minimal HTTP/1.1 request reader and response writer.
//!
//! One request per connection; every response closes the connection.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on receiving one whole request, headers and body.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// Why a request could not be read. Each maps to an error response.
#[derive(Debug)]
pub enum ReadError {
    Malformed(anyhow::Error),
    LengthRequired,
    TooLarge { declared: usize, limit: usize },
    TimedOut,
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ReadError::TimedOut,
            _ => ReadError::Io(err),
        }
    }
}

/// Read a full request, including a `Content-Length` body of at most
/// `max_body` bytes. Answers `Expect: 100-continue` before reading the body.
///
/// Fails with `TimedOut` once `deadline` passes, however steadily the peer
/// keeps sending.
pub fn read_request<S: Read + Write>(
    stream: &mut S,
    max_body: usize,
    deadline: Instant,
) -> std::result::Result<HttpRequest, ReadError> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if Instant::now() >= deadline {
            return Err(ReadError::TimedOut);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Malformed(anyhow!("connection closed before headers")));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = find(&data, b"\r\n\r\n", 0) {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(ReadError::Malformed(anyhow!("request headers too large")));
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let (method, path, headers) = parse_head(&head).map_err(ReadError::Malformed)?;
    let mut body = data.split_off(header_end + 4);

    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_lowercase().contains("chunked"));
    let declared = match headers.get("content-length") {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| ReadError::Malformed(anyhow!("invalid content-length")))?,
        None if chunked => return Err(ReadError::LengthRequired),
        None => 0,
    };
    if declared > max_body {
        return Err(ReadError::TooLarge {
            declared,
            limit: max_body,
        });
    }

    if declared > body.len()
        && headers
            .get("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        stream.flush()?;
    }

    while body.len() < declared {
        if Instant::now() >= deadline {
            return Err(ReadError::TimedOut);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Malformed(anyhow!(
                "body truncated: expected {} bytes, received {}",
                declared,
                body.len()
            )));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(declared);

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

fn parse_head(head: &str) -> Result<(String, String, HashMap<String, String>)> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok((method.to_uppercase(), path, headers))
}

pub fn set_timeouts(stream: &std::net::TcpStream) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(READ_TIMEOUT))
}

pub fn write_json<W: Write>(stream: &mut W, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

pub fn write_error<W: Write>(stream: &mut W, status: u16, message: &str) -> Result<()> {
    write_json(stream, status, &serde_json::json!({ "error": message }))
}

pub fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status = status,
        reason = reason_phrase(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

/// Position of `needle` in `haystack` at or after `from`.
pub(crate) fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
