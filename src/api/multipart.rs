//! `multipart/form-data` body parsing (RFC 7578), enough for file uploads.

use anyhow::{anyhow, Result};

use super::http::find;

/// One form part. `data` borrows from the request body.
#[derive(Debug, PartialEq, Eq)]
pub struct Part<'a> {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: &'a [u8],
}

/// Extract the boundary from a `multipart/form-data` content type.
pub fn boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

pub fn parse<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<Part<'a>>> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut close = b"\r\n".to_vec();
    close.extend_from_slice(&delimiter);

    let mut pos = find(body, &delimiter, 0)
        .ok_or_else(|| anyhow!("multipart boundary not found"))?
        + delimiter.len();
    let mut parts = Vec::new();
    loop {
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        // Skip transport padding and the CRLF after the delimiter.
        let line_end = find(body, b"\r\n", pos)
            .ok_or_else(|| anyhow!("multipart delimiter line not terminated"))?;
        let headers_start = line_end + 2;
        let headers_end = if body[headers_start..].starts_with(b"\r\n") {
            headers_start
        } else {
            find(body, b"\r\n\r\n", headers_start)
                .ok_or_else(|| anyhow!("multipart part headers not terminated"))?
        };
        let data_start = if headers_end == headers_start {
            headers_start + 2
        } else {
            headers_end + 4
        };
        let data_end = find(body, &close, data_start)
            .ok_or_else(|| anyhow!("multipart part not terminated"))?;

        let head = String::from_utf8_lossy(&body[headers_start..headers_end]);
        parts.push(part_from_headers(&head, &body[data_start..data_end]));
        pos = data_end + close.len();
    }
}

fn part_from_headers<'a>(head: &str, data: &'a [u8]) -> Part<'a> {
    let mut part = Part {
        name: None,
        filename: None,
        content_type: None,
        data,
    };
    for line in head.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').skip(1) {
                if let Some((k, v)) = param.split_once('=') {
                    let v = v.trim().trim_matches('"').to_string();
                    match k.trim().to_lowercase().as_str() {
                        "name" => part.name = Some(v),
                        "filename" => part.filename = Some(v),
                        _ => {}
                    }
                }
            }
        } else if key.eq_ignore_ascii_case("content-type") {
            part.content_type = Some(value.trim().to_string());
        }
    }
    part
}

/// First part with the given form field name.
pub fn field<'p, 'a>(parts: &'p [Part<'a>], name: &str) -> Option<&'p Part<'a>> {
    parts.iter().find(|p| p.name.as_deref() == Some(name))
}
