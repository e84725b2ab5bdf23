//! The request head reader and structural parser, §4.1.
//!
//! This is a direct port of the two-phase design in
//! `original_source/proxy/async_proxy.py::get_request` (raw line framing)
//! and `original_source/proxy/request.py::Request` (structural parse): read
//! CRLF-terminated lines until a blank line, then derive method/host/port/
//! keep-alive/token from the accumulated lines.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{Error, Result};

/// Hard cap on total bytes read while framing one request head (§4.1).
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// A parsed request head, per §3's data model.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub remote_host: String,
    pub remote_port: u16,
    /// Name preserves original casing; use [`RequestHead::header`] for
    /// case-insensitive lookup.
    pub headers: Vec<(String, String)>,
    pub token: Option<String>,
    pub keep_alive: bool,
    /// The request-line and header lines exactly as received, CRLFs
    /// stripped, excluding the terminating blank line.
    pub raw_lines: Vec<String>,
}

impl RequestHead {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Re-encode the head as the byte stream that crossed the client
    /// boundary, for relay to the origin (§4.4 FORWARDING step 2). Headers
    /// are emitted verbatim, including `Proxy-Authorization` — see
    /// DESIGN.md's Open Question decisions.
    pub fn encoded_lines(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.raw_lines.iter().map(|l| l.len() + 2).sum::<usize>() + 2);
        for line in &self.raw_lines {
            buf.extend_from_slice(line.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

/// Read CRLF-terminated lines from `reader` until a blank line is reached,
/// applying §4.1's framing rules:
///
/// - a lone LF (no preceding CR) is a malformed terminator: fatal on the
///   request line, silently dropped on a header line
/// - EOF before the blank-line terminator is treated as an empty request
/// - total bytes are capped at [`MAX_HEAD_BYTES`]
///
/// Returns `Ok(None)` for an empty request (immediate EOF, or EOF before
/// the terminator); `Ok(Some(lines))` with the request-line first and any
/// header lines following, blank terminator excluded.
pub async fn read_head_lines<R>(reader: &mut R) -> Result<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut total_bytes = 0usize;
    let mut on_request_line = true;

    loop {
        let mut buf = Vec::new();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            // EOF with nothing more to read: empty request, or a head that
            // never reached its blank-line terminator. Either way, §4.1
            // treats this as empty.
            return Ok(None);
        }

        total_bytes += n;
        if total_bytes > MAX_HEAD_BYTES {
            return Err(Error::ClientMalformed(
                "request head exceeds the size cap".to_string(),
            ));
        }

        if buf.last() != Some(&b'\n') {
            // Reader hit EOF mid-line, no newline at all.
            return Ok(None);
        }
        buf.pop();
        let crlf_terminated = buf.last() == Some(&b'\r');
        if crlf_terminated {
            buf.pop();
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(s) => s.to_string(),
            Err(_) if on_request_line => {
                return Err(Error::ClientMalformed(
                    "request line is not valid UTF-8".to_string(),
                ));
            }
            Err(_) => continue, // malformed header line, dropped leniently
        };

        if on_request_line {
            if line.is_empty() {
                if crlf_terminated {
                    // Leading blank line before the request-line: routine
                    // HTTP robustness behavior (RFC 7230 §3.5). Skip it and
                    // keep waiting for the real request-line.
                    continue;
                }
                return Err(Error::ClientMalformed(
                    "request line is not CRLF-terminated".to_string(),
                ));
            }
            if !crlf_terminated {
                return Err(Error::ClientMalformed(
                    "request line is not CRLF-terminated".to_string(),
                ));
            }
            on_request_line = false;
            lines.push(line);
            continue;
        }

        if !crlf_terminated {
            continue; // lone LF on a header line: silently dropped
        }

        if line.is_empty() {
            return Ok(Some(lines));
        }

        lines.push(line);
    }
}

impl RequestHead {
    /// Structural parse of the lines [`read_head_lines`] returned. `lines`
    /// must have at least a request line; callers are expected to have
    /// already rejected heads with fewer than two lines per §4.4's edge
    /// case (request-line-only, no headers).
    pub fn from_lines(lines: Vec<String>) -> Result<Self> {
        let request_line = &lines[0];
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Error::ClientMalformed(format!(
                "request line must be METHOD SP TARGET SP VERSION, got {request_line:?}"
            )));
        }

        let method = parts[0].to_ascii_uppercase();
        let target = parts[1].to_string();

        let mut remote_host = None;
        let mut remote_port = 80u16;

        if method == "CONNECT" {
            let (host, port) = parse_connect_target(&target)?;
            remote_host = Some(host);
            remote_port = port;
        } else if let Some((host, port)) = parse_absolute_target(&target) {
            remote_host = Some(host);
            remote_port = port;
        }

        let headers = parse_headers(&lines[1..]);

        // The Host header overrides the target-derived host/port, except
        // for CONNECT, which never reaches this branch (§4.1).
        if method != "CONNECT" {
            if let Some(host_value) = find_header(&headers, "Host") {
                let (host, port) = parse_host_header(host_value);
                remote_host = Some(host);
                remote_port = port;
            }
        }

        let remote_host = remote_host.ok_or_else(|| {
            Error::ClientMalformed("no Host header and no host in request target".to_string())
        })?;

        let token = find_header(&headers, "Proxy-Authorization").map(str::to_string);

        let keep_alive = find_header(&headers, "Connection")
            .or_else(|| find_header(&headers, "Proxy-Connection"))
            .map(|v| v.to_ascii_lowercase().contains("keep-alive"))
            .unwrap_or(false);

        Ok(RequestHead {
            method,
            target,
            remote_host,
            remote_port,
            headers,
            token,
            keep_alive,
            raw_lines: lines,
        })
    }
}

fn parse_headers(lines: &[String]) -> Vec<(String, String)> {
    let mut headers = Vec::with_capacity(lines.len());
    for line in lines {
        let Some(idx) = line.find(':') else {
            continue; // malformed header line, dropped leniently
        };
        let name = &line[..idx];
        if name.is_empty() {
            continue;
        }
        let value = line[idx + 1..].strip_prefix(' ').unwrap_or(&line[idx + 1..]);
        if value.is_empty() {
            continue;
        }
        headers.push((name.to_string(), value.to_string()));
    }
    headers
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// CONNECT targets are always `host:port`; both parts are required.
fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let (host, port_str) = target.rsplit_once(':').ok_or_else(|| {
        Error::ClientMalformed(format!("CONNECT target {target:?} has no port"))
    })?;
    if host.is_empty() {
        return Err(Error::ClientMalformed(format!(
            "CONNECT target {target:?} has no host"
        )));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| Error::ClientMalformed(format!("CONNECT target {target:?} has a bad port")))?;
    Ok((host.to_string(), port))
}

/// Parse the request-target as an absolute URI; port defaults to 80.
/// A parse failure here is not fatal on its own — the `Host` header may
/// still supply a usable host (§4.1).
fn parse_absolute_target(target: &str) -> Option<(String, u16)> {
    let url = url::Url::parse(target).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port().unwrap_or(80);
    Some((host, port))
}

/// Parse a `Host` header value as `host[:port]`, port defaulting to 80.
fn parse_host_header(value: &str) -> (String, u16) {
    match value.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (value.to_string(), 80),
        },
        None => (value.to_string(), 80),
    }
}
