//! Minimal HTTP/1.1 server for integration tests: HEAD, ranged GET,
//! validators, and fault injection.
//!
//! Serves one static body (optionally swapping to an alternate body after N
//! requests to simulate an origin change). Understands `Range`, `If-Match`,
//! and `If-Unmodified-Since`, and can be configured to block HEAD, ignore
//! ranges, fail the first N GETs, throttle the body, or 404 everything.
//! Every response closes the connection.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RangeServerOptions {
    /// If false, HEAD returns 405 (simulates servers that block HEAD).
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// If false, omit `Accept-Ranges: bytes` even when ranges work.
    pub advertise_ranges: bool,
    /// ETag served with every response (quoted form).
    pub etag: Option<String>,
    /// Last-Modified served with every response.
    pub last_modified: Option<String>,
    /// Everything 404s (probe failure scenario).
    pub not_found: bool,
    /// The first N GETs fail with 500.
    pub fail_first_gets: usize,
    /// Sleep between body chunks (throttling for cancellation tests).
    pub chunk_delay: Duration,
    /// Body write granularity.
    pub chunk_size: usize,
    /// After this many requests, swap to the alternate entity.
    pub swap_after: Option<usize>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            advertise_ranges: true,
            etag: Some("\"v1\"".to_string()),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            not_found: false,
            fail_first_gets: 0,
            chunk_delay: Duration::ZERO,
            chunk_size: 16 * 1024,
            swap_after: None,
        }
    }
}

#[derive(Default)]
pub struct ServerStats {
    pub head_requests: AtomicUsize,
    pub get_requests: AtomicUsize,
    pub body_bytes_served: AtomicU64,
    pub precondition_failures: AtomicUsize,
}

pub struct RangeServer {
    pub url: String,
    pub stats: Arc<ServerStats>,
}

/// Alternate entity used once `swap_after` requests have been served.
#[derive(Clone)]
pub struct AltEntity {
    pub body: Vec<u8>,
    pub etag: Option<String>,
}

struct ServerState {
    body: Vec<u8>,
    alt: Option<AltEntity>,
    opts: RangeServerOptions,
    stats: Arc<ServerStats>,
    total_requests: AtomicUsize,
}

impl ServerState {
    fn entity(&self, request_no: usize) -> (&[u8], Option<&str>) {
        if let (Some(after), Some(alt)) = (self.opts.swap_after, self.alt.as_ref()) {
            if request_no > after {
                return (&alt.body, alt.etag.as_deref());
            }
        }
        (&self.body, self.opts.etag.as_deref())
    }
}

/// Start a plain range-capable server for `body`; runs until process exit.
pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, None, RangeServerOptions::default())
}

pub fn start_with_options(
    body: Vec<u8>,
    alt: Option<AltEntity>,
    opts: RangeServerOptions,
) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let stats = Arc::new(ServerStats::default());
    let state = Arc::new(ServerState {
        body,
        alt,
        opts,
        stats: Arc::clone(&stats),
        total_requests: AtomicUsize::new(0),
    });
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let state = Arc::clone(&state);
            thread::spawn(move || handle(stream, &state));
        }
    });
    RangeServer {
        url: format!("http://127.0.0.1:{}/file.bin", port),
        stats,
    }
}

fn handle(mut stream: TcpStream, state: &ServerState) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));

    let request = match read_request(&mut stream) {
        Some(r) => r,
        None => return,
    };
    let (method, headers) = match parse_request(&request) {
        Some(p) => p,
        None => return,
    };

    let request_no = state.total_requests.fetch_add(1, Ordering::SeqCst) + 1;
    let (body, etag) = state.entity(request_no);
    let total = body.len() as u64;

    if state.opts.not_found {
        let _ = write_simple(&mut stream, "404 Not Found");
        return;
    }

    if method.eq_ignore_ascii_case("HEAD") {
        state.stats.head_requests.fetch_add(1, Ordering::SeqCst);
        if !state.opts.head_allowed {
            let _ = write_simple(&mut stream, "405 Method Not Allowed");
            return;
        }
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n",
            total
        );
        push_entity_headers(&mut response, state, etag);
        response.push_str("\r\n");
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if !method.eq_ignore_ascii_case("GET") {
        let _ = write_simple(&mut stream, "405 Method Not Allowed");
        return;
    }

    let get_no = state.stats.get_requests.fetch_add(1, Ordering::SeqCst) + 1;
    if get_no <= state.opts.fail_first_gets {
        let _ = write_simple(&mut stream, "500 Internal Server Error");
        return;
    }

    // Conditional validators: a mismatch means the entity changed under the
    // client's feet.
    if let Some(wanted) = headers.get("if-match") {
        if etag.map(|t| t != wanted.trim()).unwrap_or(true) {
            state
                .stats
                .precondition_failures
                .fetch_add(1, Ordering::SeqCst);
            let _ = write_simple(&mut stream, "412 Precondition Failed");
            return;
        }
    }
    if let Some(wanted) = headers.get("if-unmodified-since") {
        let current = state.opts.last_modified.as_deref().unwrap_or("");
        if wanted.trim() != current {
            state
                .stats
                .precondition_failures
                .fetch_add(1, Ordering::SeqCst);
            let _ = write_simple(&mut stream, "412 Precondition Failed");
            return;
        }
    }

    let range = headers
        .get("range")
        .filter(|_| state.opts.support_ranges)
        .and_then(|v| parse_range(v, total));

    let (status, content_range, slice) = match range {
        Some((start, _)) if start >= total => (
            "416 Range Not Satisfiable",
            Some(format!("bytes */{}", total)),
            &body[0..0],
        ),
        Some((start, end_incl)) => {
            let end_excl = (end_incl + 1).min(total);
            (
                "206 Partial Content",
                Some(format!("bytes {}-{}/{}", start, end_excl - 1, total)),
                &body[start as usize..end_excl as usize],
            )
        }
        None => ("200 OK", None, &body[..]),
    };

    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        slice.len()
    );
    if let Some(cr) = content_range {
        response.push_str(&format!("Content-Range: {}\r\n", cr));
    }
    push_entity_headers(&mut response, state, etag);
    response.push_str("\r\n");
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    for chunk in slice.chunks(state.opts.chunk_size.max(1)) {
        if stream.write_all(chunk).is_err() {
            return;
        }
        state
            .stats
            .body_bytes_served
            .fetch_add(chunk.len() as u64, Ordering::SeqCst);
        if !state.opts.chunk_delay.is_zero() {
            thread::sleep(state.opts.chunk_delay);
        }
    }
}

fn push_entity_headers(response: &mut String, state: &ServerState, etag: Option<&str>) {
    // Advertisement is independent of actual support so tests can model
    // origins that lie about ranges.
    if state.opts.advertise_ranges {
        response.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(tag) = etag {
        response.push_str(&format!("ETag: {}\r\n", tag));
    }
    if let Some(lm) = &state.opts.last_modified {
        response.push_str(&format!("Last-Modified: {}\r\n", lm));
    }
}

fn write_simple(stream: &mut TcpStream, status: &str) -> std::io::Result<()> {
    stream.write_all(
        format!(
            "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        )
        .as_bytes(),
    )
}

fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return None;
        }
    }
    String::from_utf8(buf).ok()
}

fn parse_request(request: &str) -> Option<(String, HashMap<String, String>)> {
    let mut lines = request.split("\r\n");
    let method = lines.next()?.split_whitespace().next()?.to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Some((method, headers))
}

/// Parse "bytes=S-E" or "bytes=S-" into an inclusive span.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = if end.trim().is_empty() {
        total.saturating_sub(1)
    } else {
        end.trim().parse::<u64>().ok()?.min(total.saturating_sub(1))
    };
    Some((start, end))
}
