//! Segment fetcher: one ranged GET streamed into a staging file.
//!
//! Resumes inside a segment by requesting `[start + bytes_written, end)` and
//! appending to the staging file. The write callback validates the response
//! shape before the first byte lands, polls the stop signal between chunks,
//! and never writes past the segment window.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::rc::Rc;
use std::str;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::digest::Hasher;
use crate::options::{DigestAlgorithm, DownloadOptions};
use crate::planner::Segment;
use crate::probe::{self, RemoteDescriptor, Validator};
use crate::retry::FetchError;

/// Successful fetch of one segment.
pub struct FetchOutcome {
    /// Per-segment digest, when one was requested.
    pub digest: Option<String>,
}

/// Per-job inputs shared by every fetch attempt.
pub struct FetchContext<'a> {
    pub url: &'a str,
    pub options: &'a DownloadOptions,
    pub remote: &'a RemoteDescriptor,
    /// Algorithm for optional per-segment digests.
    pub segment_digest: Option<DigestAlgorithm>,
    /// Set by the scheduler on cancellation or a peer's permanent failure.
    pub stop: &'a Arc<AtomicBool>,
}

/// Why the write callback refused further bytes.
enum Abort {
    Cancelled,
    Io(std::io::Error),
    RangeNotHonored,
    Http(u32),
    Overrun,
}

struct WriteState {
    headers: Vec<String>,
    /// Some(()) once the response shape was validated for body writes.
    accepted: Option<()>,
    abort: Option<Abort>,
    file: File,
    hasher: Option<Hasher>,
    new_bytes: u64,
    /// Bytes allowed into the window; `None` when the length is unknown.
    allowed: Option<u64>,
}

/// Fetch one segment into `path`. `whole_file` marks the single segment of a
/// one-segment plan, where a plain 200 from offset zero is acceptable.
pub fn fetch_segment(
    ctx: &FetchContext<'_>,
    segment: &Segment,
    path: &Path,
    whole_file: bool,
    counter: &AtomicU64,
) -> Result<FetchOutcome, FetchError> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(FetchError::Storage)?;
    let on_disk = file.metadata().map_err(FetchError::Storage)?.len();
    if on_disk != segment.bytes_written {
        return Err(FetchError::StagingInconsistent {
            journal: segment.bytes_written,
            on_disk,
        });
    }

    // Seed the digest with what a previous run already wrote.
    let mut hasher = ctx.segment_digest.map(Hasher::new);
    if let Some(h) = hasher.as_mut() {
        if on_disk > 0 {
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).map_err(FetchError::Storage)?;
                if n == 0 {
                    break;
                }
                h.update(&buf[..n]);
            }
        }
    }

    // Nothing left to fetch (includes zero-length files).
    if segment.len() == Some(segment.bytes_written) {
        counter.store(segment.bytes_written, Ordering::Relaxed);
        return Ok(FetchOutcome {
            digest: hasher.map(Hasher::finish_hex),
        });
    }

    let resume_from = segment.start + segment.bytes_written;
    let range = segment
        .range_header_value()
        .map(|v| v.trim_start_matches("bytes=").to_string());

    let mut easy = curl::easy::Easy::new();
    probe::configure(&mut easy, ctx.url, ctx.options).map_err(FetchError::Curl)?;
    // Idle-read timeout: abort when throughput stays below 1 byte/s for the
    // configured window. No whole-segment wall clock.
    easy.low_speed_limit(1).map_err(FetchError::Curl)?;
    easy.low_speed_time(ctx.options.idle_timeout)
        .map_err(FetchError::Curl)?;
    if let Some(r) = &range {
        easy.range(r).map_err(FetchError::Curl)?;
    }

    // Conditional headers pin the entity we planned against.
    let mut extra = Vec::new();
    if range.is_some() {
        match ctx.remote.validator() {
            Some(Validator::Strong(tag)) => {
                extra.push(("If-Match".to_string(), tag.to_string()));
            }
            Some(Validator::Weak(date)) => {
                extra.push(("If-Unmodified-Since".to_string(), date.to_string()));
            }
            None => {}
        }
    }
    let list = probe::header_list(&ctx.options.request_headers(), ctx.options, &extra)
        .map_err(FetchError::Curl)?;
    easy.http_headers(list).map_err(FetchError::Curl)?;

    let base_written = segment.bytes_written;
    let state = Rc::new(RefCell::new(WriteState {
        headers: Vec::new(),
        accepted: None,
        abort: None,
        file,
        hasher,
        new_bytes: 0,
        allowed: segment.remaining(),
    }));

    let perform_result = {
        let mut transfer = easy.transfer();
        {
            let state = Rc::clone(&state);
            transfer
                .header_function(move |data| {
                    if let Ok(s) = str::from_utf8(data) {
                        let line = s.trim_end();
                        let mut st = state.borrow_mut();
                        // Redirects emit several blocks; keep only the last.
                        if line.starts_with("HTTP/") {
                            st.headers.clear();
                        }
                        st.headers.push(line.to_string());
                    }
                    true
                })
                .map_err(FetchError::Curl)?;
        }
        {
            let state = Rc::clone(&state);
            let stop = Arc::clone(ctx.stop);
            transfer
                .write_function(move |data| {
                    let mut st = state.borrow_mut();
                    if st.abort.is_some() {
                        return Ok(0);
                    }
                    if stop.load(Ordering::Relaxed) {
                        st.abort = Some(Abort::Cancelled);
                        return Ok(0);
                    }
                    if st.accepted.is_none() {
                        match validate_response(&st.headers, resume_from, segment, whole_file) {
                            Ok(()) => st.accepted = Some(()),
                            Err(abort) => {
                                st.abort = Some(abort);
                                return Ok(0);
                            }
                        }
                    }
                    if let Some(allowed) = st.allowed {
                        if st.new_bytes + data.len() as u64 > allowed {
                            st.abort = Some(Abort::Overrun);
                            return Ok(0);
                        }
                    }
                    if let Err(e) = st.file.write_all(data) {
                        st.abort = Some(Abort::Io(e));
                        return Ok(0);
                    }
                    if let Some(h) = st.hasher.as_mut() {
                        h.update(data);
                    }
                    st.new_bytes += data.len() as u64;
                    counter.store(base_written + st.new_bytes, Ordering::Relaxed);
                    Ok(data.len())
                })
                .map_err(FetchError::Curl)?;
        }
        transfer.perform()
    };

    let state = Rc::try_unwrap(state)
        .unwrap_or_else(|_| unreachable!("transfer closures dropped with the transfer"))
        .into_inner();

    if let Some(abort) = state.abort {
        return Err(match abort {
            Abort::Cancelled => FetchError::Cancelled,
            Abort::Io(e) => FetchError::Storage(e),
            Abort::RangeNotHonored => FetchError::RangeNotHonored,
            Abort::Http(412) => FetchError::SourceChanged,
            Abort::Http(code) => FetchError::Http(code),
            Abort::Overrun => FetchError::Overrun {
                expected: segment.len().unwrap_or(0),
            },
        });
    }
    if let Err(e) = perform_result {
        return Err(FetchError::Curl(e));
    }

    // Bodiless error responses never enter the write callback.
    let code = easy.response_code().map_err(FetchError::Curl)?;
    if code == 412 {
        return Err(FetchError::SourceChanged);
    }
    if !(200..300).contains(&code) {
        return Err(FetchError::Http(code));
    }

    state.file.sync_all().map_err(FetchError::Storage)?;

    let total = base_written + state.new_bytes;
    if let Some(len) = segment.len() {
        if total < len {
            return Err(FetchError::PartialTransfer {
                expected: len,
                received: total,
            });
        }
    }
    counter.store(total, Ordering::Relaxed);

    Ok(FetchOutcome {
        digest: state.hasher.map(Hasher::finish_hex),
    })
}

/// Decide, from the response headers, whether body bytes may be written.
fn validate_response(
    headers: &[String],
    resume_from: u64,
    segment: &Segment,
    whole_file: bool,
) -> Result<(), Abort> {
    let status = match probe::parse_http_status(headers) {
        Some(s) => s,
        None => return Err(Abort::Http(0)),
    };
    match status {
        206 => {
            let (span_start, span_end) = match probe::parse_content_range_span(headers) {
                Some(span) => span,
                None => return Err(Abort::RangeNotHonored),
            };
            if span_start != resume_from {
                return Err(Abort::RangeNotHonored);
            }
            if let Some(end) = segment.end {
                if span_end != end.saturating_sub(1) {
                    return Err(Abort::RangeNotHonored);
                }
            }
            Ok(())
        }
        200 => {
            // A 200 restarts the body at offset zero: only acceptable when we
            // asked for exactly that and the segment is the whole file.
            if whole_file && resume_from == 0 {
                Ok(())
            } else {
                Err(Abort::RangeNotHonored)
            }
        }
        412 => Err(Abort::Http(412)),
        other => Err(Abort::Http(other)),
    }
}
