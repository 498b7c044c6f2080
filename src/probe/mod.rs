//! Transport probe: one metadata exchange before planning.
//!
//! Prefers HEAD; when the origin blocks HEAD or withholds the length, falls
//! back to `GET` with `Range: bytes=0-0` and reads `Content-Range`. The probe
//! never writes to disk; any response body is discarded.

mod parse;

pub(crate) use parse::{parse_content_range_span, parse_http_status};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str;
use std::time::Duration;

use crate::error::{DownloadError, ErrorKind};
use crate::options::{Auth, DownloadOptions};

/// Immutable facts learned about the remote resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDescriptor {
    /// Total byte length, if the origin declared one.
    pub total_size: Option<u64>,
    /// True if ranged requests are supported (advertised or observed via 206).
    pub accept_ranges: bool,
    /// `ETag` verbatim as received (strong validator, preferred).
    pub etag: Option<String>,
    /// `Last-Modified` verbatim (weak validator).
    pub last_modified: Option<String>,
    /// Declared content type, if any.
    pub content_type: Option<String>,
}

impl RemoteDescriptor {
    /// Strong validator if present and strong, else the weak one.
    pub fn validator(&self) -> Option<Validator<'_>> {
        match &self.etag {
            Some(tag) if !tag.starts_with("W/") => Some(Validator::Strong(tag)),
            _ => self.last_modified.as_deref().map(Validator::Weak),
        }
    }

    /// Whether a descriptor recorded in a journal still denotes the same
    /// entity as the live one. Any divergence in ETag, Last-Modified, or
    /// size counts as a source change.
    pub fn same_entity(&self, live: &RemoteDescriptor) -> bool {
        self.etag == live.etag
            && self.last_modified == live.last_modified
            && self.total_size == live.total_size
    }
}

/// Validator to send on resumed requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validator<'a> {
    /// Sent as `If-Match`.
    Strong(&'a str),
    /// Sent as `If-Unmodified-Since`.
    Weak(&'a str),
}

/// Probe timeout beyond connect; metadata exchanges are tiny.
const PROBE_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: u32 = 10;

pub(crate) fn configure(
    easy: &mut curl::easy::Easy,
    url: &str,
    options: &DownloadOptions,
) -> Result<(), curl::Error> {
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.max_redirections(MAX_REDIRECTS)?;
    easy.connect_timeout(options.connect_timeout)?;
    easy.ssl_verify_peer(options.tls_verify)?;
    easy.ssl_verify_host(options.tls_verify)?;
    match &options.auth {
        Some(Auth::Basic { username, password }) => {
            easy.username(username)?;
            easy.password(password)?;
        }
        Some(Auth::Bearer(_)) | None => {}
    }
    Ok(())
}

pub(crate) fn header_list(
    headers: &HashMap<String, String>,
    options: &DownloadOptions,
    extra: &[(String, String)],
) -> Result<curl::easy::List, curl::Error> {
    let mut list = curl::easy::List::new();
    for (k, v) in headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
    }
    if let Some(Auth::Bearer(token)) = &options.auth {
        list.append(&format!("Authorization: Bearer {}", token))?;
    }
    for (k, v) in extra {
        list.append(&format!("{}: {}", k, v))?;
    }
    Ok(list)
}

fn curl_error(e: curl::Error, what: &str) -> DownloadError {
    let kind = if e.is_operation_timedout() {
        ErrorKind::Timeout
    } else if e.is_ssl_connect_error() || e.is_peer_failed_verification() || e.is_ssl_cacert() {
        ErrorKind::TlsFailure
    } else {
        ErrorKind::Unreachable
    };
    DownloadError::new(kind, anyhow::Error::new(e).context(format!("{} failed", what)))
}

fn status_error(code: u32, url: &str) -> DownloadError {
    let kind = match code {
        401 | 407 => ErrorKind::AuthRequired,
        403 => ErrorKind::Forbidden,
        404 | 410 => ErrorKind::NotFound,
        _ => ErrorKind::Unreachable,
    };
    DownloadError::msg(kind, format!("probe of {} returned HTTP {}", url, code))
}

/// One HEAD request. Redirect-safe: on redirects curl emits several header
/// blocks; only the final block is kept.
pub fn probe(url: &str, options: &DownloadOptions) -> Result<RemoteDescriptor, DownloadError> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    configure(&mut easy, url, options).map_err(|e| curl_error(e, "probe setup"))?;
    easy.nobody(true).map_err(|e| curl_error(e, "probe setup"))?;
    easy.timeout(PROBE_TOTAL_TIMEOUT)
        .map_err(|e| curl_error(e, "probe setup"))?;
    let list = header_list(&options.request_headers(), options, &[])
        .map_err(|e| curl_error(e, "probe setup"))?;
    easy.http_headers(list)
        .map_err(|e| curl_error(e, "probe setup"))?;

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    let line = s.trim_end();
                    if line.starts_with("HTTP/") {
                        headers.clear();
                    }
                    headers.push(line.to_string());
                }
                true
            })
            .map_err(|e| curl_error(e, "probe setup"))?;
        transfer
            .perform()
            .map_err(|e| curl_error(e, "HEAD request"))?;
    }

    let code = easy
        .response_code()
        .map_err(|e| curl_error(e, "HEAD request"))?;
    if !(200..300).contains(&code) {
        return Err(status_error(code, url));
    }

    Ok(parse::parse_headers(&headers))
}

/// Metadata probe via `GET` with `Range: bytes=0-0`; the one-byte body is
/// discarded. A 206 marks the origin range-capable even when `Accept-Ranges`
/// is missing, and `Content-Range` supplies the total.
pub fn probe_range0(
    url: &str,
    options: &DownloadOptions,
) -> Result<RemoteDescriptor, DownloadError> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    configure(&mut easy, url, options).map_err(|e| curl_error(e, "probe setup"))?;
    easy.timeout(PROBE_TOTAL_TIMEOUT)
        .map_err(|e| curl_error(e, "probe setup"))?;
    easy.range("0-0").map_err(|e| curl_error(e, "probe setup"))?;
    let list = header_list(&options.request_headers(), options, &[])
        .map_err(|e| curl_error(e, "probe setup"))?;
    easy.http_headers(list)
        .map_err(|e| curl_error(e, "probe setup"))?;

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    let line = s.trim_end();
                    if line.starts_with("HTTP/") {
                        headers.clear();
                    }
                    headers.push(line.to_string());
                }
                true
            })
            .map_err(|e| curl_error(e, "probe setup"))?;
        transfer
            .write_function(|data| Ok(data.len()))
            .map_err(|e| curl_error(e, "probe setup"))?;
        transfer
            .perform()
            .map_err(|e| curl_error(e, "range probe"))?;
    }

    let code = easy
        .response_code()
        .map_err(|e| curl_error(e, "range probe"))?;
    if !(200..300).contains(&code) {
        return Err(status_error(code, url));
    }

    let mut r = parse::parse_headers(&headers);
    if code == 206 {
        r.accept_ranges = true;
        for line in &headers {
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-range") {
                    if let Some(total) = parse::parse_content_range_total(value.trim()) {
                        r.total_size = Some(total);
                    }
                }
            }
        }
    }
    Ok(r)
}

/// Best-effort probe: HEAD first, ranged GET to fill gaps or when HEAD is
/// blocked. Fails with `Unsupported` only when neither a size nor range
/// support could be derived.
pub fn probe_best_effort(
    url: &str,
    options: &DownloadOptions,
) -> Result<RemoteDescriptor, DownloadError> {
    let merged = match probe(url, options) {
        Ok(mut r) => {
            if r.accept_ranges && r.total_size.is_some() {
                return Ok(r);
            }
            if let Ok(r2) = probe_range0(url, options) {
                r.accept_ranges |= r2.accept_ranges;
                if r.total_size.is_none() {
                    r.total_size = r2.total_size;
                }
                if r.etag.is_none() {
                    r.etag = r2.etag;
                }
                if r.last_modified.is_none() {
                    r.last_modified = r2.last_modified;
                }
                if r.content_type.is_none() {
                    r.content_type = r2.content_type;
                }
            }
            r
        }
        Err(head_err) => {
            // Auth and not-found are authoritative; only fall back when HEAD
            // itself looks unsupported or the origin misbehaved.
            match head_err.kind() {
                ErrorKind::AuthRequired | ErrorKind::NotFound | ErrorKind::Forbidden => {
                    return Err(head_err)
                }
                _ => probe_range0(url, options)?,
            }
        }
    };

    if merged.total_size.is_none() && !merged.accept_ranges {
        return Err(DownloadError::msg(
            ErrorKind::Unsupported,
            format!("{}: origin reports neither size nor range support", url),
        ));
    }
    tracing::debug!(
        total = ?merged.total_size,
        ranges = merged.accept_ranges,
        etag = ?merged.etag,
        "probe complete"
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(etag: Option<&str>, lm: Option<&str>) -> RemoteDescriptor {
        RemoteDescriptor {
            total_size: Some(100),
            accept_ranges: true,
            etag: etag.map(String::from),
            last_modified: lm.map(String::from),
            content_type: None,
        }
    }

    #[test]
    fn validator_prefers_strong_etag() {
        let d = descriptor(Some("\"abc\""), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(d.validator(), Some(Validator::Strong("\"abc\"")));
    }

    #[test]
    fn weak_etag_falls_back_to_last_modified() {
        let d = descriptor(Some("W/\"abc\""), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(
            d.validator(),
            Some(Validator::Weak("Wed, 21 Oct 2015 07:28:00 GMT"))
        );
        let none = descriptor(Some("W/\"abc\""), None);
        assert_eq!(none.validator(), None);
    }

    #[test]
    fn same_entity_detects_any_divergence() {
        let a = descriptor(Some("\"v1\""), None);
        assert!(a.same_entity(&a.clone()));
        let mut b = a.clone();
        b.etag = Some("\"v2\"".to_string());
        assert!(!a.same_entity(&b));
        let mut c = a.clone();
        c.total_size = Some(101);
        assert!(!a.same_entity(&c));
    }
}
