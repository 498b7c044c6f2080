//! Parse HTTP response header lines into a RemoteDescriptor.

use super::RemoteDescriptor;

/// Parse collected header lines into a descriptor.
pub(crate) fn parse_headers(lines: &[String]) -> RemoteDescriptor {
    let mut total_size = None;
    let mut accept_ranges = false;
    let mut etag = None;
    let mut last_modified = None;
    let mut content_type = None;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                if let Ok(n) = value.parse::<u64>() {
                    total_size = Some(n);
                }
            }
            if name.eq_ignore_ascii_case("accept-ranges") {
                accept_ranges = value.eq_ignore_ascii_case("bytes");
            }
            if name.eq_ignore_ascii_case("etag") {
                // Kept verbatim (quotes included) so it round-trips into If-Match.
                etag = Some(value.to_string());
            }
            if name.eq_ignore_ascii_case("last-modified") {
                last_modified = Some(value.to_string());
            }
            if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_string());
            }
        }
    }

    RemoteDescriptor {
        total_size,
        accept_ranges,
        etag,
        last_modified,
        content_type,
    }
}

/// Total from a `Content-Range` value: "bytes 0-0/12345" -> 12345.
/// "bytes */12345" also parses; an unknown total ("/*") yields None.
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.split_once('/')?;
    let total = total.trim();
    if total == "*" {
        return None;
    }
    total.parse::<u64>().ok()
}

/// Span from a `Content-Range` header among captured lines:
/// "Content-Range: bytes 100-199/1000" -> (100, 199).
pub(crate) fn parse_content_range_span(lines: &[String]) -> Option<(u64, u64)> {
    for line in lines {
        let (name, value) = match line.split_once(':') {
            Some(p) => p,
            None => continue,
        };
        if !name.trim().eq_ignore_ascii_case("content-range") {
            continue;
        }
        let value = value.trim();
        let rest = value.strip_prefix("bytes").map(str::trim_start)?;
        let (span, _total) = rest.split_once('/')?;
        let (start, end) = span.split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let end = end.trim().parse::<u64>().ok()?;
        return Some((start, end));
    }
    None
}

/// Status code from the final "HTTP/..." line of a captured header block.
pub(crate) fn parse_http_status(lines: &[String]) -> Option<u32> {
    let line = lines.iter().rev().find(|l| l.starts_with("HTTP/"))?;
    line.split_whitespace().nth(1)?.parse::<u32>().ok()
}
