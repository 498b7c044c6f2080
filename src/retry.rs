//! Failure classification and backoff policy.
//!
//! The fetcher reports a [`FetchError`]; the scheduler classifies it as
//! transient or permanent and, for transient failures, re-dispatches the
//! segment after an exponential backoff with jitter.

use rand::Rng;
use std::fmt;
use std::time::Duration;

use crate::error::{io_error_kind, ErrorKind};

/// Error from a single segment fetch attempt.
#[derive(Debug)]
pub enum FetchError {
    /// libcurl reported a transport error (timeout, reset, DNS, TLS).
    Curl(curl::Error),
    /// Terminal non-2xx HTTP status.
    Http(u32),
    /// Origin answered 412: the entity changed under our validators.
    SourceChanged,
    /// Origin answered 200 to a request that required 206, or a 206 whose
    /// `Content-Range` does not match the requested window.
    RangeNotHonored,
    /// Transfer ended short of the requested window (connection dropped).
    PartialTransfer { expected: u64, received: u64 },
    /// Origin sent more bytes than the requested window.
    Overrun { expected: u64 },
    /// The staging file length disagrees with the journal.
    StagingInconsistent { journal: u64, on_disk: u64 },
    /// Local write failed (disk full, permissions).
    Storage(std::io::Error),
    /// The cancel signal was observed mid-transfer.
    Cancelled,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Curl(e) => write!(f, "{}", e),
            FetchError::Http(code) => write!(f, "HTTP {}", code),
            FetchError::SourceChanged => write!(f, "remote entity changed (412)"),
            FetchError::RangeNotHonored => write!(f, "origin did not honor the range request"),
            FetchError::PartialTransfer { expected, received } => write!(
                f,
                "partial transfer: expected {} bytes, got {}",
                expected, received
            ),
            FetchError::Overrun { expected } => {
                write!(f, "origin sent more than the requested {} bytes", expected)
            }
            FetchError::StagingInconsistent { journal, on_disk } => write!(
                f,
                "staging file is {} bytes but journal says {}",
                on_disk, journal
            ),
            FetchError::Storage(e) => write!(f, "storage: {}", e),
            FetchError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Curl(e) => Some(e),
            FetchError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Connection resets, timeouts, 5xx, 408/429: eligible for backoff retry.
    Transient,
    /// Everything else: surfaces immediately.
    Permanent,
}

/// Classify an HTTP status for retry decisions.
pub fn classify_http_status(code: u32) -> FailureClass {
    match code {
        408 | 429 => FailureClass::Transient,
        500..=599 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

/// Classify a curl transport error for retry decisions.
pub fn classify_curl_error(e: &curl::Error) -> FailureClass {
    if e.is_ssl_connect_error() || e.is_peer_failed_verification() || e.is_ssl_cacert() {
        return FailureClass::Permanent;
    }
    if e.is_operation_timedout()
        || e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
    {
        return FailureClass::Transient;
    }
    FailureClass::Permanent
}

/// Classify a fetch error.
pub fn classify(e: &FetchError) -> FailureClass {
    match e {
        FetchError::Curl(ce) => classify_curl_error(ce),
        FetchError::Http(code) => classify_http_status(*code),
        FetchError::PartialTransfer { .. } => FailureClass::Transient,
        FetchError::SourceChanged
        | FetchError::RangeNotHonored
        | FetchError::Overrun { .. }
        | FetchError::StagingInconsistent { .. }
        | FetchError::Storage(_)
        | FetchError::Cancelled => FailureClass::Permanent,
    }
}

/// Stable error kind for a fetch error that terminated the job.
pub fn fetch_error_kind(e: &FetchError) -> ErrorKind {
    match e {
        FetchError::Curl(ce) => {
            if ce.is_operation_timedout() {
                ErrorKind::Timeout
            } else if ce.is_ssl_connect_error()
                || ce.is_peer_failed_verification()
                || ce.is_ssl_cacert()
            {
                ErrorKind::TlsFailure
            } else {
                ErrorKind::Unreachable
            }
        }
        FetchError::Http(code) => match code {
            401 | 407 => ErrorKind::AuthRequired,
            403 => ErrorKind::Forbidden,
            404 | 410 => ErrorKind::NotFound,
            416 => ErrorKind::RangeUnsupported,
            _ => ErrorKind::Unreachable,
        },
        FetchError::SourceChanged => ErrorKind::SourceChanged,
        FetchError::RangeNotHonored => ErrorKind::RangeUnsupported,
        FetchError::PartialTransfer { .. } | FetchError::Overrun { .. } => ErrorKind::Unreachable,
        FetchError::StagingInconsistent { .. } => ErrorKind::StagingInconsistent,
        FetchError::Storage(e) => io_error_kind(e),
        FetchError::Cancelled => ErrorKind::Cancelled,
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff with jitter:
/// `min(cap, base * 2^(attempt-1)) * uniform(0.5, 1.5)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts per segment, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Decide the fate of a segment whose `attempt` (1-based) just failed.
    pub fn decide(&self, attempt: u32, class: FailureClass) -> RetryDecision {
        if class == FailureClass::Permanent || attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        let exp = 1u64 << attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(exp as u32)
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        RetryDecision::RetryAfter(raw.mul_f64(jitter))
    }
}
