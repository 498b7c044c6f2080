//! Error surface of the engine.
//!
//! Every failure that reaches the caller carries one of the closed
//! [`ErrorKind`] values plus a human-readable detail chain. Internal layers
//! attach context with `anyhow` and classify at the boundary.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Stable classification of a terminal download failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Origin could not be reached (DNS, connect, reset, or retries exhausted).
    Unreachable,
    /// Origin demands credentials we do not have (401/407).
    AuthRequired,
    /// Resource does not exist at the origin (404/410).
    NotFound,
    /// Origin refused access (403).
    Forbidden,
    /// Neither size nor range support could be derived, or the request shape
    /// (scheme, options) is not supported by the engine.
    Unsupported,
    /// Remote validators changed between runs (ETag/Last-Modified mismatch or 412).
    SourceChanged,
    /// Origin stopped honoring range requests mid-job.
    RangeUnsupported,
    /// Local disk is full.
    IoFull,
    /// Local permission failure (read-only filesystem, EACCES).
    IoPermission,
    /// Any other local I/O failure.
    Io,
    /// Staging files disagree with the journal beyond repair.
    StagingInconsistent,
    /// Whole-file digest did not match the caller-supplied expectation.
    IntegrityMismatch,
    /// Output path already exists and overwrite was not requested.
    AlreadyExists,
    /// Another live job owns the output path or its staging directory.
    Busy,
    /// Caller cancelled the job.
    Cancelled,
    /// A timeout expired and retries were exhausted.
    Timeout,
    /// TLS certificate or handshake validation failed.
    TlsFailure,
    /// The engine detected an impossible internal state.
    InternalInvariant,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::AuthRequired => "auth required",
            ErrorKind::NotFound => "not found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::SourceChanged => "source changed",
            ErrorKind::RangeUnsupported => "range unsupported",
            ErrorKind::IoFull => "disk full",
            ErrorKind::IoPermission => "permission denied",
            ErrorKind::Io => "i/o error",
            ErrorKind::StagingInconsistent => "staging inconsistent",
            ErrorKind::IntegrityMismatch => "integrity mismatch",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Busy => "busy",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TlsFailure => "tls failure",
            ErrorKind::InternalInvariant => "internal invariant",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned from engine entry points: a stable kind plus the context
/// chain that produced it.
#[derive(Debug)]
pub struct DownloadError {
    kind: ErrorKind,
    source: anyhow::Error,
}

impl DownloadError {
    pub fn new(kind: ErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// Build from a plain message.
    pub fn msg(kind: ErrorKind, detail: impl fmt::Display) -> Self {
        Self {
            kind,
            source: anyhow::anyhow!("{}", detail),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The full context chain as one line, suitable for logs and callers.
    pub fn detail(&self) -> String {
        format!("{:#}", self.source)
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.kind, self.source)
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.source()
    }
}

/// Map an I/O error onto the closed kind set.
pub(crate) fn io_error_kind(e: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match e.kind() {
        Io::PermissionDenied => ErrorKind::IoPermission,
        Io::NotFound => ErrorKind::Io,
        _ => {
            // ENOSPC has no stable io::ErrorKind on all toolchains; match errno.
            if e.raw_os_error() == Some(libc_enospc()) {
                ErrorKind::IoFull
            } else {
                ErrorKind::Io
            }
        }
    }
}

#[cfg(unix)]
fn libc_enospc() -> i32 {
    libc::ENOSPC
}

#[cfg(not(unix))]
fn libc_enospc() -> i32 {
    // Windows ERROR_DISK_FULL
    112
}

/// Terminal result of a job, as surfaced by `JobHandle::wait`.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The final file was atomically published.
    Published {
        path: PathBuf,
        bytes: u64,
        elapsed: Duration,
    },
    /// The job failed with a stable kind and a human-readable detail.
    Failed { kind: ErrorKind, detail: String },
    /// The caller cancelled the job; staging was preserved for resume.
    Cancelled,
}

impl Outcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Outcome::Published { .. })
    }
}
