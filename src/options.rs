//! Caller-facing configuration for a download job.
//!
//! Plain struct with public fields and spec'd defaults; hosts override what
//! they need. Reserved headers (`Range`, conditional validators) are stripped
//! from caller input because the engine owns them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::progress::Progress;

/// Default number of parallel segment fetchers.
pub const DEFAULT_MAX_PARALLELISM: usize = 8;
/// Default target size of one segment.
pub const DEFAULT_TARGET_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;
/// Default attempts per segment (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default idle-read timeout (no bytes received for this long aborts the transfer).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default minimum interval between progress observer invocations.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Headers the engine owns; caller values for these are ignored.
const RESERVED_HEADERS: [&str; 3] = ["range", "if-match", "if-unmodified-since"];

/// Digest algorithms accepted for `expected_digest` and post-hoc verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        };
        f.write_str(s)
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(format!("unknown digest algorithm: {}", other)),
        }
    }
}

/// An expected whole-file digest supplied at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedDigest {
    pub algorithm: DigestAlgorithm,
    /// Lowercase hex. Compared case-insensitively against computed digests.
    pub value: String,
}

impl ExpectedDigest {
    pub fn new(algorithm: DigestAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().to_ascii_lowercase(),
        }
    }
}

/// Opaque credential decoration applied to every request of a job.
#[derive(Debug, Clone)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Observer invoked from the job's control context at most once per
/// `progress_interval`, and once more on the terminal transition.
pub type ProgressObserver = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Options snapshot taken at submission.
#[derive(Clone)]
pub struct DownloadOptions {
    pub max_parallelism: usize,
    pub target_segment_size: u64,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Caller headers, merged over engine defaults; caller wins except for
    /// the reserved `Range` / `If-Match` / `If-Unmodified-Since`.
    pub headers: HashMap<String, String>,
    pub auth: Option<Auth>,
    pub tls_verify: bool,
    pub expected_digest: Option<ExpectedDigest>,
    pub overwrite: bool,
    pub progress_interval: Duration,
    pub user_agent: String,
    pub observer: Option<ProgressObserver>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            target_segment_size: DEFAULT_TARGET_SEGMENT_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            headers: HashMap::new(),
            auth: None,
            tls_verify: true,
            expected_digest: None,
            overwrite: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            user_agent: concat!("segfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            observer: None,
        }
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("max_parallelism", &self.max_parallelism)
            .field("target_segment_size", &self.target_segment_size)
            .field("max_attempts", &self.max_attempts)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("headers", &self.headers)
            .field("tls_verify", &self.tls_verify)
            .field("expected_digest", &self.expected_digest)
            .field("overwrite", &self.overwrite)
            .field("progress_interval", &self.progress_interval)
            .field("user_agent", &self.user_agent)
            .field("observer", &self.observer.as_ref().map(|_| "..."))
            .finish()
    }
}

impl DownloadOptions {
    /// Request headers for one transfer: defaults, then caller headers with
    /// reserved names stripped.
    pub(crate) fn request_headers(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        out.insert("User-Agent".to_string(), self.user_agent.clone());
        for (k, v) in &self.headers {
            let lower = k.trim().to_ascii_lowercase();
            if RESERVED_HEADERS.contains(&lower.as_str()) {
                tracing::warn!(header = %k, "ignoring reserved caller header");
                continue;
            }
            out.insert(k.trim().to_string(), v.trim().to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let o = DownloadOptions::default();
        assert_eq!(o.max_parallelism, 8);
        assert_eq!(o.target_segment_size, 8 * 1024 * 1024);
        assert_eq!(o.max_attempts, 5);
        assert_eq!(o.connect_timeout, Duration::from_secs(10));
        assert_eq!(o.idle_timeout, Duration::from_secs(30));
        assert!(o.tls_verify);
        assert!(!o.overwrite);
        assert_eq!(o.progress_interval, Duration::from_millis(250));
    }

    #[test]
    fn reserved_headers_are_stripped() {
        let mut o = DownloadOptions::default();
        o.headers
            .insert("Range".to_string(), "bytes=0-10".to_string());
        o.headers
            .insert("If-Match".to_string(), "\"etag\"".to_string());
        o.headers
            .insert("X-Custom".to_string(), "yes".to_string());
        let h = o.request_headers();
        assert!(h.keys().all(|k| !k.eq_ignore_ascii_case("range")));
        assert!(h.keys().all(|k| !k.eq_ignore_ascii_case("if-match")));
        assert_eq!(h.get("X-Custom").map(String::as_str), Some("yes"));
    }

    #[test]
    fn caller_user_agent_overrides_default() {
        let mut o = DownloadOptions::default();
        o.headers
            .insert("User-Agent".to_string(), "host-app/2.0".to_string());
        let h = o.request_headers();
        assert_eq!(h.get("User-Agent").map(String::as_str), Some("host-app/2.0"));
    }

    #[test]
    fn algorithm_parse_accepts_dashed_names() {
        assert_eq!("SHA-256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!("md5".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Md5);
        assert!("crc32".parse::<DigestAlgorithm>().is_err());
    }
}
