//! Durable job journal: the authoritative record for crash resumption.
//!
//! The journal is a versioned JSON document living next to the segment files.
//! Commits write `journal.tmp` and atomically rename it over `journal`, so a
//! torn write can never produce a partially valid record. Progress commits
//! are coalesced; status transitions always commit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::options::ExpectedDigest;
use crate::planner::SegmentPlan;
use crate::probe::RemoteDescriptor;

/// Current on-disk schema version. Anything else loads as `Corrupt`.
pub const JOURNAL_VERSION: u32 = 1;

/// Coalescing thresholds for progress commits.
pub const COMMIT_BYTE_THRESHOLD: u64 = 512 * 1024;
pub const COMMIT_INTERVAL: Duration = Duration::from_secs(2);

const JOURNAL_FILE: &str = "journal";
const JOURNAL_TMP_FILE: &str = "journal.tmp";

/// The durable record: plan, per-segment status, and remote validators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    pub version: u32,
    pub job_id: String,
    pub url: String,
    pub remote: RemoteDescriptor,
    pub plan: SegmentPlan,
    /// Aggregate bytes confirmed on disk at the last commit.
    pub bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<ExpectedDigest>,
    /// Unix seconds of the last commit.
    pub updated_at: u64,
}

impl Journal {
    pub fn new(
        job_id: impl Into<String>,
        url: impl Into<String>,
        remote: RemoteDescriptor,
        plan: SegmentPlan,
        expected_digest: Option<ExpectedDigest>,
    ) -> Self {
        Self {
            version: JOURNAL_VERSION,
            job_id: job_id.into(),
            url: url.into(),
            remote,
            plan,
            bytes_downloaded: 0,
            expected_digest,
            updated_at: 0,
        }
    }
}

/// Result of loading a journal from disk.
#[derive(Debug)]
pub enum JournalLoad {
    Loaded(Journal),
    NotFound,
    /// Unparseable content or an unknown schema version. The caller erases
    /// staging and restarts from empty.
    Corrupt,
}

/// Owns the journal file pair and serializes commits.
pub struct JournalStore {
    path: PathBuf,
    tmp_path: PathBuf,
    commit_lock: Mutex<()>,
}

impl JournalStore {
    /// Store rooted in a staging directory.
    pub fn at(dir: &Path) -> Self {
        Self {
            path: dir.join(JOURNAL_FILE),
            tmp_path: dir.join(JOURNAL_TMP_FILE),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current journal. I/O failures other than absence are real
    /// errors; bad content is `Corrupt`, never an error.
    pub fn load(&self) -> Result<JournalLoad> {
        let data = match fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(JournalLoad::NotFound)
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()))
            }
        };
        let journal: Journal = match serde_json::from_slice(&data) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "journal unparseable");
                return Ok(JournalLoad::Corrupt);
            }
        };
        if journal.version != JOURNAL_VERSION {
            tracing::warn!(
                version = journal.version,
                "journal schema version unknown, treating as corrupt"
            );
            return Ok(JournalLoad::Corrupt);
        }
        Ok(JournalLoad::Loaded(journal))
    }

    /// Durably replace the journal: write tmp, fsync, atomic rename.
    pub fn commit(&self, journal: &mut Journal) -> Result<()> {
        journal.updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let encoded = serde_json::to_vec_pretty(journal).context("encode journal")?;

        let _guard = self.commit_lock.lock().unwrap();
        let mut tmp = fs::File::create(&self.tmp_path)
            .with_context(|| format!("create {}", self.tmp_path.display()))?;
        tmp.write_all(&encoded)
            .with_context(|| format!("write {}", self.tmp_path.display()))?;
        tmp.sync_all()
            .with_context(|| format!("sync {}", self.tmp_path.display()))?;
        drop(tmp);
        fs::rename(&self.tmp_path, &self.path).with_context(|| {
            format!(
                "rename {} over {}",
                self.tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    /// Remove the journal pair (used when restarting from empty).
    pub fn remove(&self) -> Result<()> {
        let _guard = self.commit_lock.lock().unwrap();
        for p in [&self.path, &self.tmp_path] {
            match fs::remove_file(p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("remove {}", p.display())),
            }
        }
        Ok(())
    }
}

/// Decides when accumulated progress justifies a commit: every
/// `COMMIT_BYTE_THRESHOLD` bytes or `COMMIT_INTERVAL`, whichever first.
pub struct CommitGate {
    bytes_since_commit: u64,
    last_commit: Instant,
    byte_threshold: u64,
    interval: Duration,
}

impl Default for CommitGate {
    fn default() -> Self {
        Self::new(COMMIT_BYTE_THRESHOLD, COMMIT_INTERVAL)
    }
}

impl CommitGate {
    pub fn new(byte_threshold: u64, interval: Duration) -> Self {
        Self {
            bytes_since_commit: 0,
            last_commit: Instant::now(),
            byte_threshold,
            interval,
        }
    }

    /// Record newly confirmed bytes; true when a commit is due.
    pub fn record(&mut self, new_bytes: u64) -> bool {
        self.bytes_since_commit += new_bytes;
        self.bytes_since_commit >= self.byte_threshold
            || self.last_commit.elapsed() >= self.interval
    }

    /// Call after committing for any reason.
    pub fn committed(&mut self) {
        self.bytes_since_commit = 0;
        self.last_commit = Instant::now();
    }
}
