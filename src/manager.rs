//! Job coordinator: the state machine tying probe, planning, download, and
//! assembly together, and the handle callers interact with.
//!
//! One control thread per job owns every state transition; fetcher threads
//! never touch job state. Submitting a second job for a final path that is
//! already live fails fast with `Busy`; once the first job ends, the next
//! submission picks up the journal and resumes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::assembler;
use crate::digest;
use crate::error::{DownloadError, ErrorKind, Outcome};
use crate::job::JobState;
use crate::journal::{Journal, JournalLoad, JournalStore};
use crate::options::{DigestAlgorithm, DownloadOptions};
use crate::planner;
use crate::pool::{self, PoolContext};
use crate::probe;
use crate::progress::Progress;
use crate::staging::StagingDir;

/// How many times a job restarts from empty after the origin changes under
/// it before giving up.
const MAX_SOURCE_RESTARTS: u32 = 2;

type Registry = Arc<Mutex<HashMap<PathBuf, Weak<JobShared>>>>;

/// Explicitly constructed engine front door; owns nothing global.
pub struct DownloadManager {
    defaults: DownloadOptions,
    live: Registry,
}

impl Default for DownloadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadManager {
    pub fn new() -> Self {
        Self::with_options(DownloadOptions::default())
    }

    /// Manager whose jobs inherit `defaults` unless overridden per call.
    pub fn with_options(defaults: DownloadOptions) -> Self {
        Self {
            defaults,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit a download with the manager's default options.
    pub fn start(
        &self,
        url: &str,
        output_path: impl AsRef<Path>,
    ) -> Result<JobHandle, DownloadError> {
        self.start_with(url, output_path, self.defaults.clone())
    }

    /// Submit a download with explicit options.
    pub fn start_with(
        &self,
        url: &str,
        output_path: impl AsRef<Path>,
        options: DownloadOptions,
    ) -> Result<JobHandle, DownloadError> {
        let parsed = url::Url::parse(url).map_err(|e| {
            DownloadError::new(
                ErrorKind::Unsupported,
                anyhow::Error::new(e).context(format!("invalid url {}", url)),
            )
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::msg(
                ErrorKind::Unsupported,
                format!("scheme {} is not supported", parsed.scheme()),
            ));
        }

        let final_path = std::path::absolute(output_path.as_ref()).map_err(|e| {
            DownloadError::new(
                ErrorKind::Io,
                anyhow::Error::new(e)
                    .context(format!("resolve {}", output_path.as_ref().display())),
            )
        })?;

        let shared = Arc::new(JobShared {
            final_path: final_path.clone(),
            started: Instant::now(),
            cancel: AtomicBool::new(false),
            state: Mutex::new(JobState::Created),
            outcome: Mutex::new(None),
            done: Condvar::new(),
            bytes_done: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            segments_done: AtomicUsize::new(0),
            segment_count: AtomicUsize::new(0),
        });

        {
            let mut live = self.live.lock().unwrap();
            if let Some(existing) = live.get(&final_path) {
                if existing.upgrade().is_some() {
                    return Err(DownloadError::msg(
                        ErrorKind::Busy,
                        format!("a live job already owns {}", final_path.display()),
                    ));
                }
            }
            live.insert(final_path.clone(), Arc::downgrade(&shared));
        }

        let registry = Arc::clone(&self.live);
        let thread_shared = Arc::clone(&shared);
        let url_owned = url.to_string();
        std::thread::Builder::new()
            .name("segfetch-job".to_string())
            .spawn(move || run_job(thread_shared, url_owned, options, registry))
            .map_err(|e| {
                self.live.lock().unwrap().remove(&final_path);
                DownloadError::new(
                    ErrorKind::Io,
                    anyhow::Error::new(e).context("spawn job thread"),
                )
            })?;

        Ok(JobHandle { shared })
    }

    /// Post-hoc integrity check of a published file.
    pub fn verify(
        &self,
        handle: &JobHandle,
        algorithm: DigestAlgorithm,
        expected: &str,
    ) -> Result<bool, DownloadError> {
        if handle.state() != JobState::Published {
            return Err(DownloadError::msg(
                ErrorKind::NotFound,
                format!(
                    "{} has not been published (state: {})",
                    handle.final_path().display(),
                    handle.state()
                ),
            ));
        }
        digest::verify_file(handle.final_path(), algorithm, expected).map_err(|e| {
            let kind = e
                .downcast_ref::<std::io::Error>()
                .map(crate::error::io_error_kind)
                .unwrap_or(ErrorKind::Io);
            DownloadError::new(kind, e)
        })
    }

    /// Request cancellation of every live job started by this manager.
    pub fn cancel_all(&self) {
        let live = self.live.lock().unwrap();
        for weak in live.values() {
            if let Some(shared) = weak.upgrade() {
                shared.cancel.store(true, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[derive(Debug)]
struct JobShared {
    final_path: PathBuf,
    started: Instant,
    cancel: AtomicBool,
    state: Mutex<JobState>,
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
    bytes_done: AtomicU64,
    /// 0 encodes "unknown" until the probe fills it in.
    total_bytes: AtomicU64,
    segments_done: AtomicUsize,
    segment_count: AtomicUsize,
}

impl JobShared {
    fn snapshot(&self) -> Progress {
        let total = self.total_bytes.load(Ordering::Relaxed);
        Progress {
            state: *self.state.lock().unwrap(),
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            total_bytes: (total > 0).then_some(total),
            segments_done: self.segments_done.load(Ordering::Relaxed),
            segment_count: self.segment_count.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }

    fn transition(&self, to: JobState) -> Result<(), DownloadError> {
        let mut state = self.state.lock().unwrap();
        if !state.can_transition(to) {
            return Err(DownloadError::msg(
                ErrorKind::InternalInvariant,
                format!("illegal state transition {} -> {}", state, to),
            ));
        }
        tracing::debug!(from = %state, to = %to, "job state");
        *state = to;
        Ok(())
    }
}

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    /// Current progress snapshot.
    pub fn progress(&self) -> Progress {
        self.shared.snapshot()
    }

    pub fn state(&self) -> JobState {
        *self.shared.state.lock().unwrap()
    }

    pub fn final_path(&self) -> &Path {
        &self.shared.final_path
    }

    /// Request cancellation; fetchers stop at the next chunk boundary and
    /// staging is preserved for a later resume.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
    }

    /// Block until the job reaches a terminal state.
    pub fn wait(&self) -> Outcome {
        let mut outcome = self.shared.outcome.lock().unwrap();
        loop {
            if let Some(o) = outcome.as_ref() {
                return o.clone();
            }
            outcome = self.shared.done.wait(outcome).unwrap();
        }
    }
}

fn job_id_for(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

fn run_job(shared: Arc<JobShared>, url: String, options: DownloadOptions, registry: Registry) {
    let result = catch_unwind(AssertUnwindSafe(|| drive(&shared, &url, &options)));
    let result = match result {
        Ok(r) => r,
        Err(_) => Err(DownloadError::msg(
            ErrorKind::InternalInvariant,
            "job thread panicked",
        )),
    };

    let (terminal_state, outcome) = match result {
        Ok(bytes) => (
            JobState::Published,
            Outcome::Published {
                path: shared.final_path.clone(),
                bytes,
                elapsed: shared.started.elapsed(),
            },
        ),
        Err(e) if e.kind() == ErrorKind::Cancelled => (JobState::Cancelled, Outcome::Cancelled),
        Err(e) => {
            tracing::warn!(path = %shared.final_path.display(), error = %e, "job failed");
            (
                JobState::Failed,
                Outcome::Failed {
                    kind: e.kind(),
                    detail: e.detail(),
                },
            )
        }
    };

    {
        let mut state = shared.state.lock().unwrap();
        *state = terminal_state;
    }
    registry.lock().unwrap().remove(&shared.final_path);

    if let Some(observer) = options.observer.as_ref() {
        observer(&shared.snapshot());
    }

    let mut slot = shared.outcome.lock().unwrap();
    *slot = Some(outcome);
    shared.done.notify_all();
}

/// The A -> B -> E -> F pipeline; returns published bytes.
fn drive(
    shared: &JobShared,
    url: &str,
    options: &DownloadOptions,
) -> Result<u64, DownloadError> {
    let final_path = shared.final_path.clone();
    let job_id = job_id_for(&final_path);

    shared.transition(JobState::Probing)?;
    let mut remote = probe::probe_best_effort(url, options)?;

    let mut source_restarts = 0u32;
    let mut range_degraded = false;

    loop {
        if shared.cancel.load(Ordering::Relaxed) {
            return Err(DownloadError::msg(ErrorKind::Cancelled, "cancelled by caller"));
        }

        shared.transition(JobState::Planning)?;
        let staging = StagingDir::acquire(&final_path)?;
        let store = JournalStore::at(staging.path());

        let existing = match store.load().map_err(journal_io_error)? {
            JournalLoad::Loaded(j) if j.url == url && j.job_id == job_id => Some(j),
            JournalLoad::Loaded(_) => {
                tracing::info!("journal belongs to a different request, restarting from empty");
                wipe(&staging, &store)?;
                None
            }
            JournalLoad::NotFound => None,
            JournalLoad::Corrupt => {
                tracing::warn!("journal corrupt, restarting from empty");
                wipe(&staging, &store)?;
                None
            }
        };

        if range_degraded {
            remote.accept_ranges = false;
        }

        let reused = existing
            .as_ref()
            .map(|j| j.remote.same_entity(&remote))
            .unwrap_or(false);
        let mut plan = planner::plan(&remote, options, existing.as_ref());
        if reused {
            staging.reconcile(&mut plan).map_err(journal_io_error)?;
        } else {
            // Fresh plan: stale segment files must not survive.
            staging.wipe_segments().map_err(journal_io_error)?;
        }

        let mut journal = Journal::new(
            job_id.as_str(),
            url,
            remote.clone(),
            plan,
            options.expected_digest.clone(),
        );
        journal.bytes_downloaded = journal.plan.bytes_on_disk();
        store.commit(&mut journal).map_err(journal_io_error)?;

        shared
            .total_bytes
            .store(remote.total_size.unwrap_or(0), Ordering::Relaxed);
        shared
            .segment_count
            .store(journal.plan.segment_count(), Ordering::Relaxed);
        let already_done = journal
            .plan
            .segments
            .iter()
            .filter(|s| s.status == crate::planner::SegmentStatus::Completed)
            .count();
        shared.segments_done.store(already_done, Ordering::Relaxed);
        shared
            .bytes_done
            .store(journal.bytes_downloaded, Ordering::Relaxed);

        shared.transition(JobState::Downloading)?;
        let pool_ctx = PoolContext {
            url,
            options,
            remote: &remote,
            staging: &staging,
            store: &store,
            cancel: &shared.cancel,
        };
        let mut emit = |bytes: u64, segments_done: usize| {
            shared.bytes_done.fetch_max(bytes, Ordering::Relaxed);
            shared.segments_done.store(segments_done, Ordering::Relaxed);
            if let Some(observer) = options.observer.as_ref() {
                observer(&shared.snapshot());
            }
        };

        match pool::run_segments(&pool_ctx, &mut journal, &mut emit) {
            Ok(()) => {
                shared.transition(JobState::Assembling)?;
                let bytes = assembler::assemble(
                    &journal.plan,
                    &staging,
                    &final_path,
                    options.expected_digest.as_ref(),
                    options.overwrite,
                )?;
                if let Err(e) = staging.remove() {
                    tracing::warn!(error = %e, "staging cleanup failed after publication");
                }
                return Ok(bytes);
            }
            Err(e) if e.kind() == ErrorKind::SourceChanged => {
                source_restarts += 1;
                if source_restarts > MAX_SOURCE_RESTARTS {
                    return Err(e);
                }
                tracing::warn!(
                    restarts = source_restarts,
                    "origin changed mid-download, restarting from empty"
                );
                wipe(&staging, &store)?;
                drop(store);
                drop(staging);
                shared.bytes_done.store(0, Ordering::Relaxed);
                shared.segments_done.store(0, Ordering::Relaxed);
                shared.transition(JobState::Probing)?;
                remote = probe::probe_best_effort(url, options)?;
            }
            Err(e) if e.kind() == ErrorKind::RangeUnsupported && !range_degraded => {
                tracing::warn!("origin stopped honoring ranges, degrading to one segment");
                range_degraded = true;
                wipe(&staging, &store)?;
                drop(store);
                drop(staging);
                shared.bytes_done.store(0, Ordering::Relaxed);
                shared.segments_done.store(0, Ordering::Relaxed);
            }
            Err(e) => return Err(e),
        }
    }
}

fn wipe(staging: &StagingDir, store: &JournalStore) -> Result<(), DownloadError> {
    staging.wipe_segments().map_err(journal_io_error)?;
    store.remove().map_err(journal_io_error)?;
    Ok(())
}

fn journal_io_error(e: anyhow::Error) -> DownloadError {
    let kind = e
        .downcast_ref::<std::io::Error>()
        .map(crate::error::io_error_kind)
        .unwrap_or(ErrorKind::Io);
    DownloadError::new(kind, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_deterministic_and_path_sensitive() {
        let a = job_id_for(Path::new("/d/file.bin"));
        let b = job_id_for(Path::new("/d/file.bin"));
        let c = job_id_for(Path::new("/d/other.bin"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        let mgr = DownloadManager::new();
        let tmp = tempfile::tempdir().unwrap();
        let err = mgr
            .start("ftp://example.com/file", tmp.path().join("f"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err = mgr.start("not a url", tmp.path().join("f")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
