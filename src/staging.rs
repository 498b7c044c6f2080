//! On-disk staging layout and exclusive ownership.
//!
//! For a final path `/d/file.bin` the staging directory is
//! `/d/.file.bin.download/`, holding one `seg.NNNN` file per segment, the
//! `journal` pair, and an advisory `lock` file. The lock is a `flock` on
//! Unix, so a crashed process never wedges future resumes.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{io_error_kind, DownloadError, ErrorKind};
use crate::planner::{SegmentPlan, SegmentStatus};

const STAGING_SUFFIX: &str = ".download";
const LOCK_FILE: &str = "lock";

/// Staging directory path for a final output path: a dotted sibling.
pub fn staging_dir_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let dir = final_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{}{}", name, STAGING_SUFFIX))
}

/// Assembly scratch path: `{final}.part` beside the final path, same
/// filesystem so the publish rename is atomic.
pub fn part_path(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}

/// Exclusively held staging directory for one live job.
pub struct StagingDir {
    dir: PathBuf,
    // Held for the lifetime of the job; the flock drops with the handle.
    _lock: File,
    #[cfg(not(unix))]
    lock_path: PathBuf,
}

impl StagingDir {
    /// Create (or reopen) the staging directory and take the advisory lock.
    /// A directory already locked by a live process yields `Busy`.
    pub fn acquire(final_path: &Path) -> Result<Self, DownloadError> {
        let dir = staging_dir_path(final_path);
        fs::create_dir_all(&dir).map_err(|e| {
            DownloadError::new(
                io_error_kind(&e),
                anyhow::Error::new(e).context(format!("create staging {}", dir.display())),
            )
        })?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = acquire_lock(&lock_path)?;
        tracing::debug!(dir = %dir.display(), "staging directory acquired");
        Ok(Self {
            dir,
            _lock: lock,
            #[cfg(not(unix))]
            lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path of the staging file for a segment index.
    pub fn segment_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("seg.{:04}", index))
    }

    /// Reconcile a plan against the files actually on disk. A `completed`
    /// segment whose file does not match its length exactly, and any partial
    /// segment, is demoted to `pending`; `bytes_written` is reset to what can
    /// be trusted (the file length, or zero when the file is oversized or
    /// missing). Oversized files are deleted rather than trusted.
    pub fn reconcile(&self, plan: &mut SegmentPlan) -> Result<()> {
        for seg in &mut plan.segments {
            let path = self.segment_path(seg.index);
            let on_disk = match fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => {
                    return Err(e).with_context(|| format!("stat {}", path.display()));
                }
            };

            match seg.len() {
                Some(len) if seg.status == SegmentStatus::Completed && on_disk == len => {}
                Some(len) if on_disk <= len => {
                    if seg.status == SegmentStatus::Completed || seg.bytes_written != on_disk {
                        tracing::debug!(
                            index = seg.index,
                            journal = seg.bytes_written,
                            on_disk,
                            "segment file disagrees with journal, trusting file"
                        );
                    }
                    seg.status = SegmentStatus::Pending;
                    seg.bytes_written = on_disk;
                    seg.digest = None;
                }
                _ => {
                    // Oversized or unknown-length leftovers cannot be resumed.
                    if on_disk > 0 {
                        fs::remove_file(&path)
                            .with_context(|| format!("remove {}", path.display()))?;
                    }
                    seg.status = SegmentStatus::Pending;
                    seg.bytes_written = 0;
                    seg.digest = None;
                }
            }
        }
        Ok(())
    }

    /// Delete all segment files, keeping the directory, journal, and lock.
    /// Used when the source changed and the job restarts from empty.
    pub fn wipe_segments(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("read staging {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("seg.") {
                fs::remove_file(entry.path())
                    .with_context(|| format!("remove {}", entry.path().display()))?;
            }
        }
        Ok(())
    }

    /// Remove the whole staging directory after successful publication.
    pub fn remove(self) -> Result<()> {
        let dir = self.dir.clone();
        drop(self);
        fs::remove_dir_all(&dir).with_context(|| format!("remove staging {}", dir.display()))
    }
}

#[cfg(not(unix))]
impl Drop for StagingDir {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[cfg(unix)]
fn acquire_lock(path: &Path) -> Result<File, DownloadError> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            DownloadError::new(
                io_error_kind(&e),
                anyhow::Error::new(e).context(format!("open lock {}", path.display())),
            )
        })?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(DownloadError::msg(
                ErrorKind::Busy,
                format!("staging directory {} is owned by a live job", path.display()),
            ));
        }
        return Err(DownloadError::new(
            io_error_kind(&errno),
            anyhow::Error::new(errno).context(format!("flock {}", path.display())),
        ));
    }
    Ok(file)
}

#[cfg(not(unix))]
fn acquire_lock(path: &Path) -> Result<File, DownloadError> {
    // Best effort without flock: creation is the lock; the file is removed
    // on drop. A crash leaves it behind, which a later job may clear by hand.
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(DownloadError::msg(
            ErrorKind::Busy,
            format!("staging lock {} already exists", path.display()),
        )),
        Err(e) => Err(DownloadError::new(
            io_error_kind(&e),
            anyhow::Error::new(e).context(format!("create lock {}", path.display())),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::SegmentPlan;

    #[test]
    fn staging_path_is_dotted_sibling() {
        let p = staging_dir_path(Path::new("/d/file.bin"));
        assert_eq!(p, PathBuf::from("/d/.file.bin.download"));
        assert_eq!(
            part_path(Path::new("/d/file.bin")),
            PathBuf::from("/d/file.bin.part")
        );
    }

    #[test]
    fn acquire_creates_dir_and_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let final_path = tmp.path().join("out.bin");
        let staging = StagingDir::acquire(&final_path).unwrap();
        assert!(staging.path().is_dir());
        assert!(staging.path().join("lock").exists());
        assert_eq!(staging.segment_path(3), staging.path().join("seg.0003"));
    }

    #[cfg(unix)]
    #[test]
    fn second_acquire_is_busy_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let final_path = tmp.path().join("out.bin");
        let first = StagingDir::acquire(&final_path).unwrap();
        let second = StagingDir::acquire(&final_path);
        match second {
            Err(e) => assert_eq!(e.kind(), ErrorKind::Busy),
            Ok(_) => panic!("expected Busy"),
        }
        drop(first);
        // Lock released with the handle; a new job may take over.
        StagingDir::acquire(&final_path).unwrap();
    }

    #[test]
    fn reconcile_demotes_missing_and_truncated() {
        let tmp = tempfile::tempdir().unwrap();
        let final_path = tmp.path().join("out.bin");
        let staging = StagingDir::acquire(&final_path).unwrap();

        let mut plan = SegmentPlan::split(1000, 250, 8);
        // seg 0: complete on disk.
        fs::write(staging.segment_path(0), vec![0u8; 250]).unwrap();
        plan.segments[0].status = SegmentStatus::Completed;
        plan.segments[0].bytes_written = 250;
        // seg 1: journal says completed, file truncated.
        fs::write(staging.segment_path(1), vec![0u8; 100]).unwrap();
        plan.segments[1].status = SegmentStatus::Completed;
        plan.segments[1].bytes_written = 250;
        // seg 2: partial from an interrupted run.
        fs::write(staging.segment_path(2), vec![0u8; 60]).unwrap();
        plan.segments[2].status = SegmentStatus::InFlight;
        plan.segments[2].bytes_written = 80;
        // seg 3: missing entirely.
        plan.segments[3].status = SegmentStatus::Completed;
        plan.segments[3].bytes_written = 250;

        staging.reconcile(&mut plan).unwrap();

        assert_eq!(plan.segments[0].status, SegmentStatus::Completed);
        assert_eq!(plan.segments[0].bytes_written, 250);
        assert_eq!(plan.segments[1].status, SegmentStatus::Pending);
        assert_eq!(plan.segments[1].bytes_written, 100);
        assert_eq!(plan.segments[2].status, SegmentStatus::Pending);
        assert_eq!(plan.segments[2].bytes_written, 60);
        assert_eq!(plan.segments[3].status, SegmentStatus::Pending);
        assert_eq!(plan.segments[3].bytes_written, 0);
    }

    #[test]
    fn reconcile_discards_oversized_files() {
        let tmp = tempfile::tempdir().unwrap();
        let final_path = tmp.path().join("out.bin");
        let staging = StagingDir::acquire(&final_path).unwrap();
        let mut plan = SegmentPlan::split(100, 50, 2);
        fs::write(staging.segment_path(0), vec![0u8; 99]).unwrap();
        staging.reconcile(&mut plan).unwrap();
        assert_eq!(plan.segments[0].bytes_written, 0);
        assert!(!staging.segment_path(0).exists());
    }

    #[test]
    fn wipe_keeps_journal_and_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let final_path = tmp.path().join("out.bin");
        let staging = StagingDir::acquire(&final_path).unwrap();
        fs::write(staging.segment_path(0), b"x").unwrap();
        fs::write(staging.path().join("journal"), b"{}").unwrap();
        staging.wipe_segments().unwrap();
        assert!(!staging.segment_path(0).exists());
        assert!(staging.path().join("journal").exists());
        assert!(staging.path().join("lock").exists());
    }

    #[test]
    fn remove_deletes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let final_path = tmp.path().join("out.bin");
        let staging = StagingDir::acquire(&final_path).unwrap();
        fs::write(staging.segment_path(0), b"x").unwrap();
        let dir = staging.path().to_path_buf();
        staging.remove().unwrap();
        assert!(!dir.exists());
    }
}
