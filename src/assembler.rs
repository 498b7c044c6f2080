//! Final assembly: verify, concatenate, check integrity, publish atomically.
//!
//! Segments are concatenated in index order into `{final}.part` beside the
//! final path (same filesystem, so the publish rename is atomic). A digest
//! mismatch aborts and leaves `.part` behind for diagnostics; the staging
//! directory is only removed by the coordinator after publication.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::digest::Hasher;
use crate::error::{io_error_kind, DownloadError, ErrorKind};
use crate::options::ExpectedDigest;
use crate::planner::{SegmentPlan, SegmentStatus};
use crate::staging::{part_path, StagingDir};

const COPY_BUF: usize = 64 * 1024;

fn io_err(e: std::io::Error, what: String) -> DownloadError {
    let kind = io_error_kind(&e);
    DownloadError::new(kind, anyhow::Error::new(e).context(what))
}

/// Concatenate completed segments into the final path. Returns the published
/// byte count.
pub fn assemble(
    plan: &SegmentPlan,
    staging: &StagingDir,
    final_path: &Path,
    expected: Option<&ExpectedDigest>,
    overwrite: bool,
) -> Result<u64, DownloadError> {
    // Every segment must be complete and exactly as long as planned.
    for seg in &plan.segments {
        if seg.status != SegmentStatus::Completed {
            return Err(DownloadError::msg(
                ErrorKind::StagingInconsistent,
                format!("segment {} is not completed", seg.index),
            ));
        }
        let path = staging.segment_path(seg.index);
        let on_disk = fs::metadata(&path)
            .map_err(|e| io_err(e, format!("stat {}", path.display())))?
            .len();
        let wanted = seg.len().unwrap_or(seg.bytes_written);
        if on_disk != wanted {
            return Err(DownloadError::msg(
                ErrorKind::StagingInconsistent,
                format!(
                    "segment {} file is {} bytes, expected {}",
                    seg.index, on_disk, wanted
                ),
            ));
        }
    }

    if final_path.exists() && !overwrite {
        return Err(DownloadError::msg(
            ErrorKind::AlreadyExists,
            format!("{} already exists", final_path.display()),
        ));
    }

    let part = part_path(final_path);
    let mut out = File::create(&part)
        .map_err(|e| io_err(e, format!("create {}", part.display())))?;
    let mut hasher = expected.map(|d| Hasher::new(d.algorithm));
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUF];

    for seg in &plan.segments {
        let path = staging.segment_path(seg.index);
        let mut input = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| io_err(e, format!("open {}", path.display())))?;
        loop {
            let n = input
                .read(&mut buf)
                .map_err(|e| io_err(e, format!("read {}", path.display())))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .map_err(|e| io_err(e, format!("write {}", part.display())))?;
            if let Some(h) = hasher.as_mut() {
                h.update(&buf[..n]);
            }
            total += n as u64;
        }
    }

    if let Some(expected) = expected {
        let actual = hasher
            .take()
            .map(Hasher::finish_hex)
            .unwrap_or_default();
        if !actual.eq_ignore_ascii_case(expected.value.trim()) {
            // `.part` stays behind for diagnostics.
            return Err(DownloadError::msg(
                ErrorKind::IntegrityMismatch,
                format!(
                    "{} digest {} does not match expected {}",
                    expected.algorithm, actual, expected.value
                ),
            ));
        }
    }

    out.sync_all()
        .map_err(|e| io_err(e, format!("sync {}", part.display())))?;
    drop(out);

    fs::rename(&part, final_path).map_err(|e| {
        io_err(
            e,
            format!("publish {} over {}", part.display(), final_path.display()),
        )
    })?;
    tracing::info!(path = %final_path.display(), bytes = total, "published");
    Ok(total)
}
