//! Segment planning: range math and plan reuse on resume.
//!
//! A plan partitions `[0, total_size)` into contiguous half-open segments,
//! as equal as possible with earlier segments absorbing the remainder. When
//! the origin's size is unknown or ranges are unsupported, the plan collapses
//! to a single segment and parallelism to one.

use serde::{Deserialize, Serialize};

use crate::journal::Journal;
use crate::options::DownloadOptions;
use crate::probe::RemoteDescriptor;

/// Per-segment download status, persisted in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// One contiguous byte range `[start, end)` of the remote file, fetched
/// independently. `end = None` only in single-segment plans where the total
/// size is unknown (read to EOF).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: Option<u64>,
    pub status: SegmentStatus,
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Segment {
    /// Length in bytes, when known.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|e| e.saturating_sub(self.start))
    }

    /// True once every byte of a known-length segment is on disk.
    pub fn is_filled(&self) -> bool {
        match self.len() {
            Some(len) => self.bytes_written >= len,
            None => false,
        }
    }

    /// Remaining bytes to fetch, when the length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.bytes_written))
    }

    /// `Range` header value resuming at `start + bytes_written`, inclusive
    /// end form. `None` when the request needs no `Range` header at all
    /// (whole-body single segment from offset zero).
    pub fn range_header_value(&self) -> Option<String> {
        let from = self.start + self.bytes_written;
        match self.end {
            Some(end) if end > 0 => Some(format!("bytes={}-{}", from, end - 1)),
            Some(_) => Some("bytes=0-0".to_string()),
            None if from > 0 => Some(format!("bytes={}-", from)),
            None => None,
        }
    }
}

/// Ordered, dense partition of the remote body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub total_size: Option<u64>,
    pub segments: Vec<Segment>,
}

impl SegmentPlan {
    /// One segment covering the whole body (unknown size or no range support).
    pub fn single(total_size: Option<u64>) -> Self {
        Self {
            total_size,
            segments: vec![Segment {
                index: 0,
                start: 0,
                end: total_size,
                status: SegmentStatus::Pending,
                bytes_written: 0,
                digest: None,
            }],
        }
    }

    /// Split `total_size` into `clamp(ceil(total/target), 1, max_parallelism)`
    /// equal segments; when the division is uneven, earlier segments get the
    /// larger chunk.
    pub fn split(total_size: u64, target_segment_size: u64, max_parallelism: usize) -> Self {
        let target = target_segment_size.max(1);
        let wanted = total_size.div_ceil(target);
        let n = wanted.clamp(1, max_parallelism.max(1) as u64);

        let base = total_size / n;
        let remainder = total_size % n;
        let mut segments = Vec::with_capacity(n as usize);
        let mut offset = 0u64;
        for i in 0..n {
            let len = base + if i < remainder { 1 } else { 0 };
            let end = (offset + len).min(total_size);
            segments.push(Segment {
                index: i as usize,
                start: offset,
                end: Some(end),
                status: SegmentStatus::Pending,
                bytes_written: 0,
                digest: None,
            });
            offset = end;
        }
        Self {
            total_size: Some(total_size),
            segments,
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Bytes confirmed on disk across all segments.
    pub fn bytes_on_disk(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_written).sum()
    }

    pub fn all_completed(&self) -> bool {
        self.segments
            .iter()
            .all(|s| s.status == SegmentStatus::Completed)
    }

    /// Indices still needing work.
    pub fn incomplete(&self) -> Vec<usize> {
        self.segments
            .iter()
            .filter(|s| s.status != SegmentStatus::Completed)
            .map(|s| s.index)
            .collect()
    }
}

/// Build the plan for a job. If a prior journal is supplied and its recorded
/// validators still match the live descriptor, its plan is reused verbatim
/// except that `in_flight`/`failed` segments are demoted to `pending` (the
/// staging reconcile pass then fixes `bytes_written` against the files on
/// disk). On any validator mismatch the journal is ignored and a fresh plan
/// is produced.
pub fn plan(
    remote: &RemoteDescriptor,
    options: &DownloadOptions,
    existing: Option<&Journal>,
) -> SegmentPlan {
    if let Some(journal) = existing {
        if journal.remote.same_entity(remote) {
            let mut reused = journal.plan.clone();
            for seg in &mut reused.segments {
                if matches!(seg.status, SegmentStatus::InFlight | SegmentStatus::Failed) {
                    seg.status = SegmentStatus::Pending;
                }
            }
            tracing::debug!(
                segments = reused.segment_count(),
                "reusing plan from journal"
            );
            return reused;
        }
        tracing::info!("journal validators no longer match origin, replanning from empty");
    }

    match remote.total_size {
        Some(total) if remote.accept_ranges => {
            SegmentPlan::split(total, options.target_segment_size, options.max_parallelism)
        }
        other => SegmentPlan::single(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(total: Option<u64>, ranges: bool) -> RemoteDescriptor {
        RemoteDescriptor {
            total_size: total,
            accept_ranges: ranges,
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
            content_type: None,
        }
    }

    fn assert_partition(plan: &SegmentPlan, total: u64) {
        let mut offset = 0u64;
        for (i, seg) in plan.segments.iter().enumerate() {
            assert_eq!(seg.index, i, "indices dense");
            assert_eq!(seg.start, offset, "contiguous");
            let end = seg.end.expect("known end");
            assert!(end > seg.start || total == 0);
            offset = end;
        }
        assert_eq!(offset, total, "partition covers [0, total)");
    }

    #[test]
    fn split_even() {
        let plan = SegmentPlan::split(1000, 250, 8);
        assert_eq!(plan.segment_count(), 4);
        assert_partition(&plan, 1000);
        assert!(plan.segments.iter().all(|s| s.len() == Some(250)));
    }

    #[test]
    fn split_uneven_earlier_segments_larger() {
        let plan = SegmentPlan::split(10, 3, 4);
        assert_eq!(plan.segment_count(), 4);
        assert_partition(&plan, 10);
        let lens: Vec<u64> = plan.segments.iter().map(|s| s.len().unwrap()).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
    }

    #[test]
    fn split_clamps_to_max_parallelism() {
        // 80 MiB at 8 MiB target wants 10 segments; clamp to 8.
        let total = 80 * 1024 * 1024;
        let plan = SegmentPlan::split(total, 8 * 1024 * 1024, 8);
        assert_eq!(plan.segment_count(), 8);
        assert_partition(&plan, total);
    }

    #[test]
    fn split_small_file_single_segment() {
        let plan = SegmentPlan::split(1000, 8 * 1024 * 1024, 8);
        assert_eq!(plan.segment_count(), 1);
        assert_eq!(plan.segments[0].start, 0);
        assert_eq!(plan.segments[0].end, Some(1000));
    }

    #[test]
    fn split_zero_byte_file() {
        let plan = SegmentPlan::split(0, 8 * 1024 * 1024, 8);
        assert_eq!(plan.segment_count(), 1);
        assert_eq!(plan.segments[0].len(), Some(0));
        assert!(plan.segments[0].is_filled() || plan.segments[0].len() == Some(0));
    }

    #[test]
    fn plan_unknown_size_is_single_segment() {
        let p = plan(
            &descriptor(None, true),
            &DownloadOptions::default(),
            None,
        );
        assert_eq!(p.segment_count(), 1);
        assert_eq!(p.segments[0].end, None);
    }

    #[test]
    fn plan_without_ranges_is_single_segment() {
        let p = plan(
            &descriptor(Some(100 * 1024 * 1024), false),
            &DownloadOptions::default(),
            None,
        );
        assert_eq!(p.segment_count(), 1);
        assert_eq!(p.segments[0].end, Some(100 * 1024 * 1024));
    }

    #[test]
    fn range_header_resumes_mid_segment() {
        let mut seg = Segment {
            index: 1,
            start: 100,
            end: Some(200),
            status: SegmentStatus::Pending,
            bytes_written: 40,
            digest: None,
        };
        assert_eq!(seg.range_header_value().as_deref(), Some("bytes=140-199"));
        seg.bytes_written = 0;
        assert_eq!(seg.range_header_value().as_deref(), Some("bytes=100-199"));
    }

    #[test]
    fn range_header_open_ended_on_unknown_resume() {
        let seg = Segment {
            index: 0,
            start: 0,
            end: None,
            status: SegmentStatus::Pending,
            bytes_written: 512,
            digest: None,
        };
        assert_eq!(seg.range_header_value().as_deref(), Some("bytes=512-"));
        let fresh = Segment {
            bytes_written: 0,
            ..seg
        };
        assert_eq!(fresh.range_header_value(), None);
    }

    #[test]
    fn plan_reuses_journal_and_demotes_live_segments() {
        let remote = descriptor(Some(1000), true);
        let opts = DownloadOptions::default();
        let mut multi = SegmentPlan::split(1000, 250, 8);
        multi.segments[0].status = SegmentStatus::Completed;
        multi.segments[0].bytes_written = multi.segments[0].len().unwrap();
        multi.segments[1].status = SegmentStatus::InFlight;
        multi.segments[2].status = SegmentStatus::Failed;
        let journal = Journal::new("job", "http://o/f", remote.clone(), multi.clone(), None);

        let reused = plan(&remote, &opts, Some(&journal));
        assert_eq!(reused.segment_count(), 4);
        assert_eq!(reused.segments[1].status, SegmentStatus::Pending);
        assert_eq!(reused.segments[2].status, SegmentStatus::Pending);
    }

    #[test]
    fn plan_discards_journal_on_validator_change() {
        let old = descriptor(Some(1000), true);
        let journal = Journal::new("job", "http://o/f", old, SegmentPlan::split(1000, 100, 8), None);
        let mut live = descriptor(Some(1000), true);
        live.etag = Some("\"v2\"".to_string());
        let fresh = plan(&live, &DownloadOptions::default(), Some(&journal));
        assert!(fresh
            .segments
            .iter()
            .all(|s| s.status == SegmentStatus::Pending && s.bytes_written == 0));
    }
}
