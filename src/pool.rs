//! Bounded worker pool driving segment fetches.
//!
//! Workers pull segment indices from a shared queue and report back over a
//! channel. The collector — the caller's thread — is the only place journal
//! mutations and status transitions happen, so they are totally ordered. It
//! also owns the retry schedule and the cancel fan-out: the first permanent
//! failure stops every in-flight fetcher, transient failures only re-queue
//! their own segment.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{io_error_kind, DownloadError, ErrorKind};
use crate::fetcher::{self, FetchContext, FetchOutcome};
use crate::journal::{CommitGate, Journal, JournalStore};
use crate::options::DownloadOptions;
use crate::planner::SegmentStatus;
use crate::probe::RemoteDescriptor;
use crate::retry::{classify, fetch_error_kind, FetchError, RetryDecision, RetryPolicy};
use crate::staging::StagingDir;

/// How often blocked workers and the collector re-check control flags.
const TICK: Duration = Duration::from_millis(100);

/// Inputs shared across one download phase.
pub struct PoolContext<'a> {
    pub url: &'a str,
    pub options: &'a DownloadOptions,
    pub remote: &'a RemoteDescriptor,
    pub staging: &'a StagingDir,
    pub store: &'a JournalStore,
    /// Caller-driven cancel signal.
    pub cancel: &'a AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct WorkItem {
    index: usize,
    attempt: u32,
}

enum Event {
    Started { index: usize },
    Finished {
        index: usize,
        attempt: u32,
        result: Result<FetchOutcome, FetchError>,
    },
}

struct WorkQueue {
    queue: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
    /// Set once the collector has nothing further to hand out.
    done: AtomicBool,
}

impl WorkQueue {
    fn next(&self, stop: &AtomicBool) -> Option<WorkItem> {
        let mut q = self.queue.lock().unwrap();
        loop {
            if self.done.load(Ordering::Relaxed) || stop.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(item) = q.pop_front() {
                return Some(item);
            }
            let (guard, _) = self.available.wait_timeout(q, TICK).unwrap();
            q = guard;
        }
    }

    fn push(&self, item: WorkItem) {
        self.queue.lock().unwrap().push_back(item);
        self.available.notify_one();
    }

    fn drain(&self) -> Vec<WorkItem> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    fn close(&self) {
        self.done.store(true, Ordering::Relaxed);
        self.available.notify_all();
    }
}

fn commit_error(e: anyhow::Error) -> DownloadError {
    let kind = e
        .downcast_ref::<std::io::Error>()
        .map(io_error_kind)
        .unwrap_or(ErrorKind::Io);
    DownloadError::new(kind, e.context("journal commit failed"))
}

/// Download every incomplete segment of the journal's plan. Returns once all
/// segments completed, the caller cancelled, or a permanent failure stopped
/// the run. `on_progress` is invoked from the collector at most once per
/// `progress_interval` with (aggregate bytes, completed segment count).
pub fn run_segments(
    ctx: &PoolContext<'_>,
    journal: &mut Journal,
    on_progress: &mut dyn FnMut(u64, usize),
) -> Result<(), DownloadError> {
    let incomplete = journal.plan.incomplete();
    if incomplete.is_empty() {
        return Ok(());
    }

    let policy = RetryPolicy {
        max_attempts: ctx.options.max_attempts.max(1),
        ..RetryPolicy::default()
    };
    let whole_file = journal.plan.segment_count() == 1;
    let workers = ctx
        .options
        .max_parallelism
        .max(1)
        .min(incomplete.len());

    // Live byte counters, one per segment; workers own their slot.
    let counters: Arc<Vec<AtomicU64>> = Arc::new(
        journal
            .plan
            .segments
            .iter()
            .map(|s| AtomicU64::new(s.bytes_written))
            .collect(),
    );
    // Frozen range table for workers; status and bytes live in the journal.
    let spec: Vec<(u64, Option<u64>)> = journal
        .plan
        .segments
        .iter()
        .map(|s| (s.start, s.end))
        .collect();

    let stop = Arc::new(AtomicBool::new(false));
    let work = WorkQueue {
        queue: Mutex::new(incomplete.iter().map(|&index| WorkItem { index, attempt: 1 }).collect()),
        available: Condvar::new(),
        done: AtomicBool::new(false),
    };
    let (event_tx, event_rx) = mpsc::channel::<Event>();

    let segment_digest = ctx.options.expected_digest.as_ref().map(|d| d.algorithm);

    tracing::info!(
        segments = journal.plan.segment_count(),
        incomplete = incomplete.len(),
        workers,
        "starting segment downloads"
    );

    let result = std::thread::scope(|scope| {
        for _ in 0..workers {
            let event_tx = event_tx.clone();
            let counters = Arc::clone(&counters);
            let stop = Arc::clone(&stop);
            let work = &work;
            let spec = &spec;
            scope.spawn(move || {
                let fetch_ctx = FetchContext {
                    url: ctx.url,
                    options: ctx.options,
                    remote: ctx.remote,
                    segment_digest,
                    stop: &stop,
                };
                while let Some(item) = work.next(&stop) {
                    if event_tx.send(Event::Started { index: item.index }).is_err() {
                        break;
                    }
                    let (start, end) = spec[item.index];
                    let seg = crate::planner::Segment {
                        index: item.index,
                        start,
                        end,
                        status: SegmentStatus::InFlight,
                        bytes_written: counters[item.index].load(Ordering::Relaxed),
                        digest: None,
                    };
                    let result = fetcher::fetch_segment(
                        &fetch_ctx,
                        &seg,
                        &ctx.staging.segment_path(item.index),
                        whole_file,
                        &counters[item.index],
                    );
                    if event_tx
                        .send(Event::Finished {
                            index: item.index,
                            attempt: item.attempt,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
        drop(event_tx);

        collect(
            ctx,
            journal,
            &work,
            &event_rx,
            &counters,
            &stop,
            &policy,
            on_progress,
        )
    });

    // Fold live counters into the journal one last time.
    sync_counters(journal, &counters);
    journal.bytes_downloaded = journal.plan.bytes_on_disk();
    if let Err(e) = ctx.store.commit(journal) {
        tracing::warn!(error = %e, "final journal commit failed");
    }

    result
}

/// Single-context event loop: the only mutator of the journal.
#[allow(clippy::too_many_arguments)]
fn collect(
    ctx: &PoolContext<'_>,
    journal: &mut Journal,
    work: &WorkQueue,
    events: &mpsc::Receiver<Event>,
    counters: &[AtomicU64],
    stop: &Arc<AtomicBool>,
    policy: &RetryPolicy,
    on_progress: &mut dyn FnMut(u64, usize),
) -> Result<(), DownloadError> {
    let mut outstanding = journal.plan.incomplete().len();
    let mut retries: Vec<(Instant, WorkItem)> = Vec::new();
    let mut reset_once: HashSet<usize> = HashSet::new();
    let mut first_error: Option<(usize, FetchError)> = None;
    let mut gate = CommitGate::default();
    let mut last_emit = Instant::now();
    let mut reported_bytes = 0u64;
    let mut gated_bytes = journal.plan.bytes_on_disk();
    let mut stopped = false;

    let outcome = loop {
        if outstanding == 0 {
            break None;
        }

        // Propagate a caller cancel exactly once.
        if ctx.cancel.load(Ordering::Relaxed) && !stopped {
            tracing::info!("cancellation requested, stopping fetchers");
            stop.store(true, Ordering::Relaxed);
            stopped = true;
        }

        // On stop, whatever is queued or awaiting retry will never run.
        if stopped {
            let mut abandoned = work.drain();
            abandoned.extend(retries.drain(..).map(|(_, item)| item));
            for item in abandoned {
                let seg = &mut journal.plan.segments[item.index];
                seg.bytes_written = counters[item.index].load(Ordering::Relaxed);
                outstanding -= 1;
            }
        } else {
            // Re-dispatch retries that have served their backoff.
            let now = Instant::now();
            let mut i = 0;
            while i < retries.len() {
                if retries[i].0 <= now {
                    let (_, item) = retries.swap_remove(i);
                    work.push(item);
                } else {
                    i += 1;
                }
            }
        }

        let event = match events.recv_timeout(TICK) {
            Ok(ev) => Some(ev),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                break Some(DownloadError::msg(
                    ErrorKind::InternalInvariant,
                    "all workers exited with segments outstanding",
                ));
            }
        };

        match event {
            Some(Event::Started { index }) => {
                let seg = &mut journal.plan.segments[index];
                if seg.status != SegmentStatus::InFlight {
                    seg.status = SegmentStatus::InFlight;
                    if let Err(e) = ctx.store.commit(journal) {
                        break Some(commit_error(e));
                    }
                    gate.committed();
                }
            }
            Some(Event::Finished {
                index,
                attempt,
                result,
            }) => match result {
                Ok(outcome) => {
                    let seg = &mut journal.plan.segments[index];
                    seg.status = SegmentStatus::Completed;
                    seg.bytes_written = counters[index].load(Ordering::Relaxed);
                    seg.digest = outcome.digest;
                    journal.bytes_downloaded = journal.plan.bytes_on_disk();
                    if let Err(e) = ctx.store.commit(journal) {
                        break Some(commit_error(e));
                    }
                    gate.committed();
                    outstanding -= 1;
                    tracing::debug!(index, attempt, "segment completed");
                }
                Err(FetchError::Cancelled) => {
                    // Keep in_flight: restart demotes it to pending cleanly.
                    let seg = &mut journal.plan.segments[index];
                    seg.bytes_written = counters[index].load(Ordering::Relaxed);
                    outstanding -= 1;
                }
                Err(e) => {
                    let decision = if stopped {
                        RetryDecision::NoRetry
                    } else {
                        policy.decide(attempt, classify(&e))
                    };
                    match decision {
                        RetryDecision::RetryAfter(delay) => {
                            tracing::warn!(
                                index,
                                attempt,
                                error = %e,
                                delay_ms = delay.as_millis() as u64,
                                "segment failed, will retry"
                            );
                            let seg = &mut journal.plan.segments[index];
                            seg.bytes_written = counters[index].load(Ordering::Relaxed);
                            retries.push((
                                Instant::now() + delay,
                                WorkItem {
                                    index,
                                    attempt: attempt + 1,
                                },
                            ));
                        }
                        RetryDecision::NoRetry => {
                            if matches!(e, FetchError::StagingInconsistent { .. })
                                && !stopped
                                && reset_once.insert(index)
                            {
                                // Reset the segment and refetch it from zero.
                                tracing::warn!(index, error = %e, "resetting inconsistent segment");
                                let path = ctx.staging.segment_path(index);
                                if let Err(io) = std::fs::remove_file(&path) {
                                    if io.kind() != std::io::ErrorKind::NotFound {
                                        break Some(DownloadError::new(
                                            io_error_kind(&io),
                                            anyhow::Error::new(io)
                                                .context(format!("reset {}", path.display())),
                                        ));
                                    }
                                }
                                counters[index].store(0, Ordering::Relaxed);
                                let seg = &mut journal.plan.segments[index];
                                seg.status = SegmentStatus::Pending;
                                seg.bytes_written = 0;
                                seg.digest = None;
                                if let Err(e) = ctx.store.commit(journal) {
                                    break Some(commit_error(e));
                                }
                                gate.committed();
                                work.push(WorkItem { index, attempt: 1 });
                            } else {
                                tracing::warn!(index, attempt, error = %e, "segment failed permanently");
                                let seg = &mut journal.plan.segments[index];
                                seg.status = SegmentStatus::Failed;
                                seg.bytes_written = counters[index].load(Ordering::Relaxed);
                                if let Err(e) = ctx.store.commit(journal) {
                                    break Some(commit_error(e));
                                }
                                gate.committed();
                                outstanding -= 1;
                                if first_error.is_none() {
                                    first_error = Some((index, e));
                                }
                                // Permanent failure cancels the peers.
                                stop.store(true, Ordering::Relaxed);
                                stopped = true;
                            }
                        }
                    }
                }
            },
            None => {}
        }

        // Coalesced progress commit and throttled observer emission.
        let live: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        if live > gated_bytes {
            let delta = live - gated_bytes;
            gated_bytes = live;
            if gate.record(delta) {
                sync_counters(journal, counters);
                journal.bytes_downloaded = journal.plan.bytes_on_disk();
                if let Err(e) = ctx.store.commit(journal) {
                    break Some(commit_error(e));
                }
                gate.committed();
            }
        }
        if last_emit.elapsed() >= ctx.options.progress_interval {
            let done = journal
                .plan
                .segments
                .iter()
                .filter(|s| s.status == SegmentStatus::Completed)
                .count();
            reported_bytes = reported_bytes.max(live);
            on_progress(reported_bytes, done);
            last_emit = Instant::now();
        }
    };

    if outcome.is_some() {
        stop.store(true, Ordering::Relaxed);
    }
    work.close();

    if let Some(err) = outcome {
        return Err(err);
    }
    if ctx.cancel.load(Ordering::Relaxed) {
        return Err(DownloadError::msg(ErrorKind::Cancelled, "cancelled by caller"));
    }
    if let Some((index, e)) = first_error {
        let kind = fetch_error_kind(&e);
        return Err(DownloadError::new(
            kind,
            anyhow::Error::new(e).context(format!("segment {} failed", index)),
        ));
    }
    // Final observer emission so callers see 100%.
    let live: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    let done = journal
        .plan
        .segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Completed)
        .count();
    on_progress(reported_bytes.max(live), done);
    Ok(())
}

fn sync_counters(journal: &mut Journal, counters: &[AtomicU64]) {
    for seg in &mut journal.plan.segments {
        if seg.status != SegmentStatus::Completed {
            seg.bytes_written = counters[seg.index].load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_queue_hands_out_and_closes() {
        let q = WorkQueue {
            queue: Mutex::new(VecDeque::from(vec![WorkItem {
                index: 0,
                attempt: 1,
            }])),
            available: Condvar::new(),
            done: AtomicBool::new(false),
        };
        let stop = AtomicBool::new(false);
        let item = q.next(&stop).unwrap();
        assert_eq!(item.index, 0);
        q.close();
        assert!(q.next(&stop).is_none());
    }

    #[test]
    fn work_queue_respects_stop() {
        let q = WorkQueue {
            queue: Mutex::new(VecDeque::from(vec![WorkItem {
                index: 0,
                attempt: 1,
            }])),
            available: Condvar::new(),
            done: AtomicBool::new(false),
        };
        let stop = AtomicBool::new(true);
        assert!(q.next(&stop).is_none());
    }
}
