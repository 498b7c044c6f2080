//! Progress reporting for a job (bytes done, rate, ETA).
//!
//! Consumers either poll `JobHandle::progress()` or register an observer in
//! the options; both see the same snapshot type.

use std::time::Duration;

use crate::job::JobState;

/// Snapshot of job progress.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Lifecycle state at snapshot time.
    pub state: JobState,
    /// Bytes confirmed on disk plus in-flight bytes. Monotonically
    /// non-decreasing over the life of a job run.
    pub bytes_done: u64,
    /// Total file size, when the origin declared one.
    pub total_bytes: Option<u64>,
    /// Segments fully completed.
    pub segments_done: usize,
    /// Segments in the plan.
    pub segment_count: usize,
    /// Time since the job was submitted.
    pub elapsed: Duration,
}

impl Progress {
    /// Fraction complete in [0.0, 1.0]; `None` while the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        let total = self.total_bytes?;
        if total == 0 {
            return Some(1.0);
        }
        Some((self.bytes_done as f64 / total as f64).min(1.0))
    }

    /// Percent complete in [0.0, 100.0]; `None` while the total is unknown.
    pub fn percent(&self) -> Option<f64> {
        self.fraction().map(|f| f * 100.0)
    }

    /// Average download rate in bytes per second (0 if no time has passed).
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_done as f64 / secs
    }

    /// Estimated time remaining (None if the rate or total is unknown).
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_bytes?;
        let remaining = total.saturating_sub(self.bytes_done);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let rate = self.bytes_per_sec();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bytes_done: u64, total: Option<u64>, secs: u64) -> Progress {
        Progress {
            state: JobState::Downloading,
            bytes_done,
            total_bytes: total,
            segments_done: 0,
            segment_count: 4,
            elapsed: Duration::from_secs(secs),
        }
    }

    #[test]
    fn fraction_and_percent() {
        let p = sample(250, Some(1000), 1);
        assert_eq!(p.fraction(), Some(0.25));
        assert_eq!(p.percent(), Some(25.0));
        assert_eq!(sample(0, None, 1).fraction(), None);
        assert_eq!(sample(0, Some(0), 1).fraction(), Some(1.0));
    }

    #[test]
    fn rate_and_eta() {
        let p = sample(1000, Some(3000), 2);
        assert_eq!(p.bytes_per_sec(), 500.0);
        assert_eq!(p.eta(), Some(Duration::from_secs(4)));
        // Zero elapsed: no rate, no ETA.
        let p0 = sample(0, Some(3000), 0);
        assert_eq!(p0.bytes_per_sec(), 0.0);
        assert_eq!(p0.eta(), None);
    }

    #[test]
    fn eta_zero_when_done() {
        let p = sample(3000, Some(3000), 5);
        assert_eq!(p.eta(), Some(Duration::ZERO));
    }
}
