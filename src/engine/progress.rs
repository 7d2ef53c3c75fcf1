//! Progress types shared across the engine (spec.md §3, §9 design notes).
//!
//! The original source represents progress records as heterogeneous
//! dictionaries (`{"status": "downloading"}`, `{"done": n, "done%": p}`, …).
//! Here that becomes one sum type, [`ProgressEvent`], matched on by
//! [`super::progress_combiner::ProgressCombiner`] and rendered by the CLI.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// The states a single asset's download can be in (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Starting,
    Downloading,
    Skipped,
    Error,
    ChecksumError,
    Done,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileState::Skipped | FileState::Error | FileState::ChecksumError | FileState::Done
        )
    }
}

/// In-memory per-asset progress (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct FileProgress {
    pub state: FileState,
    pub downloaded: u64,
    pub size: Option<u64>,
}

impl Default for FileProgress {
    fn default() -> Self {
        Self {
            state: FileState::Starting,
            downloaded: 0,
            size: None,
        }
    }
}

/// A terminal or intermediate checksum verdict (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumOutcome {
    Ok,
    Differs,
    /// No digest was computed for this transfer ("-" in the source).
    Unknown,
}

/// A non-terminal or terminal status marker (spec.md §4.4's progress shapes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Downloading,
    Skipped,
    Error,
    SettingMtime,
    Done,
}

/// The sum type every progress record is expressed as (spec.md §9).
///
/// `size` is emitted at most once per stream and precedes any `Done`; `Done`
/// is monotonically non-decreasing in `done` within a single stream. Terminal
/// records are exactly one of `Status{kind: Done | Skipped, ..}` or
/// `Status{kind: Error, ..}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Size(u64),
    Status {
        kind: StatusKind,
        message: Option<String>,
    },
    Done {
        done: u64,
        pct: f64,
    },
    Checksum {
        outcome: ChecksumOutcome,
        status: Option<StatusKind>,
        message: Option<String>,
    },
    /// An informational tally, e.g. ProgressCombiner's "k done, k errored,
    /// k skipped" line (spec.md §4.6).
    Message(String),
}

/// A monotonically-growing, concurrently-readable tally for an entire run
/// (spec.md §3, §9). The enumeration worker writes; the UI thread reads
/// without blocking on the writer.
#[derive(Debug, Default)]
pub struct ItemsSummary {
    files_seen: AtomicU64,
    total_size: AtomicU64,
    has_unknown_sizes: AtomicBool,
    finished: AtomicBool,
    t0: std::sync::OnceLock<Instant>,
}

/// A point-in-time read of [`ItemsSummary`].
#[derive(Debug, Clone, Copy)]
pub struct ItemsSummarySnapshot {
    pub files_seen: u64,
    pub total_size: u64,
    pub has_unknown_sizes: bool,
    pub finished: bool,
    pub elapsed: Option<std::time::Duration>,
}

impl ItemsSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one enumerated asset. `size` is `None` for assets whose size
    /// the archive did not report up front.
    pub fn record_asset(&self, size: Option<u64>) {
        self.t0.get_or_init(Instant::now);
        self.files_seen.fetch_add(1, Ordering::Relaxed);
        match size {
            Some(n) => {
                self.total_size.fetch_add(n, Ordering::Relaxed);
            }
            None => self.has_unknown_sizes.store(true, Ordering::Relaxed),
        }
    }

    /// Latch that enumeration is complete; totals will not grow further.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ItemsSummarySnapshot {
        ItemsSummarySnapshot {
            files_seen: self.files_seen.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
            has_unknown_sizes: self.has_unknown_sizes.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            elapsed: self.t0.get().map(|t0| t0.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_accumulates_known_and_unknown_sizes() {
        let summary = ItemsSummary::new();
        summary.record_asset(Some(100));
        summary.record_asset(None);
        summary.record_asset(Some(50));
        let snap = summary.snapshot();
        assert_eq!(snap.files_seen, 3);
        assert_eq!(snap.total_size, 150);
        assert!(snap.has_unknown_sizes);
        assert!(!snap.finished);
        assert!(snap.elapsed.is_some());
    }

    #[test]
    fn finish_latches() {
        let summary = ItemsSummary::new();
        summary.record_asset(Some(1));
        summary.finish();
        assert!(summary.snapshot().finished);
    }
}
