//! ProgressCombiner (spec.md §4.6), ported from the `ProgressCombiner`
//! dataclass and its `feed`/`set_status`/`get_done` methods in
//! `lincbrain/download.py`.
//!
//! Folds the per-entry progress streams of a Zarr asset's many
//! `FileDownloader`s into one outer stream, tagging each inner record with
//! its entry path on the way in and producing untagged outer
//! [`ProgressEvent`]s on the way out.

use std::collections::HashMap;

use super::progress::{ChecksumOutcome, FileProgress, FileState, ProgressEvent, StatusKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OuterStatus {
    Downloading,
    Done,
    Error,
    Skipped,
}

/// Combines many inner per-entry progress streams into one outer stream for
/// a single Zarr asset.
pub struct ProgressCombiner {
    entries: HashMap<String, FileProgress>,
    /// Total expected bytes for the whole asset, known up front from the
    /// remote entry list (spec.md §4.6).
    zarr_size: u64,
    #[allow(dead_code)]
    file_qty: usize,
    /// Running denominator for the outer `done%`, built from inner `{size}`
    /// records as they arrive — independent of `zarr_size`.
    maxsize: u64,
    downloaded_total: u64,
    emitted_outer_size: bool,
    outer_status: Option<OuterStatus>,
    done_count: usize,
    errored_count: usize,
    skipped_count: usize,
}

impl ProgressCombiner {
    pub fn new(zarr_size: u64, file_qty: usize) -> Self {
        Self {
            entries: HashMap::new(),
            zarr_size,
            file_qty,
            maxsize: 0,
            downloaded_total: 0,
            emitted_outer_size: false,
            outer_status: None,
            done_count: 0,
            errored_count: 0,
            skipped_count: 0,
        }
    }

    fn entry(&mut self, path: &str) -> &mut FileProgress {
        self.entries.entry(path.to_string()).or_default()
    }

    /// Feed one inner progress record tagged with its entry path; returns
    /// whatever outer records this causes to be emitted, in order.
    pub fn feed(&mut self, path: &str, event: &ProgressEvent) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        match event {
            ProgressEvent::Size(n) => {
                self.entry(path).size = Some(*n);
                if !self.emitted_outer_size {
                    self.emitted_outer_size = true;
                    out.push(ProgressEvent::Size(self.zarr_size));
                }
                self.maxsize += n;
                let any_downloading = self
                    .entries
                    .values()
                    .any(|e| e.state == FileState::Downloading);
                if any_downloading {
                    out.push(self.done_event());
                }
            }
            ProgressEvent::Done { done, .. } => {
                let prev = self.entry(path).downloaded;
                self.downloaded_total = self.downloaded_total - prev + *done;
                self.entry(path).downloaded = *done;
                self.entry(path).state = FileState::Downloading;
                out.push(self.done_event());
                if let Some(status) = self.maybe_status_transition(Some(OuterStatus::Downloading))
                {
                    out.push(status);
                }
            }
            ProgressEvent::Status { kind, message } => {
                match kind {
                    StatusKind::Downloading => {
                        self.entry(path).state = FileState::Downloading;
                        if let Some(status) =
                            self.maybe_status_transition(Some(OuterStatus::Downloading))
                        {
                            out.push(status);
                        }
                    }
                    StatusKind::Skipped => {
                        self.transition_terminal(path, FileState::Skipped);
                        self.skipped_count += 1;
                        out.push(self.tally_event());
                        if let Some(status) = self.maybe_terminal_status() {
                            out.push(status);
                        }
                    }
                    StatusKind::Error => {
                        self.subtract_errored_size(path);
                        self.transition_terminal(path, FileState::Error);
                        self.errored_count += 1;
                        out.push(self.tally_event());
                        if let Some(status) = self.maybe_terminal_status() {
                            out.push(status);
                        }
                        let _ = message;
                    }
                    StatusKind::SettingMtime => {}
                    StatusKind::Done => {
                        self.transition_terminal(path, FileState::Done);
                        self.done_count += 1;
                        out.push(self.tally_event());
                        if let Some(status) = self.maybe_terminal_status() {
                            out.push(status);
                        }
                    }
                }
            }
            ProgressEvent::Checksum {
                outcome, status, ..
            } => {
                if *outcome == ChecksumOutcome::Differs {
                    self.subtract_errored_size(path);
                    self.transition_terminal(path, FileState::ChecksumError);
                    self.errored_count += 1;
                    out.push(self.tally_event());
                    if let Some(s) = self.maybe_terminal_status() {
                        out.push(s);
                    }
                }
                let _ = status;
            }
            ProgressEvent::Message(_) => {}
        }
        out
    }

    fn subtract_errored_size(&mut self, path: &str) {
        if let Some(size) = self.entries.get(path).and_then(|e| e.size) {
            self.maxsize = self.maxsize.saturating_sub(size);
        }
    }

    fn transition_terminal(&mut self, path: &str, state: FileState) {
        self.entry(path).state = state;
    }

    fn done_event(&self) -> ProgressEvent {
        let pct = if self.maxsize == 0 {
            0.0
        } else {
            self.downloaded_total as f64 / self.maxsize as f64 * 100.0
        };
        ProgressEvent::Done {
            done: self.downloaded_total,
            pct,
        }
    }

    fn tally_event(&self) -> ProgressEvent {
        let mut parts = Vec::new();
        if self.done_count > 0 {
            parts.push(format!("{} done", self.done_count));
        }
        if self.errored_count > 0 {
            parts.push(format!("{} errored", self.errored_count));
        }
        if self.skipped_count > 0 {
            parts.push(format!("{} skipped", self.skipped_count));
        }
        ProgressEvent::Message(parts.join(", "))
    }

    fn maybe_status_transition(&mut self, candidate: Option<OuterStatus>) -> Option<ProgressEvent> {
        if self.outer_status.is_some() {
            return None;
        }
        self.outer_status = candidate;
        candidate.map(Self::status_event)
    }

    /// Once every entry has reached a terminal state, derive the outer
    /// status: `error` if any errored, else `done` if any completed, else
    /// `skipped` (spec.md §4.6).
    fn maybe_terminal_status(&mut self) -> Option<ProgressEvent> {
        if self.entries.is_empty() || !self.entries.values().all(|e| e.state.is_terminal()) {
            return None;
        }
        let final_status = if self.entries.values().any(|e| {
            matches!(e.state, FileState::Error | FileState::ChecksumError)
        }) {
            OuterStatus::Error
        } else if self.entries.values().any(|e| e.state == FileState::Done) {
            OuterStatus::Done
        } else {
            OuterStatus::Skipped
        };
        if self.outer_status == Some(final_status) {
            return None;
        }
        self.outer_status = Some(final_status);
        Some(Self::status_event(final_status))
    }

    fn status_event(status: OuterStatus) -> ProgressEvent {
        let kind = match status {
            OuterStatus::Downloading => StatusKind::Downloading,
            OuterStatus::Done => StatusKind::Done,
            OuterStatus::Error => StatusKind::Error,
            OuterStatus::Skipped => StatusKind::Skipped,
        };
        ProgressEvent::Status { kind, message: None }
    }
}
