//! Progress reporting for long running operations.

use std::path::PathBuf;

/// The phase a preparation is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreparationPhase {
    /// The configuration and the prerequisites of the strategy are checked.
    Validating,
    /// The difference between the expected and the existing files is computed.
    Reconciling,
    /// Files are linked or copied.
    Materializing,
    /// Files that are no longer needed are removed.
    Removing,
    /// Metadata is persisted.
    Finalizing,
    /// The operation finished.
    Completed,
}

/// A single progress update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// The current phase.
    pub phase: PreparationPhase,
    /// Overall completion between `0.0` and `100.0`.
    pub percent: f64,
    /// The number of files that were processed so far.
    pub files_processed: usize,
    /// The total number of files that will be processed.
    pub total_files: usize,
    /// The number of bytes that were processed so far.
    pub bytes_processed: u64,
    /// The total number of bytes that will be processed.
    pub total_bytes: u64,
    /// The item that is currently being processed, if any.
    pub current_item: Option<PathBuf>,
}

impl ProgressEvent {
    /// Constructs an event for a phase without any file progress.
    pub fn phase(phase: PreparationPhase, percent: f64) -> Self {
        Self {
            phase,
            percent,
            files_processed: 0,
            total_files: 0,
            bytes_processed: 0,
            total_bytes: 0,
            current_item: None,
        }
    }
}

/// A trait for receiving progress of the preparation process.
pub trait Reporter: Send + Sync {
    /// Called whenever progress is made.
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> Reporter for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event);
    }
}

/// Keeps track of file progress during materialization and forwards it to an
/// optional [`Reporter`].
pub(crate) struct ProgressTracker<'a> {
    reporter: Option<&'a dyn Reporter>,
    phase: PreparationPhase,
    total_files: usize,
    total_bytes: u64,
    files_processed: usize,
    bytes_processed: u64,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(
        reporter: Option<&'a dyn Reporter>,
        phase: PreparationPhase,
        total_files: usize,
        total_bytes: u64,
    ) -> Self {
        Self {
            reporter,
            phase,
            total_files,
            total_bytes,
            files_processed: 0,
            bytes_processed: 0,
        }
    }

    pub(crate) fn set_phase(&mut self, phase: PreparationPhase) {
        self.phase = phase;
    }

    pub(crate) fn advance(&mut self, item: PathBuf, bytes: u64) {
        self.files_processed += 1;
        self.bytes_processed += bytes;
        let Some(reporter) = self.reporter else {
            return;
        };
        let percent = if self.total_files == 0 {
            100.0
        } else {
            self.files_processed as f64 * 100.0 / self.total_files as f64
        };
        reporter.on_progress(&ProgressEvent {
            phase: self.phase,
            percent,
            files_processed: self.files_processed,
            total_files: self.total_files,
            bytes_processed: self.bytes_processed,
            total_bytes: self.total_bytes,
            current_item: Some(item),
        });
    }
}

/// Sends a phase-only event to an optional reporter.
pub(crate) fn report_phase(reporter: Option<&dyn Reporter>, phase: PreparationPhase, percent: f64) {
    if let Some(reporter) = reporter {
        reporter.on_progress(&ProgressEvent::phase(phase, percent));
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_tracker_reports_percentages() {
        let events = Mutex::new(Vec::new());
        let reporter = |event: &ProgressEvent| events.lock().push(event.clone());

        let mut tracker =
            ProgressTracker::new(Some(&reporter), PreparationPhase::Materializing, 4, 40);
        tracker.advance(PathBuf::from("a"), 10);
        tracker.advance(PathBuf::from("b"), 10);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].percent, 50.0);
        assert_eq!(events[1].bytes_processed, 20);
        assert_eq!(events[1].current_item.as_deref(), Some(std::path::Path::new("b")));
    }
}
