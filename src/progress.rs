//! Progress reporting to the host.
//!
//! The controller emits a [`ProgressEvent`] after every step. Hosts implement
//! [`ProgressObserver`] to drive a progress bar, a log, or a test recorder.

use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::error::RunWarning;

/// Counters reported when a run ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub total: usize,
    /// Source files that contributed no work items.
    pub skipped_sources: usize,
    /// Annotated images written to disk.
    pub images_written: usize,
    pub output_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Emitted after every step with the literal `(processed, total)` counters.
    Progress { processed: usize, total: usize },
    /// Free-text status line.
    Status(String),
    Warning(RunWarning),
    Completed(RunSummary),
    Cancelled(RunSummary),
    Failed(String),
}

/// Receives progress events from the pipeline controller.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Observer that forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ProgressObserver for LoggingObserver {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Progress { processed, total } => {
                info!("{processed} / {total} images processed")
            }
            ProgressEvent::Status(message) => info!("{message}"),
            ProgressEvent::Warning(warning) => warn!("{warning}"),
            ProgressEvent::Completed(summary) => info!(
                processed = summary.processed,
                skipped = summary.skipped,
                total = summary.total,
                "run complete, output in {}",
                summary.output_directory.display()
            ),
            ProgressEvent::Cancelled(summary) => warn!(
                processed = summary.processed,
                total = summary.total,
                "run cancelled"
            ),
            ProgressEvent::Failed(message) => error!("run failed: {message}"),
        }
    }
}
