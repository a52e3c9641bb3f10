//! Batch pipeline controller.
//!
//! A run moves through `Idle -> Ingesting -> Processing -> Done`, with
//! `Failed` reached when setup fails and `Cancelled` when the host stops it.
//! [`PipelineController::step`] performs exactly one unit of work (one source
//! file while ingesting, one image record while processing) and returns, so
//! the host decides when the next step runs. [`PipelineController::drive`]
//! is a host that yields to the tokio scheduler between steps.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{DynamicImage, RgbImage};
use tracing::{debug, error, info, warn};

use crate::config::{ModelReference, RunConfiguration};
use crate::correction::{load_flatfield, remove_vignette};
use crate::detection::{
    filter_by_confidence, ContrastDetectorFactory, ContrastModel, DetectorFactory,
    DetectorSettings, FlakeDetector,
};
use crate::error::{PipelineError, RunWarning};
use crate::ingest::{ingest_file, list_sources};
use crate::models::ImageRecord;
use crate::output::resolve_output_directory;
use crate::progress::{ProgressEvent, ProgressObserver, RunSummary};
use crate::visualize::{persist, visualize_flakes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Ingesting,
    Processing,
    Done,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_running(self) -> bool {
        matches!(self, PipelineState::Ingesting | PipelineState::Processing)
    }
}

/// Shared flag the host sets to stop a run at the next step boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Mutable bookkeeping for one run. Created fresh by every `start`.
#[derive(Debug, Default)]
pub struct RunState {
    /// Source files not yet ingested, in listing order.
    pub pending_sources: VecDeque<PathBuf>,
    /// Records not yet processed, in ingestion order.
    pub queue: VecDeque<ImageRecord>,
    /// Number of records taken off the queue.
    pub cursor: usize,
    pub output_directory: PathBuf,
    pub processed: usize,
    pub skipped: usize,
    pub total: usize,
    pub skipped_sources: usize,
    pub images_written: usize,
}

impl RunState {
    fn new(sources: Vec<PathBuf>, output_directory: PathBuf) -> Self {
        Self {
            pending_sources: sources.into(),
            output_directory,
            ..Default::default()
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            processed: self.processed,
            skipped: self.skipped,
            total: self.total,
            skipped_sources: self.skipped_sources,
            images_written: self.images_written,
            output_directory: self.output_directory.clone(),
        }
    }
}

/// What happened to one image record.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Written { path: PathBuf, flakes: usize },
    NoDetections,
    WriteFailed(String),
}

/// Everything a run owns besides its counters.
struct ActiveRun {
    config: RunConfiguration,
    detector: Box<dyn FlakeDetector>,
    flatfield: Option<RgbImage>,
    cancel: CancellationToken,
    state: RunState,
}

pub struct PipelineController {
    observer: Arc<dyn ProgressObserver>,
    factory: Arc<dyn DetectorFactory>,
    state: PipelineState,
    run: Option<ActiveRun>,
    summary: Option<RunSummary>,
}

impl PipelineController {
    /// Create a controller using the built-in contrast detector
    pub fn new(observer: Arc<dyn ProgressObserver>) -> Self {
        Self {
            observer,
            factory: Arc::new(ContrastDetectorFactory),
            state: PipelineState::Idle,
            run: None,
            summary: None,
        }
    }

    /// Use a different detection capability
    pub fn with_detector_factory(mut self, factory: Arc<dyn DetectorFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn run_state(&self) -> Option<&RunState> {
        self.run.as_ref().map(|run| &run.state)
    }

    /// Summary of the last run that reached `Done` or `Cancelled`.
    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    pub fn cancellation_token(&self) -> Option<CancellationToken> {
        self.run.as_ref().map(|run| run.cancel.clone())
    }

    /// Begin a new run, replacing any previous one.
    ///
    /// All fatal checks happen here, before the output directory is created
    /// and before any image is touched.
    pub fn start(
        &mut self,
        config: RunConfiguration,
        model: &ModelReference,
        source_dir: &Path,
    ) -> Result<CancellationToken, PipelineError> {
        if let Some(previous) = self.run.take() {
            if self.state.is_running() {
                warn!(
                    "Abandoning previous run with {} images left",
                    previous.state.queue.len()
                );
                self.emit(ProgressEvent::Status(
                    "Previous run abandoned, starting a new one".to_string(),
                ));
            }
        }
        self.summary = None;
        self.state = PipelineState::Idle;

        match self.prepare(config, model, source_dir) {
            Ok(run) => {
                let token = run.cancel.clone();
                info!(
                    "Starting run over {} source files from {}",
                    run.state.pending_sources.len(),
                    source_dir.display()
                );
                self.run = Some(run);
                self.state = PipelineState::Ingesting;
                self.emit(ProgressEvent::Progress {
                    processed: 0,
                    total: 0,
                });
                Ok(token)
            }
            Err(e) => {
                error!("Run failed to start: {}", e);
                self.state = PipelineState::Failed;
                self.emit(ProgressEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn prepare(
        &self,
        config: RunConfiguration,
        model: &ModelReference,
        source_dir: &Path,
    ) -> Result<ActiveRun, PipelineError> {
        config.validate()?;

        let parameter_path = model.locate()?;
        let contrast_model = ContrastModel::load(&parameter_path)?;
        let detector = self
            .factory
            .construct(&contrast_model, &DetectorSettings::new(config.size_threshold))
            .map_err(|e| PipelineError::model_init(format!("{e:#}")))?;

        let flatfield = if config.use_flatfield {
            let path = config
                .flatfield_path
                .as_deref()
                .ok_or_else(|| PipelineError::config("flatfield path missing"))?;
            Some(load_flatfield(path)?)
        } else {
            None
        };

        let listing = list_sources(source_dir).map_err(|source| PipelineError::Source {
            path: source_dir.to_path_buf(),
            source,
        })?;

        let resolved = resolve_output_directory(source_dir, &config)?;
        if let Some(warning) = resolved.fallback {
            warn!("{}", warning);
            self.emit(ProgressEvent::Warning(warning));
        }
        for path in listing.housekeeping {
            self.emit(ProgressEvent::Warning(RunWarning::Ingestion {
                source: path,
                reason: "housekeeping file".to_string(),
            }));
        }

        Ok(ActiveRun {
            config,
            detector,
            flatfield,
            cancel: CancellationToken::new(),
            state: RunState::new(listing.sources, resolved.directory),
        })
    }

    /// Perform one unit of work and report progress. Returns the state afterwards.
    pub fn step(&mut self) -> PipelineState {
        if !self.state.is_running() {
            return self.state;
        }
        let Some(run) = self.run.as_mut() else {
            return self.state;
        };

        if run.cancel.is_cancelled() {
            if self.state == PipelineState::Ingesting {
                run.state.total = run.state.queue.len();
            }
            info!("Run cancelled after {} of {} images", run.state.cursor, run.state.total);
            return self.finish(PipelineState::Cancelled);
        }

        match self.state {
            PipelineState::Ingesting => {
                ingest_next(run, self.observer.as_ref());
                if run.state.pending_sources.is_empty() {
                    run.state.total = run.state.queue.len();
                    self.state = PipelineState::Processing;
                    let message = format!(
                        "Ingestion finished: {} images queued, {} sources skipped",
                        run.state.total, run.state.skipped_sources
                    );
                    self.emit(ProgressEvent::Status(message));
                    return self.finish_if_drained();
                }
                self.state
            }
            PipelineState::Processing => {
                process_next(run, self.observer.as_ref());
                self.finish_if_drained()
            }
            other => other,
        }
    }

    /// Run steps until the run ends, yielding to the scheduler between steps.
    pub async fn drive(&mut self) -> PipelineState {
        while self.state.is_running() {
            self.step();
            tokio::task::yield_now().await;
        }
        self.state
    }

    fn finish_if_drained(&mut self) -> PipelineState {
        match &self.run {
            Some(run) if run.state.cursor == run.state.total => self.finish(PipelineState::Done),
            _ => self.state,
        }
    }

    fn finish(&mut self, state: PipelineState) -> PipelineState {
        let Some(run) = self.run.as_mut() else {
            return self.state;
        };
        let summary = run.state.summary();
        // Abandon anything left over when cancelled
        run.state.pending_sources.clear();
        run.state.queue.clear();

        self.state = state;
        self.summary = Some(summary.clone());
        match state {
            PipelineState::Cancelled => self.emit(ProgressEvent::Cancelled(summary)),
            _ => {
                info!(
                    "Run complete: {} processed, {} skipped of {}",
                    summary.processed, summary.skipped, summary.total
                );
                self.emit(ProgressEvent::Completed(summary))
            }
        }
        state
    }

    fn emit(&self, event: ProgressEvent) {
        self.observer.on_event(event);
    }
}

fn ingest_next(run: &mut ActiveRun, observer: &dyn ProgressObserver) {
    let Some(path) = run.state.pending_sources.pop_front() else {
        return;
    };

    match ingest_file(&path) {
        Ok(records) => {
            debug!("Ingested {} records from {}", records.len(), path.display());
            run.state.queue.extend(records);
        }
        Err(e) => {
            warn!("Skipping {}: {}", path.display(), e);
            run.state.skipped_sources += 1;
            observer.on_event(ProgressEvent::Warning(RunWarning::Ingestion {
                source: path,
                reason: e.to_string(),
            }));
        }
    }

    observer.on_event(ProgressEvent::Progress {
        processed: run.state.processed,
        total: run.state.queue.len(),
    });
}

fn process_next(run: &mut ActiveRun, observer: &dyn ProgressObserver) {
    let Some(record) = run.state.queue.pop_front() else {
        return;
    };
    run.state.cursor += 1;

    let outcome = process_record(
        &record,
        run.detector.as_ref(),
        run.flatfield.as_ref(),
        &run.config,
        &run.state.output_directory,
    );

    match outcome {
        ItemOutcome::Written { path, flakes } => {
            info!("Processed {} with {} flakes detected", record.display_name, flakes);
            debug!("Wrote {}", path.display());
            run.state.processed += 1;
            run.state.images_written += 1;
        }
        ItemOutcome::NoDetections => {
            info!("Processed {} with no flakes detected", record.display_name);
            run.state.processed += 1;
        }
        ItemOutcome::WriteFailed(reason) => {
            warn!("Failed to write {}: {}", record.display_name, reason);
            run.state.skipped += 1;
            observer.on_event(ProgressEvent::Warning(RunWarning::WriteFailure {
                display_name: record.display_name.clone(),
                reason,
            }));
        }
    }

    observer.on_event(ProgressEvent::Progress {
        processed: run.state.processed,
        total: run.state.total,
    });
}

/// Correct, detect, filter, visualize and write one record.
pub fn process_record(
    record: &ImageRecord,
    detector: &dyn FlakeDetector,
    flatfield: Option<&RgbImage>,
    config: &RunConfiguration,
    output_dir: &Path,
) -> ItemOutcome {
    let corrected: DynamicImage;
    let image = match flatfield {
        Some(field) => {
            corrected = remove_vignette(&record.pixels, field);
            &corrected
        }
        None => &record.pixels,
    };

    let flakes = filter_by_confidence(detector.detect(image), config.confidence_threshold);
    if flakes.is_empty() {
        return ItemOutcome::NoDetections;
    }

    let annotated = visualize_flakes(&flakes, image, config.confidence_threshold);
    match persist(&annotated, output_dir, &record.output_file_name()) {
        Ok(path) => ItemOutcome::Written {
            path,
            flakes: flakes.len(),
        },
        Err(e) => ItemOutcome::WriteFailed(format!("{e:#}")),
    }
}
