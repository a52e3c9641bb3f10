pub mod config;
pub mod correction;
pub mod detection;
pub mod error;
pub mod ingest;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod visualize;

pub use config::{ModelCatalog, ModelReference, RunConfiguration};
pub use detection::{
    ContrastDetectorFactory, ContrastModel, DetectorFactory, DetectorSettings, FlakeDetector,
};
pub use error::{PipelineError, RunWarning};
pub use models::{DetectionResult, Flake, FlakeRegion, ImageRecord, SourceKind};
pub use pipeline::{CancellationToken, PipelineController, PipelineState, RunState};
pub use progress::{LoggingObserver, ProgressEvent, ProgressObserver, RunSummary};
