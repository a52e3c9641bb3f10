//! Error and warning types for a detection run.
//!
//! Fatal conditions abort a run before any image is processed and are
//! returned as [`PipelineError`]. Per-item and run-level conditions that must
//! not stop the run are reported to the progress observer as [`RunWarning`].

use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors raised while starting a run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The parameter file is missing or unreadable, or the run settings are invalid.
    #[error("configuration: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The detector could not be constructed from the calibration data.
    #[error("model initialization: {message}")]
    ModelInit { message: String },

    /// Flatfield correction was requested but the reference image is unusable.
    #[error("could not load flatfield image from {}", path.display())]
    FlatfieldLoad {
        path: PathBuf,
        #[source]
        source: Option<image::ImageError>,
    },

    /// The source directory does not exist or could not be listed.
    #[error("cannot read source directory {}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output directory could not be created.
    #[error("cannot create output directory {}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn model_init(message: impl Into<String>) -> Self {
        Self::ModelInit {
            message: message.into(),
        }
    }
}

/// Non-fatal conditions reported while a run continues.
#[derive(Debug, Clone, PartialEq)]
pub enum RunWarning {
    /// A source file produced no work items: unsupported, undecodable, or OS housekeeping.
    Ingestion { source: PathBuf, reason: String },
    /// The shared output location was unavailable; output went to `fallback`.
    PersistenceFallback { requested: Option<PathBuf>, fallback: PathBuf },
    /// Writing one annotated image failed.
    WriteFailure { display_name: String, reason: String },
}

impl std::fmt::Display for RunWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunWarning::Ingestion { source, reason } => {
                write!(f, "skipped {}: {}", source.display(), reason)
            }
            RunWarning::PersistenceFallback { requested, fallback } => match requested {
                Some(requested) => write!(
                    f,
                    "shared location {} is unavailable, saving to {}",
                    requested.display(),
                    fallback.display()
                ),
                None => write!(
                    f,
                    "no shared location configured, saving to {}",
                    fallback.display()
                ),
            },
            RunWarning::WriteFailure {
                display_name,
                reason,
            } => write!(f, "failed to write {display_name}: {reason}"),
        }
    }
}
