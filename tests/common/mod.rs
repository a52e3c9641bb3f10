#![allow(dead_code, unused_imports)]

mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from flakescan for tests
pub use flakescan::{
    PipelineController, PipelineError, PipelineState, ProgressEvent, RunConfiguration,
    RunWarning,
};
