pub mod contours;
pub mod contrast;

use std::path::Path;

use image::DynamicImage;
use serde::Deserialize;

use crate::config::DEFAULT_STDDEV_THRESHOLD;
use crate::error::PipelineError;
use crate::models::DetectionResult;

pub use contrast::{ContrastDetector, ContrastDetectorFactory};

/// Calibration data loaded from a model parameter file.
///
/// The pipeline treats it as opaque JSON; detectors interpret it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastModel {
    raw: serde_json::Value,
}

impl ContrastModel {
    pub fn from_json(raw: serde_json::Value) -> Self {
        Self { raw }
    }

    /// Read and parse a parameter file. Any failure is a configuration error.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config_with_source(
                format!("cannot read parameter file {}", path.display()),
                e,
            )
        })?;
        let raw = serde_json::from_str(&text).map_err(|e| {
            PipelineError::config_with_source(
                format!("parameter file {} is not valid JSON", path.display()),
                e,
            )
        })?;
        Ok(Self { raw })
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    /// Deserialize the calibration data into a detector-specific shape.
    pub fn parse<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.raw)
    }
}

/// Order in which colour channels are compared against the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    Rgb,
    #[default]
    Bgr,
}

impl ChannelOrder {
    /// Reorder an RGB triple into this channel order.
    pub fn arrange<T: Copy>(self, rgb: [T; 3]) -> [T; 3] {
        match self {
            ChannelOrder::Rgb => rgb,
            ChannelOrder::Bgr => [rgb[2], rgb[1], rgb[0]],
        }
    }
}

/// Parameters a detector is constructed with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    pub size_threshold: u32,
    pub stddev_threshold: f32,
    pub channel_order: ChannelOrder,
}

impl DetectorSettings {
    pub fn new(size_threshold: u32) -> Self {
        Self {
            size_threshold,
            stddev_threshold: DEFAULT_STDDEV_THRESHOLD,
            channel_order: ChannelOrder::Bgr,
        }
    }
}

/// Finds flakes in one image. Must be deterministic for a fixed model and image.
pub trait FlakeDetector: Send {
    fn detect(&self, image: &DynamicImage) -> DetectionResult;
}

/// Builds a detector from calibration data.
pub trait DetectorFactory: Send + Sync {
    fn construct(
        &self,
        model: &ContrastModel,
        settings: &DetectorSettings,
    ) -> anyhow::Result<Box<dyn FlakeDetector>>;
}

/// Keep only flakes whose confidence is at least `threshold`.
pub fn filter_by_confidence(result: DetectionResult, threshold: f32) -> DetectionResult {
    DetectionResult::new(
        result
            .flakes
            .into_iter()
            .filter(|flake| flake.confidence >= threshold)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Flake, FlakeRegion};

    fn flake(confidence: f32) -> Flake {
        Flake {
            class_name: "1".to_string(),
            class_index: 0,
            region: FlakeRegion::from_box(0, 0, 1, 1),
            confidence,
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let result = DetectionResult::new(vec![flake(0.49), flake(0.5), flake(0.9)]);
        let kept = filter_by_confidence(result, 0.5);
        let confidences: Vec<f32> = kept.flakes.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![0.5, 0.9]);
    }

    #[test]
    fn bgr_reverses_channels() {
        assert_eq!(ChannelOrder::Bgr.arrange([1, 2, 3]), [3, 2, 1]);
        assert_eq!(ChannelOrder::Rgb.arrange([1, 2, 3]), [1, 2, 3]);
    }
}
