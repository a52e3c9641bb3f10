//! Built-in flake detector driven by a contrast model.
//!
//! Each model class describes the expected relative contrast of a material
//! layer against the substrate as a mean vector and covariance matrix. Pixels
//! are assigned to the nearest class by Mahalanobis distance and grouped into
//! connected regions.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;
use tracing::debug;

use super::contours::find_regions;
use super::{ContrastModel, DetectorFactory, DetectorSettings, FlakeDetector};
use crate::models::{DetectionResult, Flake};

#[derive(Debug, Deserialize)]
struct ClassEntry {
    contrast: ChannelContrast,
    covariance_matrix: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct ChannelContrast {
    r: f64,
    g: f64,
    b: f64,
}

#[derive(Debug, Clone)]
struct ContrastClass {
    name: String,
    mean: Vector3<f64>,
    inv_covariance: Matrix3<f64>,
}

impl ContrastClass {
    /// Mahalanobis distance of `contrast` from the class mean.
    fn distance(&self, contrast: &Vector3<f64>) -> f64 {
        let d = contrast - self.mean;
        (d.transpose() * self.inv_covariance * d)[0].max(0.0).sqrt()
    }
}

/// Detector built from a contrast model.
#[derive(Debug, Clone)]
pub struct ContrastDetector {
    classes: Vec<ContrastClass>,
    settings: DetectorSettings,
}

impl ContrastDetector {
    pub fn new(model: &ContrastModel, settings: DetectorSettings) -> Result<Self> {
        if settings.stddev_threshold.is_nan() || settings.stddev_threshold <= 0.0 {
            bail!(
                "standard deviation threshold must be positive, got {}",
                settings.stddev_threshold
            );
        }

        let entries: BTreeMap<String, ClassEntry> = model
            .parse()
            .context("contrast model does not match the expected class layout")?;
        if entries.is_empty() {
            bail!("contrast model defines no classes");
        }

        let classes = entries
            .into_iter()
            .map(|(name, entry)| {
                let covariance = to_matrix(&entry.covariance_matrix)
                    .with_context(|| format!("class {name}"))?;
                let inv_covariance = covariance
                    .try_inverse()
                    .filter(|inv| inv.iter().all(|v| v.is_finite()))
                    .context("covariance matrix is singular")
                    .with_context(|| format!("class {name}"))?;
                let c = &entry.contrast;
                Ok(ContrastClass {
                    mean: Vector3::from(settings.channel_order.arrange([c.r, c.g, c.b])),
                    inv_covariance,
                    name,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { classes, settings })
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.name.as_str())
    }
}

impl FlakeDetector for ContrastDetector {
    fn detect(&self, image: &DynamicImage) -> DetectionResult {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        let background = median_background(&rgb);
        let threshold = self.settings.stddev_threshold as f64;

        // Per pixel: assigned class (0 = none) and its score in [0, 1]
        let mut labels = vec![0usize; (width * height) as usize];
        let mut scores = vec![0f32; (width * height) as usize];

        for (x, y, px) in rgb.enumerate_pixels() {
            let contrast = Vector3::from(self.settings.channel_order.arrange(
                std::array::from_fn(|c| px[c] as f64 / background[c] - 1.0),
            ));
            let nearest = self
                .classes
                .iter()
                .enumerate()
                .map(|(idx, class)| (idx, class.distance(&contrast)))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            if let Some((idx, dist)) = nearest {
                if dist <= threshold {
                    let i = (y * width + x) as usize;
                    labels[i] = idx + 1;
                    scores[i] = (1.0 - dist / threshold) as f32;
                }
            }
        }

        let mut flakes = Vec::new();
        for (idx, class) in self.classes.iter().enumerate() {
            let mask = GrayImage::from_fn(width, height, |x, y| {
                if labels[(y * width + x) as usize] == idx + 1 {
                    Luma([255u8])
                } else {
                    Luma([0u8])
                }
            });

            for region in find_regions(&mask, &scores, self.settings.size_threshold) {
                let confidence = region.mean_value().clamp(0.0, 1.0) as f32;
                flakes.push(Flake {
                    class_name: class.name.clone(),
                    class_index: idx,
                    region: region.region,
                    confidence,
                });
            }
        }

        debug!("Contrast detector found {} flakes", flakes.len());
        DetectionResult::new(flakes)
    }
}

/// Factory for [`ContrastDetector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ContrastDetectorFactory;

impl DetectorFactory for ContrastDetectorFactory {
    fn construct(
        &self,
        model: &ContrastModel,
        settings: &DetectorSettings,
    ) -> Result<Box<dyn FlakeDetector>> {
        Ok(Box::new(ContrastDetector::new(model, *settings)?))
    }
}

/// Per-channel median of the image, taken as the substrate colour.
fn median_background(img: &RgbImage) -> [f64; 3] {
    let mut histograms = [[0u64; 256]; 3];
    for px in img.pixels() {
        for c in 0..3 {
            histograms[c][px[c] as usize] += 1;
        }
    }

    let half = (img.width() as u64 * img.height() as u64).div_ceil(2);
    std::array::from_fn(|c| {
        let mut seen = 0;
        for (value, count) in histograms[c].iter().enumerate() {
            seen += count;
            if seen >= half {
                return (value as f64).max(1.0);
            }
        }
        1.0
    })
}

fn to_matrix(rows: &[Vec<f64>]) -> Result<Matrix3<f64>> {
    if rows.len() != 3 || rows.iter().any(|r| r.len() != 3) {
        bail!("covariance matrix must be 3x3");
    }
    Ok(Matrix3::from_fn(|i, j| rows[i][j]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use serde_json::json;

    fn monolayer_model() -> ContrastModel {
        ContrastModel::from_json(json!({
            "1": {
                "contrast": {"r": -0.25, "g": -0.25, "b": -0.25},
                "covariance_matrix": [[0.0004, 0.0, 0.0], [0.0, 0.0004, 0.0], [0.0, 0.0, 0.0004]]
            }
        }))
    }

    #[test]
    fn distance_scales_with_covariance() -> Result<()> {
        let detector = ContrastDetector::new(&monolayer_model(), DetectorSettings::new(10))?;
        let class = &detector.classes[0];
        assert!(class.distance(&Vector3::new(-0.25, -0.25, -0.25)) < 1e-12);
        // One standard deviation (0.02) along a single channel
        let d = class.distance(&Vector3::new(-0.23, -0.25, -0.25));
        assert!((d - 1.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn finds_flake_darker_than_substrate() -> Result<()> {
        let detector = ContrastDetector::new(&monolayer_model(), DetectorSettings::new(10))?;
        let img = RgbImage::from_fn(40, 40, |x, y| {
            if (10..20).contains(&x) && (5..15).contains(&y) {
                Rgb([150, 150, 150])
            } else {
                Rgb([200, 200, 200])
            }
        });

        let result = detector.detect(&DynamicImage::ImageRgb8(img));
        assert_eq!(result.len(), 1);
        let flake = &result.flakes[0];
        assert_eq!(flake.class_name, "1");
        assert_eq!(
            (flake.region.min_x, flake.region.min_y, flake.region.max_x, flake.region.max_y),
            (10, 5, 19, 14)
        );
        assert_eq!(flake.region.area(), 100);
        assert!(flake.confidence > 0.99);
        Ok(())
    }

    #[test]
    fn regions_below_size_threshold_are_ignored() -> Result<()> {
        let detector = ContrastDetector::new(&monolayer_model(), DetectorSettings::new(500))?;
        let img = RgbImage::from_fn(40, 40, |x, y| {
            if x < 5 && y < 5 { Rgb([150, 150, 150]) } else { Rgb([200, 200, 200]) }
        });
        assert!(detector.detect(&DynamicImage::ImageRgb8(img)).is_empty());
        Ok(())
    }

    #[test]
    fn rejects_unusable_models() {
        let settings = DetectorSettings::new(10);
        assert!(ContrastDetector::new(&ContrastModel::from_json(json!({})), settings).is_err());
        assert!(ContrastDetector::new(&ContrastModel::from_json(json!([1, 2])), settings).is_err());
        let singular = ContrastModel::from_json(json!({
            "1": {"contrast": {"r": 0.0, "g": 0.0, "b": 0.0}, "covariance_matrix": [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]}
        }));
        assert!(ContrastDetector::new(&singular, settings).is_err());
        let rank_two = ContrastModel::from_json(json!({
            "1": {"contrast": {"r": 0.0, "g": 0.0, "b": 0.0}, "covariance_matrix": [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]]}
        }));
        assert!(ContrastDetector::new(&rank_two, settings).is_err());
        let bad_shape = ContrastModel::from_json(json!({
            "1": {"contrast": {"r": 0.0, "g": 0.0, "b": 0.0}, "covariance_matrix": [[1.0, 0.0], [0.0, 1.0]]}
        }));
        assert!(ContrastDetector::new(&bad_shape, settings).is_err());
    }
}
