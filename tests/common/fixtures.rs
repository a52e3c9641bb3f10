use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flakescan::{
    ContrastModel, DetectionResult, DetectorFactory, DetectorSettings, Flake, FlakeDetector,
    FlakeRegion, ModelReference, ProgressEvent, ProgressObserver, RunWarning,
};
use image::{DynamicImage, Rgb, RgbImage};
use tempfile::TempDir;

pub const IMAGE_SIZE: u32 = 32;
pub const BACKGROUND: u8 = 200;
pub const PARAMETER_FILE: &str = "GMM_test.json";

/// Collects every event the controller emits.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("observer lock poisoned").clone()
    }

    pub fn warnings(&self) -> Vec<RunWarning> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Warning(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<(usize, usize)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress { processed, total } => Some((processed, total)),
                _ => None,
            })
            .collect()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_event(&self, event: ProgressEvent) {
        self.events.lock().expect("observer lock poisoned").push(event);
    }
}

/// Detector that reads its answer from the red channel of pixel (0, 0).
///
/// A marker of `n > 0` yields one flake with confidence `n / 100`; zero yields nothing.
pub struct MarkerDetector;

impl FlakeDetector for MarkerDetector {
    fn detect(&self, image: &DynamicImage) -> DetectionResult {
        let marker = image.to_rgb8().get_pixel(0, 0)[0];
        if marker == 0 {
            return DetectionResult::default();
        }
        DetectionResult::new(vec![Flake {
            class_name: "1".to_string(),
            class_index: 0,
            region: FlakeRegion::from_box(4, 4, 12, 12),
            confidence: marker as f32 / 100.0,
        }])
    }
}

pub struct MarkerDetectorFactory;

impl DetectorFactory for MarkerDetectorFactory {
    fn construct(
        &self,
        _model: &ContrastModel,
        _settings: &DetectorSettings,
    ) -> anyhow::Result<Box<dyn FlakeDetector>> {
        Ok(Box::new(MarkerDetector))
    }
}

pub struct FailingDetectorFactory;

impl DetectorFactory for FailingDetectorFactory {
    fn construct(
        &self,
        _model: &ContrastModel,
        _settings: &DetectorSettings,
    ) -> anyhow::Result<Box<dyn FlakeDetector>> {
        anyhow::bail!("calibration data rejected")
    }
}

/// Temporary workspace with `images/` and `Models/` folders.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        std::fs::create_dir(dir.path().join("images")).expect("Failed to create images dir");
        std::fs::create_dir(dir.path().join("Models")).expect("Failed to create models dir");
        Self { dir }
    }

    pub fn images(&self) -> PathBuf {
        self.dir.path().join("images")
    }

    pub fn models(&self) -> PathBuf {
        self.dir.path().join("Models")
    }

    /// Local fallback directory next to `images/`.
    pub fn local_output(&self) -> PathBuf {
        self.dir.path().join("images_detected")
    }

    /// Write a one-class contrast model and return a reference to it.
    pub fn write_model(&self) -> ModelReference {
        std::fs::write(self.models().join(PARAMETER_FILE), MONOLAYER_MODEL)
            .expect("Failed to write parameter file");
        ModelReference::new(self.models(), PARAMETER_FILE)
    }

    pub fn missing_model(&self) -> ModelReference {
        ModelReference::new(self.models(), "does_not_exist.json")
    }
}

/// Flakes 25% darker than the substrate in every channel.
pub const MONOLAYER_MODEL: &str = r#"{
    "1": {
        "contrast": {"r": -0.25, "g": -0.25, "b": -0.25},
        "covariance_matrix": [[0.0004, 0.0, 0.0], [0.0, 0.0004, 0.0], [0.0, 0.0, 0.0004]]
    }
}"#;

/// Uniform background image with `marker` in the red channel of pixel (0, 0).
pub fn marker_image(marker: u8) -> RgbImage {
    let mut img = RgbImage::from_pixel(IMAGE_SIZE, IMAGE_SIZE, Rgb([BACKGROUND; 3]));
    img.put_pixel(0, 0, Rgb([marker, 0, 0]));
    img
}

pub fn write_still(dir: &Path, name: &str, marker: u8) -> PathBuf {
    let path = dir.join(name);
    marker_image(marker)
        .save(&path)
        .expect("Failed to save test image");
    path
}

/// Write a multi-page RGB TIFF with one page per marker.
pub fn write_tiff_pages(dir: &Path, name: &str, markers: &[u8]) -> PathBuf {
    use tiff::encoder::{colortype, TiffEncoder};

    let path = dir.join(name);
    let file = std::fs::File::create(&path).expect("Failed to create tiff");
    let mut encoder = TiffEncoder::new(file).expect("Failed to create tiff encoder");
    for &marker in markers {
        let page = marker_image(marker);
        encoder
            .write_image::<colortype::RGB8>(page.width(), page.height(), page.as_raw())
            .expect("Failed to write tiff page");
    }
    path
}

/// Files in `dir`, sorted by name.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("Failed to list directory")
        .map(|e| e.expect("bad entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
