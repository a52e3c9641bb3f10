use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Name of the model catalog file inside a models directory.
pub const CATALOG_FILE_NAME: &str = "models_info.json";

/// Standard-deviation threshold passed to the detector.
pub const DEFAULT_STDDEV_THRESHOLD: f32 = 5.0;

/// Settings for one run. Never mutated once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    /// Minimum flake area in pixels.
    pub size_threshold: u32,
    /// Flakes below this confidence are dropped.
    pub confidence_threshold: f32,
    pub use_flatfield: bool,
    pub flatfield_path: Option<PathBuf>,
    /// Write into `shared_output_root` instead of next to the source directory.
    pub persist_to_shared_location: bool,
    pub shared_output_root: Option<PathBuf>,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            size_threshold: 1000,
            confidence_threshold: 0.0,
            use_flatfield: false,
            flatfield_path: None,
            persist_to_shared_location: false,
            shared_output_root: None,
        }
    }
}

impl RunConfiguration {
    pub fn with_size_threshold(mut self, size_threshold: u32) -> Self {
        self.size_threshold = size_threshold;
        self
    }

    pub fn with_confidence_threshold(mut self, confidence_threshold: f32) -> Self {
        self.confidence_threshold = confidence_threshold;
        self
    }

    /// Enable flatfield correction against the image at `path`
    pub fn with_flatfield(mut self, path: impl Into<PathBuf>) -> Self {
        self.use_flatfield = true;
        self.flatfield_path = Some(path.into());
        self
    }

    /// Persist into `root` when it exists, falling back next to the source otherwise
    pub fn with_shared_output(mut self, root: impl Into<PathBuf>) -> Self {
        self.persist_to_shared_location = true;
        self.shared_output_root = Some(root.into());
        self
    }

    /// Read settings from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        serde_json::from_str(&text).map_err(|e| {
            PipelineError::config_with_source(format!("invalid run settings in {}", path.display()), e)
        })
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::config(format!(
                "confidence threshold {} is outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.use_flatfield && self.flatfield_path.is_none() {
            return Err(PipelineError::config(
                "flatfield correction enabled but no flatfield image was given",
            ));
        }
        Ok(())
    }
}

/// Points at a contrast-model parameter file inside a models directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReference {
    pub models_dir: PathBuf,
    pub parameter_file: String,
}

impl ModelReference {
    pub fn new(models_dir: impl Into<PathBuf>, parameter_file: impl Into<String>) -> Self {
        Self {
            models_dir: models_dir.into(),
            parameter_file: parameter_file.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.models_dir.join(&self.parameter_file)
    }

    /// Resolve the parameter file, failing if it does not exist.
    pub fn locate(&self) -> Result<PathBuf, PipelineError> {
        let path = self.path();
        if !path.is_file() {
            return Err(PipelineError::config(format!(
                "parameter file {} does not exist in {}",
                self.parameter_file,
                self.models_dir.display()
            )));
        }
        Ok(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "File")]
    pub parameter_file: String,
}

/// Display name to parameter file mapping read from `models_info.json`.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models_dir: PathBuf,
    entries: BTreeMap<String, CatalogEntry>,
}

impl ModelCatalog {
    pub fn load(models_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let models_dir = models_dir.as_ref();
        let catalog_path = models_dir.join(CATALOG_FILE_NAME);
        let raw = std::fs::read_to_string(&catalog_path).map_err(|e| {
            anyhow::anyhow!("Failed to read model catalog {}: {}", catalog_path.display(), e)
        })?;
        let entries: BTreeMap<String, CatalogEntry> = serde_json::from_str(&raw)?;
        Ok(Self {
            models_dir: models_dir.to_path_buf(),
            entries,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &CatalogEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn get(&self, display_name: &str) -> Option<&CatalogEntry> {
        self.entries.get(display_name)
    }

    pub fn reference(&self, display_name: &str) -> Option<ModelReference> {
        self.get(display_name)
            .map(|entry| ModelReference::new(&self.models_dir, &entry.parameter_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_confidence() {
        let config = RunConfiguration::default().with_confidence_threshold(1.5);
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration { .. })
        ));
    }

    #[test]
    fn rejects_flatfield_without_path() {
        let config = RunConfiguration {
            use_flatfield: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(RunConfiguration::default().validate().is_ok());
    }

    #[test]
    fn settings_file_fills_in_defaults() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"confidence_threshold": 0.7, "shared_output_root": "/mnt/share"}"#)?;
        let config = RunConfiguration::from_json_file(&path)?;
        assert_eq!(config.confidence_threshold, 0.7);
        assert_eq!(config.size_threshold, 1000);
        assert_eq!(config.shared_output_root, Some(PathBuf::from("/mnt/share")));
        assert!(!config.persist_to_shared_location);
        Ok(())
    }

    #[test]
    fn catalog_resolves_display_names() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::write(
            dir.path().join(CATALOG_FILE_NAME),
            r#"{"Graphene": {"Description": "Graphene on 90nm SiO2", "File": "GMM_Graphene.json"}}"#,
        )?;
        let catalog = ModelCatalog::load(dir.path())?;
        let reference = catalog.reference("Graphene").expect("entry exists");
        assert_eq!(reference.path(), dir.path().join("GMM_Graphene.json"));
        assert!(catalog.reference("hBN").is_none());
        assert!(matches!(
            reference.locate(),
            Err(PipelineError::Configuration { .. })
        ));
        Ok(())
    }
}
