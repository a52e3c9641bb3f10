//! Resolves where a run writes its annotated images.
//!
//! Output goes into a fresh `YYYY-MM-DD_HH-MM-SS` folder under either the
//! shared location or a local directory next to the source directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::RunConfiguration;
use crate::error::{PipelineError, RunWarning};

/// Suffix of the local output directory created next to the source directory.
pub const LOCAL_OUTPUT_SUFFIX: &str = "_detected";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOutput {
    pub directory: PathBuf,
    /// Set when the shared location was requested but unavailable.
    pub fallback: Option<RunWarning>,
}

/// Resolve and create the output directory for a run starting now.
pub fn resolve_output_directory(
    source_dir: &Path,
    config: &RunConfiguration,
) -> Result<ResolvedOutput, PipelineError> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    resolve_output_directory_at(source_dir, config, now)
}

pub fn resolve_output_directory_at(
    source_dir: &Path,
    config: &RunConfiguration,
    timestamp: OffsetDateTime,
) -> Result<ResolvedOutput, PipelineError> {
    let (base, fallback) = choose_base(source_dir, config);
    let folder = run_folder_name(timestamp);

    let directory = create_run_folder(&base, &folder).map_err(|source| PipelineError::Output {
        path: base.join(&folder),
        source,
    })?;

    info!("Writing output to {}", directory.display());
    Ok(ResolvedOutput {
        directory,
        fallback,
    })
}

fn choose_base(source_dir: &Path, config: &RunConfiguration) -> (PathBuf, Option<RunWarning>) {
    let local = local_output_base(source_dir);
    if !config.persist_to_shared_location {
        return (local, None);
    }

    match &config.shared_output_root {
        Some(shared) if shared.is_dir() => (shared.clone(), None),
        requested => {
            debug!("Shared output location {:?} unavailable", requested);
            let warning = RunWarning::PersistenceFallback {
                requested: requested.clone(),
                fallback: local.clone(),
            };
            (local, Some(warning))
        }
    }
}

/// Directory next to `source_dir` that receives output when nothing else is configured.
///
/// Paths ending in `.` or `..` are resolved first so the sibling is named after
/// the real directory.
pub fn local_output_base(source_dir: &Path) -> PathBuf {
    let source_dir = match source_dir.file_name() {
        Some(_) => source_dir.to_path_buf(),
        None => std::fs::canonicalize(source_dir).unwrap_or_else(|_| source_dir.to_path_buf()),
    };
    match (source_dir.parent(), source_dir.file_name()) {
        (Some(parent), Some(name)) => {
            let mut sibling = name.to_os_string();
            sibling.push(LOCAL_OUTPUT_SUFFIX);
            parent.join(sibling)
        }
        _ => source_dir.join(&LOCAL_OUTPUT_SUFFIX[1..]),
    }
}

pub fn run_folder_name(timestamp: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    timestamp
        .format(&format)
        .unwrap_or_else(|_| timestamp.unix_timestamp().to_string())
}

/// Create `base/name`, appending `_1`, `_2`, ... if a folder of that name already exists.
fn create_run_folder(base: &Path, name: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(base)?;

    let mut candidate = base.join(name);
    let mut attempt = 0;
    loop {
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                attempt += 1;
                candidate = base.join(format!("{name}_{attempt}"));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn folder_name_uses_dashes_and_underscore() {
        let ts = datetime!(2024-03-07 09:05:01 UTC);
        assert_eq!(run_folder_name(ts), "2024-03-07_09-05-01");
    }

    #[test]
    fn local_base_is_a_sibling() {
        assert_eq!(
            local_output_base(Path::new("/data/scans")),
            PathBuf::from("/data/scans_detected")
        );
    }

    #[test]
    fn dot_dot_source_names_the_real_directory() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::create_dir_all(dir.path().join("scans").join("day1"))?;
        let root = std::fs::canonicalize(dir.path())?;

        let via_parent = dir.path().join("scans").join("day1").join("..");
        assert_eq!(local_output_base(&via_parent), root.join("scans_detected"));

        let via_dot = dir.path().join("scans").join("..").join("scans").join("day1").join("..");
        assert_eq!(local_output_base(&via_dot), root.join("scans_detected"));
        Ok(())
    }

    #[test]
    fn same_timestamp_does_not_reuse_a_folder() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let first = create_run_folder(dir.path(), "2024-03-07_09-05-01")?;
        let second = create_run_folder(dir.path(), "2024-03-07_09-05-01")?;
        assert_ne!(first, second);
        assert!(second.ends_with("2024-03-07_09-05-01_1"));
        Ok(())
    }
}
