//! Removal of prior run output and persisted test state.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum WipeError {
    #[error("removing output directory failed: {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("removing seed file failed: {path}: {source}")]
    SeedFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failure walking {path}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("removing sandbox directory failed: {path}: {source}")]
    Sandbox {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, WipeError>;

/// Remove the output directory and everything in it, if present.
pub fn wipe_output_dir(output_dir: &Path) -> Result<()> {
    if output_dir.exists() {
        fs::remove_dir_all(output_dir).map_err(|source| WipeError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Remove persisted test state under the test root.
///
/// Deletes `<test_root>/<seed_file>` and every directory whose name contains
/// `sandbox_marker`. Returns the removed paths.
pub fn wipe_test_state(test_root: &Path, seed_file: &str, sandbox_marker: &str) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    let seed = test_root.join(seed_file);
    if !seed_file.is_empty() && seed.is_file() {
        fs::remove_file(&seed).map_err(|source| WipeError::SeedFile {
            path: seed.clone(),
            source,
        })?;
        removed.push(seed);
    }

    if !sandbox_marker.is_empty() {
        remove_sandboxes(test_root, sandbox_marker, &mut removed)?;
    }
    Ok(removed)
}

fn remove_sandboxes(root: &Path, marker: &str, removed: &mut Vec<PathBuf>) -> Result<()> {
    if !root.is_dir() {
        return Ok(());
    }
    let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|source| WipeError::Walk {
            path: source
                .path()
                .map_or_else(|| root.to_path_buf(), Path::to_path_buf),
            source,
        })?;
        let is_sandbox = entry.file_type().is_dir()
            && entry.file_name().to_string_lossy().contains(marker);
        if !is_sandbox {
            continue;
        }
        walker.skip_current_dir();
        fs::remove_dir_all(entry.path()).map_err(|source| WipeError::Sandbox {
            path: entry.path().to_path_buf(),
            source,
        })?;
        removed.push(entry.into_path());
    }
    Ok(())
}
