//! Removal of the per-run artifacts once a transmission is over.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to list artifacts in {path}: {source}")]
    Walk {
        source: walkdir::Error,
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes the files directly inside the artifacts directory. Subdirectories are left alone.
#[derive(Debug, Clone)]
pub struct ArtifactCleaner {
    dir: PathBuf,
}

impl ArtifactCleaner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Missing or empty directories are a no-op, so running it twice is harmless.
    pub fn clean(&self) -> Result<CleanupReport, CleanupError> {
        let mut report = CleanupReport::default();
        if !self.dir.is_dir() {
            info!(dir = %self.dir.display(), "artifacts directory absent; nothing to clean");
            return Ok(report);
        }

        let walker = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(source) if source.depth() == 0 => {
                    return Err(CleanupError::Walk {
                        source,
                        path: self.dir.clone(),
                    })
                }
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| self.dir.clone());
                    warn!(path = %path.display(), error = %err, "could not inspect artifact");
                    report.failed.push(CleanupFailure {
                        path,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let path = entry.into_path();
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "artifact removed");
                    report.removed.push(path);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove artifact");
                    report.failed.push(CleanupFailure {
                        path,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_top_level_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part1.ts"), b"a").unwrap();
        std::fs::write(dir.path().join("stream_info.json"), b"{}").unwrap();
        std::fs::create_dir(dir.path().join("keep")).unwrap();
        std::fs::write(dir.path().join("keep/inner.ts"), b"b").unwrap();

        let report = ArtifactCleaner::new(dir.path()).clean().unwrap();
        assert_eq!(report.removed.len(), 2);
        assert!(report.is_clean());
        assert!(!dir.path().join("part1.ts").exists());
        assert!(dir.path().join("keep/inner.ts").exists());
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part1.ts"), b"a").unwrap();
        let cleaner = ArtifactCleaner::new(dir.path());
        assert_eq!(cleaner.clean().unwrap().removed.len(), 1);
        assert_eq!(cleaner.clean().unwrap(), CleanupReport::default());
    }

    #[test]
    fn missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let report = ArtifactCleaner::new(dir.path().join("gone")).clean().unwrap();
        assert!(report.removed.is_empty());
        assert!(report.is_clean());
    }
}
