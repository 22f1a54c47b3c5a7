use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use super::progress::format_clock;
use super::types::{InspectedProgram, Program, Segment, TimedSegment};
use super::{CommandExecutor, SystemCommandExecutor};

#[derive(Debug, Error)]
pub enum InspectionError {
    #[error("failed to run {program} for {path}: {source}")]
    Spawn {
        source: std::io::Error,
        program: PathBuf,
        path: PathBuf,
    },
    #[error("probe failed for {path} (status {status:?}): {stderr}")]
    CommandFailure {
        path: PathBuf,
        status: Option<i32>,
        stderr: String,
    },
    #[error("probe returned an unusable duration for {path}: {output:?}")]
    InvalidDuration { path: PathBuf, output: String },
}

/// Times every video segment with ffprobe.
pub struct MediaInspector {
    ffprobe: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for MediaInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaInspector")
            .field("ffprobe", &self.ffprobe)
            .finish()
    }
}

impl MediaInspector {
    pub fn new(ffprobe: impl Into<PathBuf>, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            ffprobe: ffprobe.into(),
            executor,
        }
    }

    pub async fn inspect(&self, segment: &Segment) -> Result<f64, InspectionError> {
        let path = segment.path();
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path);
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| InspectionError::Spawn {
                source,
                program: self.ffprobe.clone(),
                path: path.to_path_buf(),
            })?;
        if !output.status.success() {
            return Err(InspectionError::CommandFailure {
                path: path.to_path_buf(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_duration(&stdout).ok_or_else(|| InspectionError::InvalidDuration {
            path: path.to_path_buf(),
            output: stdout.trim().to_string(),
        })
    }

    /// Probes segments one after another in playback order; the first failure aborts.
    pub async fn inspect_program(
        &self,
        program: &Program,
    ) -> Result<InspectedProgram, InspectionError> {
        let mut timed = Vec::with_capacity(program.len());
        let mut running_total = 0.0;
        for (index, segment) in program.segments().iter().enumerate() {
            let duration_s = self.inspect(segment).await?;
            running_total += duration_s;
            info!(
                position = index + 1,
                segment = %segment.display_name(),
                duration = %format_clock(duration_s),
                running_total = %format_clock(running_total),
                "segment inspected"
            );
            timed.push(TimedSegment {
                segment: segment.clone(),
                duration_s,
            });
        }
        let inspected = InspectedProgram::new(timed);
        info!(
            segments = inspected.segments().len(),
            total = %format_clock(inspected.total_duration()),
            "estimated transmission duration"
        );
        Ok(inspected)
    }

    pub fn ffprobe(&self) -> &Path {
        &self.ffprobe
    }
}

/// First line of probe output as a finite, non-negative number of seconds.
pub fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value >= 0.0)
}
