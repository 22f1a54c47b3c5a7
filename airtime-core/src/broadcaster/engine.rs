use std::path::PathBuf;
use std::process::Stdio;

use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_stream::wrappers::SplitStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineSection;

use super::pipeline::PipelineSpec;

pub type DiagnosticStream = BoxStream<'static, String>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        source: std::io::Error,
        program: PathBuf,
    },
    #[error("engine {0} stream was not captured")]
    MissingStream(&'static str),
}

/// A running engine process.
///
/// The diagnostic stream can be taken once; the exit code resolves once the process is
/// gone. `None` means the process was killed or its status could not be read.
pub struct EngineHandle {
    diagnostics: Option<DiagnosticStream>,
    exit: oneshot::Receiver<Option<i32>>,
    cancel: CancellationToken,
}

impl EngineHandle {
    pub fn new(
        diagnostics: DiagnosticStream,
        exit: oneshot::Receiver<Option<i32>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            diagnostics: Some(diagnostics),
            exit,
            cancel,
        }
    }

    pub fn take_diagnostics(&mut self) -> Option<DiagnosticStream> {
        self.diagnostics.take()
    }

    /// Token that kills the process when cancelled.
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Option<i32> {
        self.exit.await.unwrap_or(None)
    }
}

#[async_trait::async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, spec: &PipelineSpec) -> Result<EngineHandle, EngineError>;
}

#[derive(Debug, Clone)]
pub struct SystemEngineLauncher {
    ffmpeg: PathBuf,
}

impl SystemEngineLauncher {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    pub fn from_config(engine: &EngineSection) -> Self {
        Self::new(&engine.ffmpeg)
    }
}

#[async_trait::async_trait]
impl EngineLauncher for SystemEngineLauncher {
    async fn launch(&self, spec: &PipelineSpec) -> Result<EngineHandle, EngineError> {
        info!(
            program = %self.ffmpeg.display(),
            args = ?spec.redacted_args(),
            "launching engine"
        );
        let mut child = Command::new(&self.ffmpeg)
            .args(spec.args())
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                source,
                program: self.ffmpeg.clone(),
            })?;

        let stderr = child.stderr.take().ok_or(EngineError::MissingStream("stderr"))?;
        let mut stdout = child.stdout.take().ok_or(EngineError::MissingStream("stdout"))?;
        tokio::spawn(async move {
            let mut sink = tokio::io::stdout();
            if let Err(err) = tokio::io::copy(&mut stdout, &mut sink).await {
                debug!(error = %err, "engine stdout forwarding stopped");
            }
        });

        let cancel = CancellationToken::new();
        let exit = spawn_process_waiter(child, cancel.clone());
        Ok(EngineHandle::new(diagnostic_lines(stderr), exit, cancel))
    }
}

/// Splits engine output into trimmed, non-empty lines.
///
/// Status lines are terminated by carriage returns while everything else ends in newlines,
/// so both count as separators.
pub fn diagnostic_lines<R>(reader: R) -> DiagnosticStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    SplitStream::new(BufReader::new(reader).split(b'\r'))
        .take_while(|chunk| futures::future::ready(chunk.is_ok()))
        .filter_map(|chunk| futures::future::ready(chunk.ok()))
        .flat_map(|chunk| {
            let lines: Vec<String> = String::from_utf8_lossy(&chunk)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            stream::iter(lines)
        })
        .boxed()
}

/// Waits for the engine to exit, killing it if `cancel` fires first.
pub fn spawn_process_waiter(
    mut child: Child,
    cancel: CancellationToken,
) -> oneshot::Receiver<Option<i32>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let exit_code = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill engine");
                }
                None
            }
            status = child.wait() => match status {
                Ok(status) => {
                    let code = status.code();
                    match code {
                        Some(0) => debug!("engine exited cleanly"),
                        Some(code) => warn!(code, "engine exited with failure"),
                        None => warn!("engine terminated by signal"),
                    }
                    code
                }
                Err(err) => {
                    error!(error = %err, "failed to wait for engine");
                    None
                }
            }
        };
        let _ = tx.send(exit_code);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_on_carriage_returns_and_newlines() {
        let raw: &'static [u8] = b"Input #0, mpegts\nStream mapping:\n\
            frame=  10 fps=0.0 time=00:00:00.40\rframe=  20 fps=20 time=00:00:00.80\r\n  \n\
            [flv @ 0x1] Connection refused\n";
        let lines: Vec<String> = diagnostic_lines(raw).collect().await;
        assert_eq!(
            lines,
            vec![
                "Input #0, mpegts",
                "Stream mapping:",
                "frame=  10 fps=0.0 time=00:00:00.40",
                "frame=  20 fps=20 time=00:00:00.80",
                "[flv @ 0x1] Connection refused",
            ]
        );
    }

    #[tokio::test]
    async fn empty_output_yields_nothing() {
        let raw: &'static [u8] = b"";
        let lines: Vec<String> = diagnostic_lines(raw).collect().await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn handle_reports_exit_code_once() {
        let (tx, rx) = oneshot::channel();
        let mut handle = EngineHandle::new(stream::empty().boxed(), rx, CancellationToken::new());
        assert!(handle.take_diagnostics().is_some());
        assert!(handle.take_diagnostics().is_none());
        tx.send(Some(0)).unwrap();
        assert_eq!(handle.wait().await, Some(0));
    }

    #[tokio::test]
    async fn dropped_waiter_counts_as_killed() {
        let (tx, rx) = oneshot::channel::<Option<i32>>();
        drop(tx);
        let handle = EngineHandle::new(stream::empty().boxed(), rx, CancellationToken::new());
        assert_eq!(handle.wait().await, None);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let launcher = SystemEngineLauncher::new("/nonexistent/ffmpeg-binary");
        let spec = crate::broadcaster::pipeline::PipelineBuilder::new(
            EngineSection::default(),
            crate::config::EncodingSection::default(),
            crate::broadcaster::pipeline::OverlayPolicy::default(),
        )
        .build(
            &crate::broadcaster::types::InspectedProgram::new(vec![
                crate::broadcaster::types::TimedSegment {
                    segment: crate::broadcaster::types::Segment::new("/w/a.ts"),
                    duration_s: 1.0,
                },
            ]),
            None,
            &[crate::broadcaster::types::Destination::parse("rtmp://live.example.com/app/key").unwrap()],
        )
        .unwrap();
        let err = launcher.launch(&spec).await.err().unwrap();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
