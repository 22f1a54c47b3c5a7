pub mod controller;
pub mod engine;
pub mod inspector;
pub mod monitor;
pub mod pipeline;
pub mod progress;
pub mod types;

use tokio::process::Command;

pub use controller::{RunFailure, RunOutcome, Stage, Transmission, TransmissionDeps};
pub use engine::{
    DiagnosticStream, EngineError, EngineHandle, EngineLauncher, SystemEngineLauncher,
};
pub use inspector::{InspectionError, MediaInspector};
pub use monitor::{
    ClassifierRule, DestinationEntry, DestinationMonitor, DestinationTable, LogClassifier,
    RuleFamily, StatusTransition,
};
pub use pipeline::{
    FilterGraph, InputSource, OutputMode, OverlayAsset, OverlayPolicy, OverlayWindow,
    PipelineBuilder, PipelineSpec, VideoPath,
};
pub use progress::{
    format_clock, ConsoleProgress, ProgressEvent, ProgressReporter, ProgressTracker,
};
pub use types::{
    Destination, DestinationStatus, InspectedProgram, Program, Segment, SegmentKind,
    TimedSegment,
};

/// Runs short-lived helper commands (ffprobe) to completion.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}
