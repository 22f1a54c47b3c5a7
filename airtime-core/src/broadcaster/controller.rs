//! One transmission attempt from input validation to artifact cleanup.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactCleaner, CleanupReport};
use crate::config::{AirtimeConfig, StartedTrigger};
use crate::error::TransmissionError;
use crate::history::RunLedger;
use crate::input::{load_segment_list, load_stream_info, RunInput};
use crate::notify::{self, deliver, DisabledNotifier, LifecycleEvent, Notifier, RunStatus};

use super::engine::{EngineError, EngineLauncher, SystemEngineLauncher};
use super::inspector::MediaInspector;
use super::monitor::{DestinationMonitor, DestinationTable, LogClassifier};
use super::pipeline::{OverlayAsset, PipelineBuilder, PipelineSpec};
use super::progress::{format_clock, ConsoleProgress, ProgressReporter, ProgressTracker};
use super::types::{DestinationStatus, InspectedProgram};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    Inspecting,
    Building,
    Streaming,
    Finalizing,
    Aborting,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub kind: &'static str,
    pub message: String,
}

/// Result of a transmission attempt. Failures are folded in rather than returned.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub attempt_id: Uuid,
    pub run_id: Option<String>,
    pub stage: Stage,
    pub failed_at: Option<Stage>,
    pub total_duration: Option<f64>,
    pub engine_exit: Option<i32>,
    pub streamed_seconds: u64,
    pub destinations: DestinationTable,
    pub failure: Option<RunFailure>,
    pub cleanup: Option<CleanupReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    cause: Option<TransmissionError>,
}

impl RunOutcome {
    fn new(attempt_id: Uuid) -> Self {
        Self {
            attempt_id,
            run_id: None,
            stage: Stage::Validating,
            failed_at: None,
            total_duration: None,
            engine_exit: None,
            streamed_seconds: 0,
            destinations: DestinationTable::default(),
            failure: None,
            cleanup: None,
            started_at: Utc::now(),
            finished_at: None,
            cause: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn status(&self) -> RunStatus {
        if self.is_success() {
            RunStatus::Finished
        } else {
            RunStatus::Error
        }
    }

    pub fn error(&self) -> Option<&TransmissionError> {
        self.cause.as_ref()
    }

    /// Identifier reported to the status endpoint: the run id, or the attempt id when the
    /// run id never became known.
    pub fn notification_id(&self) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| self.attempt_id.to_string())
    }

    /// Process exit code for the operator: zero only for a successful run.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            return 0;
        }
        match self.engine_exit {
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }

    fn fail(&mut self, error: TransmissionError) {
        self.failure = Some(RunFailure {
            kind: error.kind(),
            message: error.to_string(),
        });
        self.cause = Some(error);
    }
}

pub struct TransmissionDeps {
    pub inspector: MediaInspector,
    pub launcher: Arc<dyn EngineLauncher>,
    pub notifier: Arc<dyn Notifier>,
    pub reporter: Arc<dyn ProgressReporter>,
    pub ledger: Option<RunLedger>,
}

impl TransmissionDeps {
    /// Real processes, the configured notifier and the console countdown.
    ///
    /// Neither the notifier nor the ledger can stop a run: a notifier that cannot be built
    /// is replaced by [`DisabledNotifier`] and an unusable ledger is left out.
    pub fn from_config(config: &AirtimeConfig) -> Self {
        let notifier = notify::notifier_from_config(config).unwrap_or_else(|err| {
            error!(error = %err, "notifier unavailable; lifecycle events will not be delivered");
            Arc::new(DisabledNotifier) as Arc<dyn Notifier>
        });
        Self {
            inspector: MediaInspector::new(&config.engine.ffprobe, None),
            launcher: Arc::new(SystemEngineLauncher::from_config(&config.engine)),
            notifier,
            reporter: Arc::new(ConsoleProgress),
            ledger: config.history_database().and_then(|path| open_ledger(&path)),
        }
    }
}

fn open_ledger(path: &Path) -> Option<RunLedger> {
    let ledger = match RunLedger::new(path) {
        Ok(ledger) => ledger,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "run ledger disabled");
            return None;
        }
    };
    match ledger.initialize() {
        Ok(()) => Some(ledger),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "run ledger disabled");
            None
        }
    }
}

struct Streamed {
    exit_code: Option<i32>,
    table: DestinationTable,
    elapsed: Duration,
}

pub struct Transmission {
    config: AirtimeConfig,
    deps: TransmissionDeps,
    builder: PipelineBuilder,
    classifier: LogClassifier,
}

impl Transmission {
    pub fn new(config: AirtimeConfig, deps: TransmissionDeps) -> Self {
        let builder = PipelineBuilder::from_config(&config);
        Self {
            config,
            deps,
            builder,
            classifier: LogClassifier::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: LogClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &AirtimeConfig {
        &self.config
    }

    /// Reads and validates the run input without starting anything.
    pub fn load_input(&self) -> Result<RunInput, TransmissionError> {
        self.read_input(&mut None)
    }

    pub async fn inspect(&self, input: &RunInput) -> Result<InspectedProgram, TransmissionError> {
        Ok(self.deps.inspector.inspect_program(&input.program()).await?)
    }

    /// Resolves the overlay asset and builds the engine invocation.
    pub fn plan(
        &self,
        input: &RunInput,
        program: &InspectedProgram,
    ) -> Result<PipelineSpec, TransmissionError> {
        let overlay = self.resolve_overlay(input)?;
        self.builder
            .build(program, overlay.as_ref(), &input.destinations)
    }

    pub async fn run(&self) -> RunOutcome {
        let mut outcome = RunOutcome::new(Uuid::new_v4());
        info!(attempt = %outcome.attempt_id, "transmission attempt starting");

        if let Err(err) = self.drive(&mut outcome).await {
            outcome.failed_at = Some(outcome.stage);
            if err.is_fatal() {
                error!(stage = ?outcome.stage, kind = err.kind(), error = %err, "transmission aborted");
                self.enter(&mut outcome, Stage::Aborting);
            } else {
                error!(error = %err, "transmission failed");
            }
            outcome.fail(err);
        }

        let event = match &outcome.failure {
            None => LifecycleEvent::finished(outcome.notification_id()),
            Some(failure) => LifecycleEvent::error(outcome.notification_id(), failure.message.clone()),
        };
        deliver(self.deps.notifier.as_ref(), &event).await;
        outcome.finished_at = Some(Utc::now());

        if let Some(ledger) = &self.deps.ledger {
            if let Err(err) = ledger.record(&outcome).await {
                warn!(error = %err, "failed to record run in ledger");
            }
        }

        let cleaner = ArtifactCleaner::new(self.config.artifacts_dir());
        outcome.cleanup = match tokio::task::spawn_blocking(move || cleaner.clean()).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(err)) => {
                warn!(error = %err, "artifact cleanup failed");
                None
            }
            Err(err) => {
                warn!(error = %err, "artifact cleanup task did not complete");
                None
            }
        };

        self.enter(&mut outcome, Stage::Done);
        info!(
            attempt = %outcome.attempt_id,
            status = %outcome.status(),
            exit_code = outcome.exit_code(),
            "transmission attempt finished"
        );
        outcome
    }

    fn enter(&self, outcome: &mut RunOutcome, stage: Stage) {
        debug!(from = ?outcome.stage, to = ?stage, "stage transition");
        outcome.stage = stage;
    }

    async fn drive(&self, outcome: &mut RunOutcome) -> Result<(), TransmissionError> {
        self.enter(outcome, Stage::Validating);
        let input = self.read_input(&mut outcome.run_id)?;
        outcome.destinations = DestinationTable::new(&input.destinations);
        info!(
            run = %input.run_id,
            destinations = input.destinations.len(),
            segments = input.program().len(),
            "run input validated"
        );

        self.enter(outcome, Stage::Inspecting);
        let program = self.inspect(&input).await?;
        outcome.total_duration = Some(program.total_duration());

        self.enter(outcome, Stage::Building);
        let spec = self.plan(&input, &program)?;

        self.enter(outcome, Stage::Streaming);
        let streamed = self.stream(&input, &program, &spec).await?;
        outcome.engine_exit = streamed.exit_code;
        outcome.streamed_seconds = streamed.elapsed.as_secs();
        outcome.destinations = streamed.table;

        self.enter(outcome, Stage::Finalizing);
        finalize(streamed.exit_code, &outcome.destinations)
    }

    fn read_input(&self, run_id: &mut Option<String>) -> Result<RunInput, TransmissionError> {
        let info = load_stream_info(&self.config.stream_info_file())?;
        let id = info.id.trim();
        if !id.is_empty() {
            *run_id = Some(id.to_string());
        }
        let entries = load_segment_list(&self.config.segments_file())?;
        let input = RunInput::from_parts(info, entries)?;
        input.validate()?;
        Ok(input)
    }

    /// Configured asset first, then the one declared with the stream, then an image listed
    /// among the segments.
    fn resolve_overlay(&self, input: &RunInput) -> Result<Option<OverlayAsset>, TransmissionError> {
        let candidate = self
            .config
            .overlay_asset()
            .or_else(|| {
                input.declared_overlay.as_ref().map(|path| {
                    if path.is_absolute() {
                        path.clone()
                    } else {
                        self.config.artifacts_dir().join(path)
                    }
                })
            })
            .or_else(|| input.listed_overlay().map(|segment| segment.path().to_path_buf()));
        match candidate {
            Some(path) => {
                let asset = OverlayAsset::resolve(&path)?;
                info!(
                    overlay = %asset.path.display(),
                    width = asset.width,
                    height = asset.height,
                    "overlay asset resolved"
                );
                Ok(Some(asset))
            }
            None => Ok(None),
        }
    }

    async fn stream(
        &self,
        input: &RunInput,
        program: &InspectedProgram,
        spec: &PipelineSpec,
    ) -> Result<Streamed, TransmissionError> {
        let mut handle = self.deps.launcher.launch(spec).await?;
        let launched_at = tokio::time::Instant::now();
        let Some(diagnostics) = handle.take_diagnostics() else {
            handle.canceller().cancel();
            return Err(EngineError::MissingStream("stderr").into());
        };
        info!(
            total = %format_clock(program.total_duration()),
            output = if input.destinations.len() > 1 { "tee" } else { "single" },
            "engine running"
        );

        let monitor_section = &self.config.monitor;
        let (first_tx, first_rx) = oneshot::channel();
        let first_started = match self.config.notification.started_trigger {
            StartedTrigger::FirstDestination => Some(first_tx),
            StartedTrigger::Delay => None,
        };
        let stop_monitor = CancellationToken::new();
        let mut monitor = DestinationMonitor::new(
            &input.destinations,
            self.classifier.clone(),
            monitor_section.attribute_unlabelled_progress,
        )
        .spawn(diagnostics, stop_monitor.clone(), first_started);

        let stop_tracker = CancellationToken::new();
        let tracker = ProgressTracker::spawn(
            program.total_duration(),
            spec.windows.clone(),
            self.deps.reporter.clone(),
            stop_tracker.clone(),
        );

        let stop_started = CancellationToken::new();
        let started = self.spawn_started_trigger(input.run_id.clone(), first_rx, stop_started.clone());

        let exit_code = handle.wait().await;
        let elapsed = launched_at.elapsed();
        stop_tracker.cancel();
        stop_started.cancel();
        info!(exit_code = ?exit_code, streamed = %format_clock(elapsed.as_secs_f64()), "engine exited");

        let table = match tokio::time::timeout(monitor_section.drain_timeout(), &mut monitor).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!("diagnostic drain window elapsed");
                stop_monitor.cancel();
                monitor.await
            }
        }
        .unwrap_or_else(|err| {
            warn!(error = %err, "destination monitor ended abnormally");
            DestinationTable::new(&input.destinations)
        });

        match tracker.await {
            Ok(ticks) => debug!(ticks, "progress tracker stopped"),
            Err(err) => warn!(error = %err, "progress tracker ended abnormally"),
        }
        self.deps.reporter.finish();
        if let Err(err) = started.await {
            warn!(error = %err, "started notification task ended abnormally");
        }

        Ok(Streamed {
            exit_code,
            table,
            elapsed,
        })
    }

    /// Sends `started` after the configured delay or on the first live destination. A call
    /// already in flight when `stop` fires runs to completion.
    fn spawn_started_trigger(
        &self,
        run_id: String,
        first_started: oneshot::Receiver<()>,
        stop: CancellationToken,
    ) -> JoinHandle<bool> {
        let notifier = self.deps.notifier.clone();
        let trigger = self.config.notification.started_trigger;
        let delay = self.config.notification.started_delay();
        tokio::spawn(async move {
            let ready = async move {
                match trigger {
                    StartedTrigger::Delay => {
                        tokio::time::sleep(delay).await;
                        true
                    }
                    StartedTrigger::FirstDestination => first_started.await.is_ok(),
                }
            };
            let fire = tokio::select! {
                biased;
                _ = stop.cancelled() => false,
                fire = ready => fire,
            };
            if !fire {
                debug!("started notification not sent");
                return false;
            }
            deliver(notifier.as_ref(), &LifecycleEvent::started(run_id)).await
        })
    }
}

/// Success requires a clean engine exit and at least one destination that went live.
fn finalize(exit_code: Option<i32>, table: &DestinationTable) -> Result<(), TransmissionError> {
    for entry in table.entries() {
        info!(destination = %entry.destination, status = %entry.status, "destination result");
    }
    let started = table.count(DestinationStatus::Started);
    if exit_code == Some(0) && started > 0 {
        if started < table.len() {
            warn!(started, total = table.len(), "transmission finished on a subset of destinations");
        }
        return Ok(());
    }
    let detail = match exit_code {
        Some(0) => "engine exited cleanly but no destination went live".to_string(),
        Some(code) => format!(
            "engine exited with code {code}; {started} of {} destinations went live",
            table.len()
        ),
        None => "engine terminated without an exit code".to_string(),
    };
    Err(TransmissionError::Engine { exit_code, detail })
}
