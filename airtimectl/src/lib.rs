use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use airtime_core::broadcaster::{ConsoleProgress, InputSource, OutputMode, SystemEngineLauncher, VideoPath};
use airtime_core::{
    format_clock, load_airtime_config, AirtimeConfig, ArtifactCleaner, CleanupReport,
    DisabledNotifier, InspectedProgram, MediaInspector, PipelineSpec, RunFilter, RunLedger,
    RunOutcome, RunRecord, RunStatus, Transmission, TransmissionDeps,
};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONFIG: &str = "configs/airtime.toml";

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] airtime_core::ConfigError),
    #[error("{0}")]
    Transmission(#[from] airtime_core::TransmissionError),
    #[error("history error: {0}")]
    History(#[from] airtime_core::HistoryError),
    #[error("cleanup error: {0}")]
    Cleanup(#[from] airtime_core::CleanupError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Airtime transmission control interface", long_about = None)]
pub struct Cli {
    /// Caminho do airtime.toml (padrão: configs/airtime.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Diretório override para artefatos (substitui paths.artifacts_dir)
    #[arg(long)]
    pub artifacts_dir: Option<PathBuf>,
    /// Caminho alternativo para o banco de histórico
    #[arg(long)]
    pub history_db: Option<PathBuf>,
    /// Formato de saída
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Executa a transmissão completa
    Run,
    /// Valida, inspeciona e monta os argumentos do ffmpeg sem iniciar
    Plan,
    /// Mede a duração de cada segmento da sequência
    Probe,
    /// Remove os artefatos da execução
    Clean,
    /// Lista execuções registradas no histórico
    History(HistoryArgs),
    /// Gera scripts de completion para o shell
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Filtrar por status (started, finished, error)
    #[arg(long)]
    pub status: Option<String>,
    /// Limite de registros retornados
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

/// Runs the selected command and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "airtimectl", &mut io::stdout());
        return Ok(0);
    }

    let context = AppContext::load(&cli)?;
    match &cli.command {
        Commands::Run => {
            let deps = TransmissionDeps::from_config(&context.config);
            let transmission = Transmission::new(context.config.clone(), deps);
            let outcome = transmission.run().await;
            render(&RunReport::from_outcome(&outcome), cli.format)?;
            Ok(outcome.exit_code())
        }
        Commands::Plan => {
            let transmission = context.dry_run();
            let input = transmission.load_input()?;
            let program = transmission.inspect(&input).await?;
            let spec = transmission.plan(&input, &program)?;
            let report = PlanReport::new(
                &input.run_id,
                &context.config.engine.ffmpeg,
                &program,
                &spec,
            );
            render(&report, cli.format)?;
            Ok(0)
        }
        Commands::Probe => {
            let transmission = context.dry_run();
            let input = transmission.load_input()?;
            let program = transmission.inspect(&input).await?;
            render(&ProbeReport::new(&input.run_id, &program), cli.format)?;
            Ok(0)
        }
        Commands::Clean => {
            let report = ArtifactCleaner::new(context.config.artifacts_dir()).clean()?;
            render(&CleanReport::from(report), cli.format)?;
            Ok(0)
        }
        Commands::History(args) => {
            let records = context.history(args)?;
            render(&HistoryList { rows: records }, cli.format)?;
            Ok(0)
        }
        Commands::Completions(_) => Ok(0),
    }
}

#[derive(Debug)]
struct AppContext {
    config: AirtimeConfig,
}

impl AppContext {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => load_airtime_config(path)?,
            None if Path::new(DEFAULT_CONFIG).is_file() => load_airtime_config(DEFAULT_CONFIG)?,
            None => {
                warn!(path = DEFAULT_CONFIG, "config file not found; using built-in defaults");
                AirtimeConfig::default()
            }
        };
        if let Some(dir) = &cli.artifacts_dir {
            config.paths.artifacts_dir = absolute(dir)?.to_string_lossy().into_owned();
        }
        if let Some(db) = &cli.history_db {
            config.history.database = Some(absolute(db)?.to_string_lossy().into_owned());
        }
        info!(artifacts = %config.artifacts_dir().display(), "configuration loaded");
        Ok(Self { config })
    }

    /// Transmission wired for commands that never launch the engine or notify.
    fn dry_run(&self) -> Transmission {
        let deps = TransmissionDeps {
            inspector: MediaInspector::new(&self.config.engine.ffprobe, None),
            launcher: Arc::new(SystemEngineLauncher::from_config(&self.config.engine)),
            notifier: Arc::new(DisabledNotifier),
            reporter: Arc::new(ConsoleProgress),
            ledger: None,
        };
        Transmission::new(self.config.clone(), deps)
    }

    fn history(&self, args: &HistoryArgs) -> Result<Vec<RunRecord>> {
        let path = self
            .config
            .history_database()
            .ok_or_else(|| AppError::MissingResource("history.database".to_string()))?;
        if !path.exists() {
            return Err(AppError::MissingResource(path.display().to_string()));
        }
        let status = args
            .status
            .as_deref()
            .map(str::parse::<RunStatus>)
            .transpose()
            .map_err(AppError::InvalidArgument)?;
        let ledger = RunLedger::builder().path(&path).create_if_missing(false).build()?;
        let filter = RunFilter {
            status,
            limit: Some(args.limit),
        };
        Ok(ledger.list(&filter)?)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
struct DestinationView {
    url: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct RunReport {
    attempt_id: String,
    run_id: Option<String>,
    status: RunStatus,
    exit_code: i32,
    engine_exit: Option<i32>,
    total_duration: Option<String>,
    streamed: String,
    destinations: Vec<DestinationView>,
    error: Option<String>,
    removed_artifacts: usize,
}

impl RunReport {
    fn from_outcome(outcome: &RunOutcome) -> Self {
        Self {
            attempt_id: outcome.attempt_id.to_string(),
            run_id: outcome.run_id.clone(),
            status: outcome.status(),
            exit_code: outcome.exit_code(),
            engine_exit: outcome.engine_exit,
            total_duration: outcome.total_duration.map(format_clock),
            streamed: format_clock(outcome.streamed_seconds as f64),
            destinations: outcome
                .destinations
                .entries()
                .iter()
                .map(|entry| DestinationView {
                    url: entry.destination.redacted(),
                    status: entry.status.as_str().to_string(),
                })
                .collect(),
            error: outcome
                .failure
                .as_ref()
                .map(|failure| format!("[{}] {}", failure.kind, failure.message)),
            removed_artifacts: outcome
                .cleanup
                .as_ref()
                .map(|report| report.removed.len())
                .unwrap_or(0),
        }
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Transmissão {} ({}): {}",
            self.run_id.as_deref().unwrap_or("-"),
            self.attempt_id,
            self.status
        )];
        if let Some(total) = &self.total_duration {
            lines.push(format!("Duração total: {total}"));
        }
        lines.push(format!("Transmitido: {}", self.streamed));
        if !self.destinations.is_empty() {
            lines.push("Destinos:".to_string());
            for destination in &self.destinations {
                lines.push(format!("  - {} [{}]", destination.url, destination.status));
            }
        }
        if let Some(error) = &self.error {
            lines.push(format!("Erro: {error}"));
        }
        lines.push(format!("Artefatos removidos: {}", self.removed_artifacts));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct PlanReport {
    run_id: String,
    total_duration: String,
    input: &'static str,
    video: &'static str,
    output: &'static str,
    overlay: Option<PathBuf>,
    windows: Vec<String>,
    program: String,
    args: Vec<String>,
}

impl PlanReport {
    fn new(run_id: &str, ffmpeg: &str, program: &InspectedProgram, spec: &PipelineSpec) -> Self {
        Self {
            run_id: run_id.to_string(),
            total_duration: format_clock(program.total_duration()),
            input: match spec.input {
                InputSource::ConcatProtocol(_) => "concat_protocol",
                InputSource::Slots(_) => "slots",
            },
            video: match spec.video {
                VideoPath::Copy => "copy",
                VideoPath::Filtered(_) => "filtered",
            },
            output: match spec.output {
                OutputMode::Single(_) => "single",
                OutputMode::TeeFanout(_) => "tee_fanout",
            },
            overlay: spec.overlay.clone(),
            windows: spec
                .windows
                .iter()
                .map(|window| format!("{}-{}", format_clock(window.start), format_clock(window.end)))
                .collect(),
            program: ffmpeg.to_string(),
            args: spec.redacted_args(),
        }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || "'\"|;[]".contains(c)) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

impl DisplayFallback for PlanReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Transmissão: {}", self.run_id),
            format!("Duração total: {}", self.total_duration),
            format!(
                "Entrada: {} | vídeo: {} | saída: {}",
                self.input, self.video, self.output
            ),
        ];
        if let Some(overlay) = &self.overlay {
            lines.push(format!("Overlay: {} ({})", overlay.display(), self.windows.join(", ")));
        }
        lines.push(self.command_line());
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct ProbeEntry {
    name: String,
    path: PathBuf,
    duration_s: f64,
    duration: String,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    run_id: String,
    segments: Vec<ProbeEntry>,
    total_duration_s: f64,
    total_duration: String,
}

impl ProbeReport {
    fn new(run_id: &str, program: &InspectedProgram) -> Self {
        Self {
            run_id: run_id.to_string(),
            segments: program
                .segments()
                .iter()
                .map(|entry| ProbeEntry {
                    name: entry.segment.display_name(),
                    path: entry.segment.path().to_path_buf(),
                    duration_s: entry.duration_s,
                    duration: format_clock(entry.duration_s),
                })
                .collect(),
            total_duration_s: program.total_duration(),
            total_duration: format_clock(program.total_duration()),
        }
    }
}

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Sequência de {}:", self.run_id)];
        for (index, entry) in self.segments.iter().enumerate() {
            lines.push(format!("  {:>2}. {} ({})", index + 1, entry.name, entry.duration));
        }
        lines.push(format!("Duração total: {}", self.total_duration));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct CleanReport {
    removed: Vec<PathBuf>,
    failed: Vec<String>,
}

impl From<CleanupReport> for CleanReport {
    fn from(report: CleanupReport) -> Self {
        Self {
            removed: report.removed,
            failed: report
                .failed
                .into_iter()
                .map(|failure| format!("{}: {}", failure.path.display(), failure.reason))
                .collect(),
        }
    }
}

impl DisplayFallback for CleanReport {
    fn display(&self) -> String {
        if self.removed.is_empty() && self.failed.is_empty() {
            return "Nenhum artefato para remover".to_string();
        }
        let mut lines = Vec::new();
        for path in &self.removed {
            lines.push(format!("removido {}", path.display()));
        }
        for failure in &self.failed {
            lines.push(format!("falhou {failure}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct HistoryList {
    rows: Vec<RunRecord>,
}

impl DisplayFallback for HistoryList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Nenhuma execução registrada".to_string();
        }
        let mut lines = Vec::new();
        for record in &self.rows {
            let duration = record
                .total_duration_s
                .map(format_clock)
                .unwrap_or_else(|| "-".to_string());
            let exit = record
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string());
            let mut line = format!(
                "{finished} | {id} | {status} | exit {exit} | {duration} | destinos {started}/{total}",
                finished = record.finished_at.format("%Y-%m-%d %H:%M:%S"),
                id = record.run_id,
                status = record.status,
                started = record.started_destinations(),
                total = record.destinations.len(),
            );
            if let Some(message) = &record.error_message {
                line.push_str(&format!(" | {message}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airtime_core::broadcaster::{Segment, TimedSegment};
    use airtime_core::history::DestinationRecord;
    use airtime_core::DestinationStatus;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use tempfile::TempDir;

    fn write_config(root: &Path) -> PathBuf {
        let path = root.join("airtime.toml");
        fs::write(
            &path,
            r#"
[paths]
artifacts_dir = "work"

[history]
database = "data/runs.sqlite"
"#,
        )
        .unwrap();
        path
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("airtimectl").chain(args.iter().copied())).unwrap()
    }

    fn record(run_id: &str, status: RunStatus, minute: u32) -> RunRecord {
        RunRecord {
            attempt_id: format!("attempt-{run_id}"),
            run_id: run_id.to_string(),
            status,
            exit_code: Some(if status == RunStatus::Finished { 0 } else { 1 }),
            total_duration_s: Some(125.0),
            elapsed_s: 125,
            error_kind: None,
            error_message: None,
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            finished_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute + 2, 5).unwrap(),
            destinations: vec![DestinationRecord {
                position: 0,
                url: "rtmp://a.example/live/***".to_string(),
                status: DestinationStatus::Started,
            }],
        }
    }

    #[test]
    fn parses_global_flags_and_history_args() {
        let parsed = cli(&[
            "--config",
            "x.toml",
            "--format",
            "json",
            "history",
            "--limit",
            "3",
            "--status",
            "error",
        ]);
        assert_eq!(parsed.config, Some(PathBuf::from("x.toml")));
        assert_eq!(parsed.format, OutputFormat::Json);
        match parsed.command {
            Commands::History(args) => {
                assert_eq!(args.limit, 3);
                assert_eq!(args.status.as_deref(), Some("error"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn artifacts_dir_override_replaces_config_value() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        let override_dir = temp.path().join("elsewhere");
        let parsed = cli(&[
            "--config",
            config.to_str().unwrap(),
            "--artifacts-dir",
            override_dir.to_str().unwrap(),
            "clean",
        ]);
        let context = AppContext::load(&parsed).unwrap();
        assert_eq!(context.config.artifacts_dir(), override_dir);
        assert_eq!(
            context.config.history_database(),
            Some(temp.path().join("data/runs.sqlite"))
        );
    }

    #[tokio::test]
    async fn clean_command_removes_artifacts() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        let work = temp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("part1.ts"), b"ts").unwrap();
        fs::write(work.join("stream_info.json"), b"{}").unwrap();

        let code = run(cli(&["--config", config.to_str().unwrap(), "clean"]))
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn run_with_unusable_ledger_still_cleans_up() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("blocker"), b"not a directory").unwrap();
        let config = temp.path().join("airtime.toml");
        fs::write(
            &config,
            r#"
[paths]
artifacts_dir = "work"

[history]
database = "blocker/runs.sqlite"
"#,
        )
        .unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("part1.ts"), b"ts").unwrap();

        let code = run(cli(&["--config", config.to_str().unwrap(), "run"]))
            .await
            .unwrap();
        assert_eq!(code, 1);
        assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn history_requires_existing_database() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        let err = run(cli(&["--config", config.to_str().unwrap(), "history"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MissingResource(_)));
    }

    #[test]
    fn history_filters_by_status() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        let db = temp.path().join("data/runs.sqlite");
        let ledger = RunLedger::new(&db).unwrap();
        ledger.initialize().unwrap();
        ledger
            .record_entry(&record("live-1", RunStatus::Finished, 0))
            .unwrap();
        ledger
            .record_entry(&record("live-2", RunStatus::Error, 10))
            .unwrap();

        let context = AppContext::load(&cli(&["--config", config.to_str().unwrap(), "clean"]))
            .unwrap();
        let rows = context
            .history(&HistoryArgs {
                status: Some("error".to_string()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].run_id, "live-2");

        let err = context
            .history(&HistoryArgs {
                status: Some("paused".to_string()),
                limit: 10,
            })
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let text = HistoryList { rows }.display();
        assert!(text.contains("live-2 | error | exit 1 | 2m5s | destinos 1/1"));
    }

    #[test]
    fn probe_report_formats_clock_values() {
        let program = InspectedProgram::new(vec![
            TimedSegment {
                segment: Segment::new("/work/part1.ts"),
                duration_s: 59.6,
            },
            TimedSegment {
                segment: Segment::new("/work/part2.ts"),
                duration_s: 61.0,
            },
        ]);
        let report = ProbeReport::new("live-42", &program);
        let text = report.display();
        assert!(text.contains(" 1. part1.ts (1m0s)"));
        assert!(text.contains(" 2. part2.ts (1m1s)"));
        assert!(text.ends_with("Duração total: 2m1s"));
    }

    #[test]
    fn quote_wraps_tee_targets() {
        assert_eq!(quote("-c"), "-c");
        assert_eq!(
            quote("[f=flv:onfail=ignore]rtmp://a|[f=flv]rtmp://b"),
            "'[f=flv:onfail=ignore]rtmp://a|[f=flv]rtmp://b'"
        );
        assert_eq!(quote(""), "''");
    }
}
