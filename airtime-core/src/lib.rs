pub mod artifacts;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod history;
pub mod input;
pub mod notify;

pub use artifacts::{ArtifactCleaner, CleanupError, CleanupReport};
pub use broadcaster::{
    format_clock, Destination, DestinationStatus, DestinationTable, EngineLauncher,
    InspectedProgram, MediaInspector, PipelineBuilder, PipelineSpec, RunOutcome, Stage,
    Transmission, TransmissionDeps,
};
pub use config::{load_airtime_config, AirtimeConfig, NotificationMode, StartedTrigger};
pub use error::{ConfigError, Result, TransmissionError};
pub use history::{HistoryError, RunFilter, RunLedger, RunLedgerBuilder, RunRecord};
pub use input::{InputError, RunInput, StreamInfo};
pub use notify::{
    notifier_from_config, DisabledNotifier, HttpNotifier, LifecycleEvent, NotificationError,
    Notifier, RenderedSessionNotifier, RunStatus,
};
