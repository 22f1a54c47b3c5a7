use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::broadcaster::engine::EngineError;
use crate::broadcaster::inspector::InspectionError;
use crate::input::InputError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Everything that can end a transmission attempt.
///
/// The first four variants abort the run before or at engine launch. `Engine` is only
/// produced after the engine exits and is folded into the run outcome.
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("invalid run input: {0}")]
    Validation(String),
    #[error("duration probe failed: {0}")]
    Inspection(#[from] InspectionError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("engine launch failed: {0}")]
    Launch(#[from] EngineError),
    #[error("transmission failed: {detail}")]
    Engine {
        exit_code: Option<i32>,
        detail: String,
    },
}

impl TransmissionError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransmissionError::Validation(_) => "validation",
            TransmissionError::Inspection(_) => "inspection",
            TransmissionError::Configuration(_) => "configuration",
            TransmissionError::Launch(_) => "launch",
            TransmissionError::Engine { .. } => "engine",
        }
    }

    /// True for errors raised before the engine produced a terminal status.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransmissionError::Engine { .. })
    }
}

impl From<InputError> for TransmissionError {
    fn from(error: InputError) -> Self {
        match error {
            InputError::NoDestinations => TransmissionError::Configuration(error.to_string()),
            other => TransmissionError::Validation(other.to_string()),
        }
    }
}
