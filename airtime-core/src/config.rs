use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const STATUS_URL_ENV: &str = "AIRTIME_STATUS_URL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AirtimeConfig {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub encoding: EncodingSection,
    #[serde(default)]
    pub overlay: OverlaySection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub notification: NotificationSection,
    #[serde(default)]
    pub history: HistorySection,
    /// Directory relative paths are resolved against; set by the loader.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl AirtimeConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        match &self.base_dir {
            Some(base) if !path.is_absolute() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.artifacts_dir)
    }

    pub fn segments_file(&self) -> PathBuf {
        self.artifacts_dir().join(&self.paths.segments_file)
    }

    pub fn stream_info_file(&self) -> PathBuf {
        self.artifacts_dir().join(&self.paths.stream_info_file)
    }

    pub fn overlay_asset(&self) -> Option<PathBuf> {
        self.overlay
            .asset
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(|value| self.resolve_path(value))
    }

    pub fn history_database(&self) -> Option<PathBuf> {
        self.history
            .database
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(|value| self.resolve_path(value))
    }

    /// Notification endpoint from the config file, falling back to the environment.
    pub fn status_endpoint(&self) -> Option<String> {
        self.notification
            .endpoint
            .clone()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| {
                std::env::var(STATUS_URL_ENV)
                    .ok()
                    .filter(|value| !value.trim().is_empty())
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub artifacts_dir: String,
    pub segments_file: String,
    pub stream_info_file: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            artifacts_dir: "artefatos/video_final".into(),
            segments_file: "ts_paths.json".into(),
            stream_info_file: "stream_info.json".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub log_level: String,
    pub stats_period: String,
    pub thread_queue_size: u32,
    pub realtime: bool,
    pub container: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            log_level: "info".into(),
            stats_period: String::new(),
            thread_queue_size: 512,
            realtime: true,
            container: "flv".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncodingSection {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub pix_fmt: String,
    pub audio_codec: String,
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
    pub audio_bitrate: String,
}

impl Default for EncodingSection {
    fn default() -> Self {
        Self {
            video_codec: "libx264".into(),
            preset: "veryfast".into(),
            crf: 23,
            pix_fmt: "yuv420p".into(),
            audio_codec: "aac".into(),
            audio_sample_rate: 44_100,
            audio_channels: 2,
            audio_bitrate: "128k".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlaySection {
    pub asset: Option<String>,
    pub scale_width: u32,
    pub margin: u32,
    pub early_start_seconds: f64,
    pub tail_offset_seconds: f64,
    pub window_seconds: f64,
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            asset: None,
            scale_width: 200,
            margin: 10,
            early_start_seconds: 250.0,
            tail_offset_seconds: 240.0,
            window_seconds: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub attribute_unlabelled_progress: bool,
    pub drain_timeout_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            attribute_unlabelled_progress: true,
            drain_timeout_ms: 2_000,
        }
    }
}

impl MonitorSection {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    #[default]
    Plain,
    Rendered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartedTrigger {
    #[default]
    Delay,
    FirstDestination,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    pub endpoint: Option<String>,
    pub mode: NotificationMode,
    pub started_trigger: StartedTrigger,
    pub started_delay_seconds: u64,
    pub timeout_seconds: u64,
    pub render_wait_ms: u64,
    pub chromium_executable: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            mode: NotificationMode::Plain,
            started_trigger: StartedTrigger::Delay,
            started_delay_seconds: 5,
            timeout_seconds: 30,
            render_wait_ms: 2_000,
            chromium_executable: None,
            headless: true,
            sandbox: false,
        }
    }
}

impl NotificationSection {
    pub fn started_delay(&self) -> Duration {
        Duration::from_secs(self.started_delay_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn render_wait(&self) -> Duration {
        Duration::from_millis(self.render_wait_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub database: Option<String>,
}

pub fn load_airtime_config<P: AsRef<Path>>(path: P) -> Result<AirtimeConfig> {
    let path = path.as_ref();
    let mut config: AirtimeConfig = load_toml(path)?;
    config.base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf);
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
