use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use url::Url;

const VIDEO_EXTENSIONS: &[&str] = &["ts", "m2ts", "mts", "mp4", "m4v", "mkv", "mov", "flv", "webm"];
const TRANSPORT_STREAM_EXTENSIONS: &[&str] = &["ts", "m2ts", "mts"];
const OVERLAY_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Video,
    OverlayImage,
    Other,
}

impl SegmentKind {
    pub fn from_path(path: &Path) -> Self {
        let Some(ext) = extension(path) else {
            return SegmentKind::Other;
        };
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            SegmentKind::Video
        } else if OVERLAY_EXTENSIONS.contains(&ext.as_str()) {
            SegmentKind::OverlayImage
        } else {
            SegmentKind::Other
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    path: PathBuf,
    kind: SegmentKind,
}

impl Segment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = SegmentKind::from_path(&path);
        Self { path, kind }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn is_video(&self) -> bool {
        self.kind == SegmentKind::Video
    }

    /// MPEG-TS segments can be joined byte-for-byte with the concat protocol.
    pub fn is_transport_stream(&self) -> bool {
        extension(&self.path)
            .map(|ext| TRANSPORT_STREAM_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Video segments in playback order, before their durations are known.
#[derive(Debug, Clone, Default)]
pub struct Program {
    segments: Vec<Segment>,
}

impl Program {
    /// Keeps only video entries; everything else is excluded from timing and concatenation.
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a Segment>,
    {
        Self {
            segments: entries
                .into_iter()
                .filter(|segment| segment.is_video())
                .cloned()
                .collect(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimedSegment {
    pub segment: Segment,
    pub duration_s: f64,
}

/// A program whose every segment carries a resolved duration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InspectedProgram {
    segments: Vec<TimedSegment>,
    total_duration: f64,
}

impl InspectedProgram {
    pub fn new(segments: Vec<TimedSegment>) -> Self {
        let total_duration = segments.iter().map(|entry| entry.duration_s).sum();
        Self {
            segments,
            total_duration,
        }
    }

    pub fn segments(&self) -> &[TimedSegment] {
        &self.segments
    }

    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    pub fn all_transport_streams(&self) -> bool {
        !self.segments.is_empty()
            && self
                .segments
                .iter()
                .all(|entry| entry.segment.is_transport_stream())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Destination {
    url: String,
}

impl Destination {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let parsed = Url::parse(trimmed).map_err(|err| format!("{trimmed}: {err}"))?;
        if !parsed.has_host() {
            return Err(format!("{trimmed}: destination has no host"));
        }
        Ok(Self {
            url: trimmed.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The URL with its last path segment (usually the stream key) masked.
    pub fn redacted(&self) -> String {
        let Ok(mut parsed) = Url::parse(&self.url) else {
            return "****".to_string();
        };
        let segments: Vec<String> = parsed
            .path_segments()
            .map(|parts| {
                parts
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if segments.is_empty() {
            return parsed.to_string();
        }
        let mut masked = String::new();
        for part in &segments[..segments.len() - 1] {
            masked.push('/');
            masked.push_str(part);
        }
        masked.push_str("/****");
        parsed.set_path(&masked);
        parsed.set_query(None);
        parsed.to_string()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    #[default]
    NotStarted,
    Started,
    Failed,
}

impl DestinationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationStatus::NotStarted => "not_started",
            DestinationStatus::Started => "started",
            DestinationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DestinationStatus::NotStarted)
    }
}

impl fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DestinationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "started" => Ok(Self::Started),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid destination status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timed(path: &str, duration_s: f64) -> TimedSegment {
        TimedSegment {
            segment: Segment::new(path),
            duration_s,
        }
    }

    #[test]
    fn classifies_segments_by_extension() {
        assert_eq!(Segment::new("/a/one.ts").kind(), SegmentKind::Video);
        assert_eq!(Segment::new("/a/TWO.MP4").kind(), SegmentKind::Video);
        assert_eq!(Segment::new("/a/logo.PNG").kind(), SegmentKind::OverlayImage);
        assert_eq!(Segment::new("/a/notes.txt").kind(), SegmentKind::Other);
        assert_eq!(Segment::new("/a/noext").kind(), SegmentKind::Other);
        assert!(Segment::new("/a/one.ts").is_transport_stream());
        assert!(!Segment::new("/a/one.mp4").is_transport_stream());
    }

    #[test]
    fn program_keeps_video_in_order() {
        let entries = vec![
            Segment::new("b.ts"),
            Segment::new("logo.png"),
            Segment::new("a.ts"),
            Segment::new("list.json"),
        ];
        let program = Program::from_entries(&entries);
        let names: Vec<_> = program.segments().iter().map(Segment::display_name).collect();
        assert_eq!(names, vec!["b.ts", "a.ts"]);
    }

    #[test]
    fn total_duration_is_exact_sum() {
        assert_eq!(InspectedProgram::new(vec![]).total_duration(), 0.0);
        assert_eq!(
            InspectedProgram::new(vec![timed("a.ts", 12.5)]).total_duration(),
            12.5
        );
        let many = InspectedProgram::new(vec![
            timed("a.ts", 10.25),
            timed("b.ts", 20.5),
            timed("c.ts", 30.0),
        ]);
        assert_eq!(many.total_duration(), 60.75);
        assert!(many.all_transport_streams());
    }

    #[test]
    fn destination_requires_host() {
        assert!(Destination::parse("rtmp://live.example.com/app/key").is_ok());
        assert!(Destination::parse("not a url").is_err());
        assert!(Destination::parse("mailto:ops@example.com").is_err());
    }

    #[test]
    fn redaction_masks_stream_key() {
        let destination = Destination::parse("rtmp://live.example.com/app/secret-key").unwrap();
        assert_eq!(destination.redacted(), "rtmp://live.example.com/app/****");
        assert_eq!(destination.url(), "rtmp://live.example.com/app/secret-key");
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            DestinationStatus::NotStarted,
            DestinationStatus::Started,
            DestinationStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DestinationStatus>().unwrap(), status);
        }
    }
}
