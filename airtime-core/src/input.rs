//! Run input: the segment list and the stream description written by the assembly stage.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::broadcaster::types::{Destination, Program, Segment, SegmentKind};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Read { source: io::Error, path: PathBuf },
    #[error("malformed {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("stream description has an empty id")]
    MissingId,
    #[error("invalid destination {0}")]
    InvalidDestination(String),
    #[error("no destination configured")]
    NoDestinations,
    #[error("segment list contains no video segment")]
    NoVideoSegments,
    #[error("segment not found: {0}")]
    MissingSegment(PathBuf),
    #[error("overlay image not found: {0}")]
    MissingOverlayImage(PathBuf),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeeTarget {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub stream_urls: Vec<String>,
    #[serde(default)]
    pub tee: Vec<TeeTarget>,
    #[serde(default)]
    pub overlay: Option<PathBuf>,
}

impl StreamInfo {
    /// Union of every destination form, in declaration order, without duplicates.
    pub fn destinations(&self) -> Result<Vec<Destination>, InputError> {
        let raw = self
            .stream_url
            .iter()
            .chain(self.stream_urls.iter())
            .chain(self.tee.iter().map(|target| &target.url))
            .filter(|url| !url.trim().is_empty());
        let mut destinations: Vec<Destination> = Vec::new();
        for url in raw {
            let destination = Destination::parse(url).map_err(InputError::InvalidDestination)?;
            if !destinations.contains(&destination) {
                destinations.push(destination);
            }
        }
        Ok(destinations)
    }
}

#[derive(Debug, Clone)]
pub struct RunInput {
    pub run_id: String,
    pub entries: Vec<Segment>,
    pub destinations: Vec<Destination>,
    /// Overlay declared by the stream description, not yet checked on disk.
    pub declared_overlay: Option<PathBuf>,
}

impl RunInput {
    pub fn load(segments_file: &Path, stream_info_file: &Path) -> Result<Self, InputError> {
        let info = load_stream_info(stream_info_file)?;
        let entries = load_segment_list(segments_file)?;
        Self::from_parts(info, entries)
    }

    pub fn from_parts(info: StreamInfo, entries: Vec<Segment>) -> Result<Self, InputError> {
        if info.id.trim().is_empty() {
            return Err(InputError::MissingId);
        }
        let destinations = info.destinations()?;
        Ok(Self {
            run_id: info.id.trim().to_string(),
            entries,
            destinations,
            declared_overlay: info.overlay,
        })
    }

    pub fn program(&self) -> Program {
        Program::from_entries(&self.entries)
    }

    /// First overlay image listed among the segments, if any.
    pub fn listed_overlay(&self) -> Option<&Segment> {
        self.entries
            .iter()
            .find(|entry| entry.kind() == SegmentKind::OverlayImage)
    }

    /// Checks everything that must hold before any external process is started.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.destinations.is_empty() {
            return Err(InputError::NoDestinations);
        }
        let mut has_video = false;
        for entry in &self.entries {
            match entry.kind() {
                SegmentKind::Video => {
                    has_video = true;
                    if !entry.path().is_file() {
                        return Err(InputError::MissingSegment(entry.path().to_path_buf()));
                    }
                }
                SegmentKind::OverlayImage => {
                    if !entry.path().is_file() {
                        return Err(InputError::MissingOverlayImage(entry.path().to_path_buf()));
                    }
                }
                SegmentKind::Other => {}
            }
        }
        if !has_video {
            return Err(InputError::NoVideoSegments);
        }
        Ok(())
    }
}

pub fn load_stream_info(path: &Path) -> Result<StreamInfo, InputError> {
    load_json(path)
}

pub fn load_segment_list(path: &Path) -> Result<Vec<Segment>, InputError> {
    let paths: Vec<PathBuf> = load_json(path)?;
    Ok(paths.into_iter().map(Segment::new).collect())
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, InputError> {
    let content = std::fs::read_to_string(path).map_err(|source| InputError::Read {
        source,
        path: path.to_path_buf(),
    })?;
    serde_json::from_str(&content).map_err(|source| InputError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn destinations_merge_all_forms_without_duplicates() {
        let info: StreamInfo = serde_json::from_str(
            r#"{
                "id": "live-1",
                "stream_url": "rtmp://a.example.com/app/k1",
                "stream_urls": ["rtmp://b.example.com/app/k2", "rtmp://a.example.com/app/k1"],
                "tee": [{"url": "rtmp://c.example.com/app/k3"}]
            }"#,
        )
        .unwrap();
        let urls: Vec<_> = info
            .destinations()
            .unwrap()
            .iter()
            .map(|d| d.url().to_string())
            .collect();
        assert_eq!(
            urls,
            vec![
                "rtmp://a.example.com/app/k1",
                "rtmp://b.example.com/app/k2",
                "rtmp://c.example.com/app/k3",
            ]
        );
    }

    #[test]
    fn load_reads_both_files() {
        let dir = TempDir::new().unwrap();
        let segment = write(&dir, "part1.ts", "x");
        let segments = write(
            &dir,
            "ts_paths.json",
            &serde_json::to_string(&vec![segment.clone()]).unwrap(),
        );
        let info = write(
            &dir,
            "stream_info.json",
            r#"{"id": "abc", "stream_url": "rtmp://live.example.com/app/key"}"#,
        );
        let input = RunInput::load(&segments, &info).unwrap();
        assert_eq!(input.run_id, "abc");
        assert_eq!(input.destinations.len(), 1);
        assert_eq!(input.program().len(), 1);
        input.validate().unwrap();
    }

    #[test]
    fn malformed_json_is_reported_with_path() {
        let dir = TempDir::new().unwrap();
        let info = write(&dir, "stream_info.json", "{ not json");
        let err = load_stream_info(&info).unwrap_err();
        assert!(matches!(err, InputError::Parse { ref path, .. } if path == &info));
    }

    #[test]
    fn validation_rejects_missing_listed_overlay() {
        let dir = TempDir::new().unwrap();
        let segment = write(&dir, "part1.ts", "x");
        let info = StreamInfo {
            id: "abc".into(),
            stream_url: Some("rtmp://live.example.com/app/key".into()),
            stream_urls: vec![],
            tee: vec![],
            overlay: None,
        };
        let input = RunInput::from_parts(
            info,
            vec![Segment::new(segment), Segment::new(dir.path().join("logo.png"))],
        )
        .unwrap();
        assert!(matches!(
            input.validate(),
            Err(InputError::MissingOverlayImage(_))
        ));
    }

    #[test]
    fn validation_requires_destination_and_video() {
        let info = StreamInfo {
            id: "abc".into(),
            stream_url: None,
            stream_urls: vec![],
            tee: vec![],
            overlay: None,
        };
        let input = RunInput::from_parts(info.clone(), vec![]).unwrap();
        assert!(matches!(input.validate(), Err(InputError::NoDestinations)));

        let with_destination = StreamInfo {
            stream_url: Some("rtmp://live.example.com/app/key".into()),
            ..info
        };
        let input = RunInput::from_parts(with_destination, vec![Segment::new("notes.txt")]).unwrap();
        assert!(matches!(input.validate(), Err(InputError::NoVideoSegments)));
    }
}
