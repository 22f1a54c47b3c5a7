//! Turns an inspected program into the ffmpeg invocation for one transmission.
//!
//! Every branch on "copy vs. filter" and "one vs. many destinations" is resolved here, once,
//! into the tagged variants of [`PipelineSpec`]. Nothing in this module touches the disk
//! except [`OverlayAsset::resolve`], which the controller calls before building.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{AirtimeConfig, EncodingSection, EngineSection, OverlaySection};
use crate::error::TransmissionError;

use super::types::{Destination, InspectedProgram};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayWindow {
    pub start: f64,
    pub end: f64,
}

impl OverlayWindow {
    /// Both bounds are clamped to `[0, total]`; the end never precedes the start.
    pub fn clamped(start: f64, end: f64, total: f64) -> Self {
        let limit = total.max(0.0);
        let start = start.clamp(0.0, limit);
        let end = end.clamp(0.0, limit).max(start);
        Self { start, end }
    }

    pub fn is_degenerate(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, seconds: f64) -> bool {
        !self.is_degenerate() && seconds >= self.start && seconds <= self.end
    }

    fn predicate(&self) -> String {
        format!(
            "between(t,{},{})",
            seconds_literal(self.start),
            seconds_literal(self.end)
        )
    }
}

fn seconds_literal(value: f64) -> String {
    let text = format!("{value:.3}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() {
        "0".to_string()
    } else {
        text.to_string()
    }
}

/// When the watermark flashes and how it is drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayPolicy {
    pub early_start_seconds: f64,
    pub tail_offset_seconds: f64,
    pub window_seconds: f64,
    pub scale_width: u32,
    pub margin: u32,
}

impl Default for OverlayPolicy {
    fn default() -> Self {
        Self::from_section(&OverlaySection::default())
    }
}

impl OverlayPolicy {
    pub fn from_section(section: &OverlaySection) -> Self {
        Self {
            early_start_seconds: section.early_start_seconds,
            tail_offset_seconds: section.tail_offset_seconds,
            window_seconds: section.window_seconds,
            scale_width: section.scale_width,
            margin: section.margin,
        }
    }

    /// One flash early in the program, one shortly before the end.
    pub fn windows(&self, total_duration: f64) -> [OverlayWindow; 2] {
        let early = OverlayWindow::clamped(
            self.early_start_seconds,
            self.early_start_seconds + self.window_seconds,
            total_duration,
        );
        let tail_start = (total_duration - self.tail_offset_seconds).max(0.0);
        let tail_end = (total_duration - self.tail_offset_seconds + self.window_seconds).max(0.0);
        let tail = OverlayWindow::clamped(tail_start, tail_end, total_duration);
        [early, tail]
    }

    pub fn enable_expression(windows: &[OverlayWindow]) -> String {
        let terms: Vec<String> = windows
            .iter()
            .filter(|window| !window.is_degenerate())
            .map(OverlayWindow::predicate)
            .collect();
        if terms.is_empty() {
            "0".to_string()
        } else {
            terms.join("+")
        }
    }
}

/// An overlay image that was found on disk and decodes as an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayAsset {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl OverlayAsset {
    pub fn resolve(path: &Path) -> Result<Self, TransmissionError> {
        if !path.is_file() {
            return Err(TransmissionError::Configuration(format!(
                "overlay asset {} not found",
                path.display()
            )));
        }
        let (width, height) = image::image_dimensions(path).map_err(|err| {
            TransmissionError::Configuration(format!(
                "overlay asset {} is not a readable image: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            width,
            height,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InputSource {
    /// Byte-level concatenation through the `concat:` protocol.
    ConcatProtocol(String),
    /// One `-i` per segment, joined by the filter graph.
    Slots(Vec<PathBuf>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterGraph {
    pub expression: String,
    pub video_label: String,
    pub audio_label: String,
    pub has_overlay: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "graph", rename_all = "snake_case")]
pub enum VideoPath {
    Copy,
    Filtered(FilterGraph),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "destinations", rename_all = "snake_case")]
pub enum OutputMode {
    Single(Destination),
    TeeFanout(Vec<Destination>),
}

impl OutputMode {
    pub fn destinations(&self) -> Vec<&Destination> {
        match self {
            OutputMode::Single(destination) => vec![destination],
            OutputMode::TeeFanout(destinations) => destinations.iter().collect(),
        }
    }
}

/// Fully resolved engine invocation. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSpec {
    pub input: InputSource,
    pub video: VideoPath,
    pub output: OutputMode,
    pub overlay: Option<PathBuf>,
    pub windows: Vec<OverlayWindow>,
    args: Vec<String>,
}

impl PipelineSpec {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Argument list with every destination URL masked, for logs and dry runs.
    pub fn redacted_args(&self) -> Vec<String> {
        let destinations = self.output.destinations();
        self.args
            .iter()
            .map(|arg| {
                destinations
                    .iter()
                    .fold(arg.clone(), |acc, destination| {
                        acc.replace(destination.url(), &destination.redacted())
                    })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    engine: EngineSection,
    encoding: EncodingSection,
    policy: OverlayPolicy,
}

impl PipelineBuilder {
    pub fn new(engine: EngineSection, encoding: EncodingSection, policy: OverlayPolicy) -> Self {
        Self {
            engine,
            encoding,
            policy,
        }
    }

    pub fn from_config(config: &AirtimeConfig) -> Self {
        Self::new(
            config.engine.clone(),
            config.encoding.clone(),
            OverlayPolicy::from_section(&config.overlay),
        )
    }

    pub fn policy(&self) -> &OverlayPolicy {
        &self.policy
    }

    pub fn build(
        &self,
        program: &InspectedProgram,
        overlay: Option<&OverlayAsset>,
        destinations: &[Destination],
    ) -> Result<PipelineSpec, TransmissionError> {
        if destinations.is_empty() {
            return Err(TransmissionError::Configuration(
                "at least one destination is required".into(),
            ));
        }
        if program.segments().is_empty() {
            return Err(TransmissionError::Configuration(
                "program has no video segments".into(),
            ));
        }

        let paths: Vec<PathBuf> = program
            .segments()
            .iter()
            .map(|entry| entry.segment.path().to_path_buf())
            .collect();
        let windows = match overlay {
            Some(_) => self.policy.windows(program.total_duration()).to_vec(),
            None => Vec::new(),
        };

        let (input, video) = if overlay.is_some() {
            let graph = self.overlay_graph(paths.len(), &windows);
            (InputSource::Slots(paths), VideoPath::Filtered(graph))
        } else if program.all_transport_streams() {
            (InputSource::ConcatProtocol(concat_source(&paths)), VideoPath::Copy)
        } else if paths.len() == 1 {
            (InputSource::Slots(paths), VideoPath::Copy)
        } else {
            let graph = concat_graph(paths.len());
            (InputSource::Slots(paths), VideoPath::Filtered(graph))
        };

        let output = if destinations.len() == 1 {
            OutputMode::Single(destinations[0].clone())
        } else {
            OutputMode::TeeFanout(destinations.to_vec())
        };

        let mut args = self.base_args();
        self.push_inputs(&mut args, &input, overlay);
        self.push_encoding(&mut args, &video, &output);
        self.push_output(&mut args, &output);

        Ok(PipelineSpec {
            input,
            video,
            output,
            overlay: overlay.map(|asset| asset.path.clone()),
            windows,
            args,
        })
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.engine.log_level.clone(),
        ];
        if !self.engine.stats_period.is_empty() {
            args.push("-stats_period".to_string());
            args.push(self.engine.stats_period.clone());
        }
        args
    }

    fn push_inputs(&self, args: &mut Vec<String>, input: &InputSource, overlay: Option<&OverlayAsset>) {
        let push_input = |args: &mut Vec<String>, source: String, realtime: bool| {
            if realtime && self.engine.realtime {
                args.push("-re".to_string());
            }
            args.push("-thread_queue_size".to_string());
            args.push(self.engine.thread_queue_size.to_string());
            args.push("-i".to_string());
            args.push(source);
        };
        match input {
            InputSource::ConcatProtocol(source) => push_input(args, source.clone(), true),
            InputSource::Slots(paths) => {
                for path in paths {
                    push_input(args, path.to_string_lossy().to_string(), true);
                }
            }
        }
        if let Some(asset) = overlay {
            push_input(args, asset.path.to_string_lossy().to_string(), false);
        }
    }

    fn push_encoding(&self, args: &mut Vec<String>, video: &VideoPath, output: &OutputMode) {
        match video {
            VideoPath::Copy => {
                if matches!(output, OutputMode::TeeFanout(_)) {
                    args.extend(["-map", "0:v?", "-map", "0:a?"].map(String::from));
                }
                args.push("-c".to_string());
                args.push("copy".to_string());
            }
            VideoPath::Filtered(graph) => {
                let encoding = &self.encoding;
                args.push("-filter_complex".to_string());
                args.push(graph.expression.clone());
                args.push("-map".to_string());
                args.push(format!("[{}]", graph.video_label));
                args.push("-map".to_string());
                args.push(format!("[{}]", graph.audio_label));
                args.extend([
                    "-c:v".to_string(),
                    encoding.video_codec.clone(),
                    "-preset".to_string(),
                    encoding.preset.clone(),
                    "-crf".to_string(),
                    encoding.crf.to_string(),
                    "-pix_fmt".to_string(),
                    encoding.pix_fmt.clone(),
                    "-c:a".to_string(),
                    encoding.audio_codec.clone(),
                    "-ar".to_string(),
                    encoding.audio_sample_rate.to_string(),
                    "-ac".to_string(),
                    encoding.audio_channels.to_string(),
                    "-b:a".to_string(),
                    encoding.audio_bitrate.clone(),
                ]);
            }
        }
    }

    fn push_output(&self, args: &mut Vec<String>, output: &OutputMode) {
        let container = &self.engine.container;
        match output {
            OutputMode::Single(destination) => {
                args.push("-f".to_string());
                args.push(container.clone());
                args.push(destination.url().to_string());
            }
            OutputMode::TeeFanout(destinations) => {
                let slaves: Vec<String> = destinations
                    .iter()
                    .map(|destination| format!("[f={container}:onfail=ignore]{}", destination.url()))
                    .collect();
                args.push("-f".to_string());
                args.push("tee".to_string());
                args.push(slaves.join("|"));
            }
        }
    }

    fn overlay_graph(&self, inputs: usize, windows: &[OverlayWindow]) -> FilterGraph {
        let concat = concat_graph(inputs);
        let margin = self.policy.margin;
        let expression = format!(
            "{concat};[{inputs}:v]scale={width}:-1[wm];[{video}][wm]overlay={margin}:H-h-{margin}:enable='{enable}'[vout]",
            concat = concat.expression,
            width = self.policy.scale_width,
            video = concat.video_label,
            enable = OverlayPolicy::enable_expression(windows),
        );
        FilterGraph {
            expression,
            video_label: "vout".to_string(),
            audio_label: concat.audio_label,
            has_overlay: true,
        }
    }
}

fn concat_source(paths: &[PathBuf]) -> String {
    let joined: Vec<String> = paths
        .iter()
        .map(|path| path.to_string_lossy().to_string())
        .collect();
    format!("concat:{}", joined.join("|"))
}

fn concat_graph(inputs: usize) -> FilterGraph {
    let pads: String = (0..inputs).map(|index| format!("[{index}:v][{index}:a]")).collect();
    FilterGraph {
        expression: format!("{pads}concat=n={inputs}:v=1:a=1[vcat][acat]"),
        video_label: "vcat".to_string(),
        audio_label: "acat".to_string(),
        has_overlay: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::types::{Segment, TimedSegment};

    fn program(entries: &[(&str, f64)]) -> InspectedProgram {
        InspectedProgram::new(
            entries
                .iter()
                .map(|(path, duration_s)| TimedSegment {
                    segment: Segment::new(*path),
                    duration_s: *duration_s,
                })
                .collect(),
        )
    }

    fn destination(url: &str) -> Destination {
        Destination::parse(url).unwrap()
    }

    fn builder() -> PipelineBuilder {
        PipelineBuilder::new(
            EngineSection::default(),
            EncodingSection::default(),
            OverlayPolicy::default(),
        )
    }

    fn asset() -> OverlayAsset {
        OverlayAsset {
            path: PathBuf::from("/work/logo.png"),
            width: 400,
            height: 200,
        }
    }

    #[test]
    fn tail_window_clamps_on_short_programs() {
        let policy = OverlayPolicy::default();
        let [early, tail] = policy.windows(200.0);
        assert_eq!(tail, OverlayWindow { start: 0.0, end: 0.0 });
        assert!(tail.is_degenerate());
        assert!(!tail.contains(0.0));
        assert!(early.is_degenerate());
    }

    #[test]
    fn windows_for_long_program() {
        let [early, tail] = OverlayPolicy::default().windows(1000.0);
        assert_eq!(early, OverlayWindow { start: 250.0, end: 260.0 });
        assert_eq!(tail, OverlayWindow { start: 760.0, end: 770.0 });
        assert!(tail.contains(765.0));
        assert!(!tail.contains(771.0));
    }

    #[test]
    fn enable_expression_skips_degenerate_windows() {
        let windows = OverlayPolicy::default().windows(1000.0);
        assert_eq!(
            OverlayPolicy::enable_expression(&windows),
            "between(t,250,260)+between(t,760,770)"
        );
        let short = OverlayPolicy::default().windows(200.0);
        assert_eq!(OverlayPolicy::enable_expression(&short), "0");
        let partial = OverlayPolicy::default().windows(255.5);
        assert_eq!(
            OverlayPolicy::enable_expression(&partial),
            "between(t,250,255.5)+between(t,15.5,25.5)"
        );
    }

    #[test]
    fn transport_streams_use_concat_protocol_and_copy() {
        let spec = builder()
            .build(
                &program(&[("/w/a.ts", 10.0), ("/w/b.ts", 20.0)]),
                None,
                &[destination("rtmp://live.example.com/app/key")],
            )
            .unwrap();
        assert_eq!(spec.input, InputSource::ConcatProtocol("concat:/w/a.ts|/w/b.ts".into()));
        assert_eq!(spec.video, VideoPath::Copy);
        assert!(spec.windows.is_empty());
        assert_eq!(
            spec.args(),
            [
                "-hide_banner",
                "-loglevel",
                "info",
                "-re",
                "-thread_queue_size",
                "512",
                "-i",
                "concat:/w/a.ts|/w/b.ts",
                "-c",
                "copy",
                "-f",
                "flv",
                "rtmp://live.example.com/app/key",
            ]
        );
    }

    #[test]
    fn overlay_uses_input_slots_and_reencodes() {
        let spec = builder()
            .build(
                &program(&[("/w/a.ts", 500.0), ("/w/b.ts", 500.0)]),
                Some(&asset()),
                &[destination("rtmp://live.example.com/app/key")],
            )
            .unwrap();
        assert_eq!(
            spec.input,
            InputSource::Slots(vec![PathBuf::from("/w/a.ts"), PathBuf::from("/w/b.ts")])
        );
        let VideoPath::Filtered(graph) = &spec.video else {
            panic!("overlay must filter");
        };
        assert_eq!(
            graph.expression,
            "[0:v][0:a][1:v][1:a]concat=n=2:v=1:a=1[vcat][acat];[2:v]scale=200:-1[wm];\
             [vcat][wm]overlay=10:H-h-10:enable='between(t,250,260)+between(t,760,770)'[vout]"
        );
        let args = spec.args();
        let position = |needle: &str| args.iter().position(|arg| arg == needle).unwrap();
        assert!(args.contains(&"/work/logo.png".to_string()));
        assert_eq!(args[position("-c:v") + 1], "libx264");
        assert_eq!(args[position("-preset") + 1], "veryfast");
        assert_eq!(args[position("-ar") + 1], "44100");
        assert_eq!(args[position("-ac") + 1], "2");
        assert!(!args.contains(&"copy".to_string()));
        assert_eq!(spec.windows.len(), 2);
    }

    #[test]
    fn overlay_image_is_not_read_in_realtime() {
        let spec = builder()
            .build(
                &program(&[("/w/a.ts", 30.0)]),
                Some(&asset()),
                &[destination("rtmp://live.example.com/app/key")],
            )
            .unwrap();
        let args = spec.args();
        let logo = args.iter().position(|arg| arg == "/work/logo.png").unwrap();
        assert_eq!(args[logo - 1], "-i");
        assert_ne!(args[logo - 4], "-re");
        assert_eq!(args.iter().filter(|arg| *arg == "-re").count(), 1);
    }

    #[test]
    fn many_destinations_fan_out_with_fault_isolation() {
        let spec = builder()
            .build(
                &program(&[("/w/a.ts", 10.0)]),
                None,
                &[
                    destination("rtmp://a.example.com/app/k1"),
                    destination("rtmp://b.example.com/app/k2"),
                ],
            )
            .unwrap();
        assert!(matches!(spec.output, OutputMode::TeeFanout(ref d) if d.len() == 2));
        let args = spec.args();
        assert_eq!(
            &args[args.len() - 3..],
            [
                "-f",
                "tee",
                "[f=flv:onfail=ignore]rtmp://a.example.com/app/k1|[f=flv:onfail=ignore]rtmp://b.example.com/app/k2",
            ]
        );
        assert!(args.windows(2).any(|pair| pair == ["-map", "0:v?"]));
    }

    #[test]
    fn mixed_containers_are_joined_by_filter() {
        let spec = builder()
            .build(
                &program(&[("/w/a.mp4", 10.0), ("/w/b.ts", 10.0)]),
                None,
                &[destination("rtmp://live.example.com/app/key")],
            )
            .unwrap();
        let VideoPath::Filtered(graph) = &spec.video else {
            panic!("mixed inputs must be filtered");
        };
        assert!(!graph.has_overlay);
        assert_eq!(graph.video_label, "vcat");
        assert!(spec.args().windows(2).any(|pair| pair == ["-map", "[vcat]"]));
    }

    #[test]
    fn single_non_transport_segment_is_copied() {
        let spec = builder()
            .build(
                &program(&[("/w/a.mp4", 10.0)]),
                None,
                &[destination("rtmp://live.example.com/app/key")],
            )
            .unwrap();
        assert_eq!(spec.video, VideoPath::Copy);
        assert_eq!(spec.input, InputSource::Slots(vec![PathBuf::from("/w/a.mp4")]));
    }

    #[test]
    fn empty_destinations_is_a_configuration_error() {
        let err = builder()
            .build(&program(&[("/w/a.ts", 10.0)]), None, &[])
            .unwrap_err();
        assert!(matches!(err, TransmissionError::Configuration(_)));
    }

    #[test]
    fn missing_overlay_asset_is_a_configuration_error() {
        let err = OverlayAsset::resolve(Path::new("/nonexistent/logo.png")).unwrap_err();
        assert!(matches!(err, TransmissionError::Configuration(_)));
    }

    #[test]
    fn unreadable_overlay_asset_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logo.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        let err = OverlayAsset::resolve(&path).unwrap_err();
        assert!(matches!(err, TransmissionError::Configuration(_)));
    }

    #[test]
    fn redacted_args_hide_stream_keys() {
        let spec = builder()
            .build(
                &program(&[("/w/a.ts", 10.0)]),
                None,
                &[destination("rtmp://live.example.com/app/secret")],
            )
            .unwrap();
        let redacted = spec.redacted_args();
        assert_eq!(redacted.last().unwrap(), "rtmp://live.example.com/app/****");
        assert!(!redacted.iter().any(|arg| arg.contains("secret")));
    }
}
