//! Transcoding/remux pipelines.
//!
//! A pipeline is an opaque child process that turns an input (upstream URL or
//! confined local file) into HLS artifacts under a per-session directory.
//! The supervisor owns spawn, monitoring, classification, and reaping; the
//! backend only builds the child.

pub mod supervisor;

use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::resolver::PLAYLIST_NAME;
use crate::resolver::decision::PlayStrategy;

pub use supervisor::{PipelineStatus, PipelineSupervisor};

/// Pipeline lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Starting,
    Running,
    Draining,
    Terminated,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

/// Pipeline input source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineInput {
    Upstream(Url),
    LocalFile(PathBuf),
}

impl PipelineInput {
    pub fn location(&self) -> String {
        match self {
            Self::Upstream(url) => url.as_str().to_string(),
            Self::LocalFile(path) => path.to_string_lossy().into_owned(),
        }
    }

    pub fn upstream_url(&self) -> Option<&Url> {
        match self {
            Self::Upstream(url) => Some(url),
            Self::LocalFile(_) => None,
        }
    }
}

/// Everything a backend needs to build the child.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub session_id: String,
    pub input: PipelineInput,
    /// Confined per-session output directory.
    pub output_dir: PathBuf,
    pub strategy: PlayStrategy,
    /// Target codec for transcodes.
    pub target_codec: Option<String>,
}

impl PipelineSpec {
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(PLAYLIST_NAME)
    }
}

/// Opaque pipeline backend: builds and spawns the child for a spec.
///
/// The supervisor contract is backend-agnostic; whether audio is handled by
/// a child process or a native codec library is a deployment concern.
pub trait PipelineBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawn the child. Must fail fast on a missing binary or invalid spec;
    /// stdin must be piped when the backend supports graceful stop bytes.
    fn spawn(&self, spec: &PipelineSpec) -> Result<tokio::process::Child>;

    /// Bytes written to stdin to request a graceful stop, if supported.
    fn quit_bytes(&self) -> Option<&'static [u8]> {
        None
    }
}

/// FFmpeg child-process backend.
pub struct FfmpegBackend {
    binary_path: String,
}

impl FfmpegBackend {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    fn build_args(&self, spec: &PipelineSpec) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into()];

        if matches!(spec.input, PipelineInput::LocalFile(_)) {
            // Pace file reads so VOD segments appear progressively.
            args.push("-re".into());
        }
        args.push("-i".into());
        args.push(spec.input.location());

        match spec.strategy {
            PlayStrategy::DirectPlay | PlayStrategy::Remux => {
                args.extend(["-c".into(), "copy".into()]);
            }
            PlayStrategy::TranscodeHw | PlayStrategy::TranscodeCpu => {
                let codec = spec.target_codec.as_deref().unwrap_or("h264");
                let encoder = match (spec.strategy, codec) {
                    (PlayStrategy::TranscodeHw, "h264") => "h264_vaapi",
                    (PlayStrategy::TranscodeHw, "hevc") => "hevc_vaapi",
                    (_, "hevc") => "libx265",
                    _ => "libx264",
                };
                args.extend([
                    "-c:v".into(),
                    encoder.into(),
                    "-c:a".into(),
                    "aac".into(),
                ]);
            }
            PlayStrategy::Reject => {
                return Err(Error::Pipeline("refusing to build a denied pipeline".into()));
            }
        }

        let segment_pattern = spec.output_dir.join("seg_%05d.ts");
        args.extend([
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            "4".into(),
            "-hls_list_size".into(),
            "0".into(),
            // Atomic playlist updates: write-temp-then-rename.
            "-hls_flags".into(),
            "temp_file".into(),
            "-hls_segment_filename".into(),
            segment_pattern.to_string_lossy().replace('\\', "/"),
            spec.playlist_path().to_string_lossy().replace('\\', "/"),
        ]);

        Ok(args)
    }
}

impl PipelineBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn spawn(&self, spec: &PipelineSpec) -> Result<tokio::process::Child> {
        let args = self.build_args(spec)?;
        process_utils::tokio_command(&self.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Pipeline(format!("failed to spawn ffmpeg: {e}")))
    }

    fn quit_bytes(&self) -> Option<&'static [u8]> {
        Some(b"q")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(strategy: PlayStrategy) -> PipelineSpec {
        PipelineSpec {
            session_id: "s-1".into(),
            input: PipelineInput::Upstream(Url::parse("http://box:8001/1:0:1:ABCD").unwrap()),
            output_dir: PathBuf::from("/srv/hls/s-1"),
            strategy,
            target_codec: None,
        }
    }

    #[test]
    fn remux_copies_streams() {
        let backend = FfmpegBackend::new("ffmpeg");
        let args = backend.build_args(&spec(PlayStrategy::Remux)).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("-f hls"));
        assert!(joined.contains("seg_%05d.ts"));
        assert!(joined.ends_with("index.m3u8"));
    }

    #[test]
    fn transcode_selects_encoder() {
        let backend = FfmpegBackend::new("ffmpeg");
        let mut s = spec(PlayStrategy::TranscodeCpu);
        s.target_codec = Some("h264".into());
        let args = backend.build_args(&s).unwrap();
        assert!(args.join(" ").contains("libx264"));

        s.strategy = PlayStrategy::TranscodeHw;
        let args = backend.build_args(&s).unwrap();
        assert!(args.join(" ").contains("h264_vaapi"));
    }

    #[test]
    fn local_files_are_paced() {
        let backend = FfmpegBackend::new("ffmpeg");
        let mut s = spec(PlayStrategy::Remux);
        s.input = PipelineInput::LocalFile(PathBuf::from("/media/rec.ts"));
        let args = backend.build_args(&s).unwrap();
        assert_eq!(args.iter().filter(|a| *a == "-re").count(), 1);
    }

    #[test]
    fn denied_specs_never_spawn() {
        let backend = FfmpegBackend::new("ffmpeg");
        assert!(backend.build_args(&spec(PlayStrategy::Reject)).is_err());
    }
}
