//! Probe module for collecting stream metadata.
//!
//! Runs ffprobe on a source file and reduces its JSON output to the
//! [`StreamMetadata`] consumed by the filter and profile stages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file has no video stream at all.
    #[error("No video stream found")]
    NoVideoStream,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Probed facts about a source video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMetadata {
    /// Codec name of the first video stream (e.g., "h264", "hevc").
    pub video_codec: String,
    /// Video width in pixels.
    pub width: u32,
    /// Video height in pixels.
    pub height: u32,
    /// Frame rate as reported, e.g. "30000/1001".
    pub frame_rate_raw: Option<String>,
    /// Frame rate in frames per second, if known.
    pub frame_rate: Option<f64>,
    /// Duration in seconds, if known.
    pub duration_secs: Option<f64>,
    /// Whether the source carries at least one audio stream.
    pub has_audio: bool,
}

impl StreamMetadata {
    /// The smaller of width and height.
    pub fn min_dimension(&self) -> u32 {
        self.width.min(self.height)
    }
}

/// Source of stream metadata.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<StreamMetadata, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parses a rational frame rate such as "30000/1001" or "25".
///
/// Returns `None` for "0/0" and other degenerate values.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };

    (rate.is_finite() && rate > 0.0).then_some(rate)
}

fn parse_duration(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Parses ffprobe JSON output into StreamMetadata.
pub fn parse_ffprobe_output(json_str: &str) -> Result<StreamMetadata, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let has_audio = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;

    // Prefer r_frame_rate; avg_frame_rate is "0/0" for some containers
    let (frame_rate_raw, frame_rate) = [&video.r_frame_rate, &video.avg_frame_rate]
        .into_iter()
        .flatten()
        .find_map(|raw| parse_frame_rate(raw).map(|fps| (Some(raw.clone()), Some(fps))))
        .unwrap_or((video.r_frame_rate.clone(), None));

    let duration_secs = parse_duration(video.duration.as_deref()).or_else(|| {
        parse_duration(
            ffprobe
                .format
                .as_ref()
                .and_then(|f| f.duration.as_deref()),
        )
    });

    Ok(StreamMetadata {
        video_codec: video.codec_name.clone().unwrap_or_default(),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        frame_rate_raw,
        frame_rate,
        duration_secs,
        has_audio,
    })
}

/// Prober backed by the ffprobe executable.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary: PathBuf,
}

impl FfprobeProber {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`.
    async fn probe(&self, path: &Path) -> Result<StreamMetadata, ProbeError> {
        let output = Command::new(&self.binary)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}

/// Prober that answers every request with the same metadata.
///
/// Handy when the metadata is already known, e.g. from a previous probe.
#[derive(Debug, Clone)]
pub struct FixedProber(pub StreamMetadata);

#[async_trait]
impl Prober for FixedProber {
    async fn probe(&self, _path: &Path) -> Result<StreamMetadata, ProbeError> {
        Ok(self.0.clone())
    }
}
