//! Transcoder invocation for clipcache
//!
//! [`TranscodeCommand`] is the transcoder-agnostic description of one run:
//! inputs, output arguments and the output path. The [`Transcoder`] trait
//! executes it; [`FfmpegExecutor`] is the ffmpeg-backed implementation.

pub mod ffmpeg;
pub mod progress;

pub use ffmpeg::{FfmpegExecutor, STDERR_TAIL_LINES};
pub use progress::{parse_progress_line, ProgressLine, ProgressTracker, ProgressUpdate};

use crate::profile::{AudioSpec, EncodeSpec};
use crate::reporter::Reporter;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for transcoder runs
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The transcoder binary could not be started
    #[error("Failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The transcoder exited unsuccessfully
    #[error("Transcoder {}: {stderr}", exit_label(*.code))]
    Failed { code: Option<i32>, stderr: String },

    /// The transcoder reported success but wrote nothing
    #[error("Transcoder produced no output at {}", .0.display())]
    MissingOutput(PathBuf),

    /// IO error while supervising the run
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("failed with exit code {}", code),
        None => "was terminated by signal".to_string(),
    }
}

/// One transcoder input with the options that precede its `-i`.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeInput {
    pub path: PathBuf,
    pub pre_args: Vec<String>,
}

impl TranscodeInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pre_args: Vec::new(),
        }
    }
}

/// A fully resolved transcoder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeCommand {
    pub inputs: Vec<TranscodeInput>,
    pub output_args: Vec<String>,
    pub output: PathBuf,
    /// Expected output duration, used to turn timestamps into percentages
    pub duration_secs: Option<f64>,
}

impl TranscodeCommand {
    /// Realize an encode specification for one source and output path.
    pub fn from_spec(
        spec: &EncodeSpec,
        source: &Path,
        output: &Path,
        duration_secs: Option<f64>,
    ) -> Self {
        let mut inputs = vec![TranscodeInput::new(source)];
        inputs.extend(spec.extra_inputs.iter().map(TranscodeInput::new));

        let mut args = vec![
            "-filter_complex".to_string(),
            spec.filter_graph.clone(),
            "-map".to_string(),
            format!("[{}]", spec.video_label),
            "-c:v".to_string(),
            spec.video_codec.clone(),
        ];
        args.extend(spec.output_options.iter().cloned());

        match &spec.audio {
            AudioSpec::None => args.push("-an".to_string()),
            AudioSpec::Encode {
                codec,
                channels,
                quality,
                bitrate,
            } => {
                // Optional mapping: sources without audio still succeed
                args.extend(["-map".to_string(), "0:a?".to_string()]);
                args.extend(["-c:a".to_string(), codec.clone()]);
                if let Some(channels) = channels {
                    args.extend(["-ac".to_string(), channels.to_string()]);
                }
                if let Some(quality) = quality {
                    args.extend(["-q:a".to_string(), quality.to_string()]);
                }
                if let Some(bitrate) = bitrate {
                    args.extend(["-b:a".to_string(), bitrate.clone()]);
                }
            }
        }
        args.extend(spec.container_flags.iter().cloned());

        Self {
            inputs,
            output_args: args,
            output: output.to_path_buf(),
            duration_secs,
        }
    }

    /// Arguments for one invocation, after the global flags.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for input in &self.inputs {
            args.extend(input.pre_args.iter().cloned());
            args.push("-i".to_string());
            args.push(input.path.to_string_lossy().into_owned());
        }
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Runs transcode commands.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Run one command to completion, reporting its lifecycle.
    ///
    /// On failure nothing is left at `command.output`.
    async fn run(&self, command: &TranscodeCommand, reporter: &dyn Reporter) -> Result<(), EncodeError>;
}
