//! ffmpeg-backed [`Transcoder`].
//!
//! Runs one ffmpeg process per command with machine-readable progress on
//! stdout, keeps the tail of stderr for diagnosis, and removes partial output
//! when the run fails.

use super::progress::{parse_progress_line, ProgressLine, ProgressTracker};
use super::{EncodeError, TranscodeCommand, Transcoder};
use crate::reporter::Reporter;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Lines of stderr attached to a failure
pub const STDERR_TAIL_LINES: usize = 40;

/// Flags placed before every command
const GLOBAL_ARGS: [&str; 5] = ["-hide_banner", "-y", "-nostats", "-progress", "pipe:1"];

#[derive(Debug, Clone)]
pub struct FfmpegExecutor {
    binary: PathBuf,
    progress_threshold: f64,
}

impl FfmpegExecutor {
    pub fn new(binary: impl Into<PathBuf>, progress_threshold: f64) -> Self {
        Self {
            binary: binary.into(),
            progress_threshold,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Full argument vector for a command, global flags included.
    pub fn build_args(&self, command: &TranscodeCommand) -> Vec<String> {
        let mut args: Vec<String> = GLOBAL_ARGS.iter().map(|a| a.to_string()).collect();
        args.extend(command.args());
        args
    }

    /// Printable command line, for logs.
    pub fn command_line(&self, command: &TranscodeCommand) -> String {
        std::iter::once(self.binary.to_string_lossy().into_owned())
            .chain(self.build_args(command).into_iter().map(|arg| quote(&arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains(|c: char| c.is_whitespace() || "'\";[]".contains(c)) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[async_trait]
impl Transcoder for FfmpegExecutor {
    async fn run(&self, command: &TranscodeCommand, reporter: &dyn Reporter) -> Result<(), EncodeError> {
        let output_name = command.output.display().to_string();
        reporter.info(&format!("Starting transcode: {}", self.command_line(command)));

        let mut child = Command::new(&self.binary)
            .args(self.build_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncodeError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        // Drain stderr concurrently so the process never blocks on it
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        let started = Instant::now();
        let mut tracker = ProgressTracker::new(command.duration_secs, self.progress_threshold);
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                match parse_progress_line(&line) {
                    Some(ProgressLine::OutTime(secs)) => {
                        if let Some(update) = tracker.observe(secs, started.elapsed()) {
                            let eta = update
                                .eta
                                .map(|eta| format!(", ETA {:.0}s", eta.as_secs_f64()))
                                .unwrap_or_default();
                            reporter.verbose(&format!(
                                "Transcoding {}: {:.0}%{}",
                                output_name, update.percent, eta
                            ));
                            reporter.progress(update.percent);
                        }
                    }
                    Some(ProgressLine::End) | None => {}
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            remove_partial(&command.output).await;
            reporter.error(&format!(
                "Transcode of {} failed ({}):\n{}",
                output_name,
                status,
                stderr
            ));
            return Err(EncodeError::Failed {
                code: status.code(),
                stderr,
            });
        }

        if !tokio::fs::try_exists(&command.output).await.unwrap_or(false) {
            reporter.error(&format!("Transcode of {} produced no output", output_name));
            return Err(EncodeError::MissingOutput(command.output.clone()));
        }

        reporter.info(&format!(
            "Finished transcode: {} in {:.1}s",
            output_name,
            started.elapsed().as_secs_f64()
        ));
        Ok(())
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            let _ = tokio::fs::remove_dir_all(path).await;
        }
        Ok(_) => {
            let _ = tokio::fs::remove_file(path).await;
        }
        Err(_) => {}
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_scripts {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Write an executable `sh` script standing in for ffmpeg.
    pub fn fake_ffmpeg(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Succeeds, reporting progress over a 10s output and writing the last
    /// argument.
    pub const SUCCEEDING: &str = r#"for last; do :; done
for t in 1000000 2000000 5000000 10000000; do
  echo "out_time_us=$t"
  echo "progress=continue"
done
echo "progress=end"
printf 'encoded' > "$last""#;

    /// Writes a partial output, complains on stderr, exits 3.
    pub const FAILING: &str = r#"for last; do :; done
printf 'partial' > "$last"
i=0
while [ $i -lt 60 ]; do
  echo "stderr line $i" >&2
  i=$((i + 1))
done
echo "Unknown encoder 'libnope'" >&2
exit 3"#;
}
