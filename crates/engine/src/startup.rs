//! Startup checks for clipcache
//!
//! Locates the `ffmpeg` and `ffprobe` executables and verifies that ffmpeg
//! runs before any job is accepted:
//! - the configured cache-binaries directory is searched first
//! - with `auto_provision`, binaries are expected there and nowhere else
//! - otherwise `PATH` is searched

use clipcache_config::Config;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

pub const FFMPEG: &str = "ffmpeg";
pub const FFPROBE: &str = "ffprobe";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{name} not found in the cache binaries directory or on PATH")]
    NotFound { name: String },

    /// Auto-provisioning is on but the binary has not been placed yet
    #[error("{name} has not been provisioned into {}", dir.display())]
    NotProvisioned { name: String, dir: PathBuf },

    #[error("{name} is not usable: {reason}")]
    Unusable { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Located transcoder executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binaries {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Version token reported by `ffmpeg -version`, e.g. "6.1.1" or "n8.0-3"
    pub ffmpeg_version: Option<String>,
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

/// Find one binary per the lookup order above.
pub fn locate_binary(
    name: &str,
    cache_binaries_dir: Option<&Path>,
    auto_provision: bool,
) -> Result<PathBuf, StartupError> {
    if let Some(dir) = cache_binaries_dir {
        let candidate = dir.join(executable_name(name));
        if candidate.is_file() {
            return Ok(candidate);
        }
        if auto_provision {
            return Err(StartupError::NotProvisioned {
                name: name.to_string(),
                dir: dir.to_path_buf(),
            });
        }
    }

    which::which(name).map_err(|_| StartupError::NotFound {
        name: name.to_string(),
    })
}

/// Extract the version token from `ffmpeg -version` output.
///
/// Handles both release ("ffmpeg version 6.1.1-static ...") and
/// git-describe ("ffmpeg version n8.0-3-g1234 ...") forms.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<String> {
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;
    let lower = line.to_lowercase();
    let start = lower.find("ffmpeg version")? + "ffmpeg version".len();
    lower[start..].split_whitespace().next().map(str::to_string)
}

/// Major version of a version token, ignoring an `n` prefix.
pub fn major_version(version: &str) -> Option<u32> {
    version
        .trim_start_matches('n')
        .split(['.', '-'])
        .next()?
        .parse()
        .ok()
}

/// Run `<binary> -version` and return the parsed version, if any.
pub async fn probe_version(name: &str, binary: &Path) -> Result<Option<String>, StartupError> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .await
        .map_err(|e| StartupError::Unusable {
            name: name.to_string(),
            reason: format!("failed to run {} -version: {}", binary.display(), e),
        })?;

    if !output.status.success() {
        return Err(StartupError::Unusable {
            name: name.to_string(),
            reason: format!("{} -version exited with {}", binary.display(), output.status),
        });
    }

    Ok(parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout)))
}

/// Locate both binaries and check that ffmpeg runs.
pub async fn run_startup_checks(config: &Config) -> Result<Binaries, StartupError> {
    let dir = config.binaries.cache_binaries_dir.as_deref();
    let auto = config.binaries.auto_provision;

    let ffmpeg = locate_binary(FFMPEG, dir, auto)?;
    let ffprobe = locate_binary(FFPROBE, dir, auto)?;
    let ffmpeg_version = probe_version(FFMPEG, &ffmpeg).await?;

    Ok(Binaries {
        ffmpeg,
        ffprobe,
        ffmpeg_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_release_and_git_versions() {
        let release = "ffmpeg version 6.1.1-static https://johnvansickle.com/ffmpeg/  Copyright (c) 2000-2023\nbuilt with gcc 8";
        assert_eq!(parse_ffmpeg_version(release).as_deref(), Some("6.1.1-static"));
        assert_eq!(major_version("6.1.1-static"), Some(6));

        let git = "ffmpeg version n8.0-3-g1234abcd Copyright (c) 2000-2025";
        assert_eq!(parse_ffmpeg_version(git).as_deref(), Some("n8.0-3-g1234abcd"));
        assert_eq!(major_version("n8.0-3-g1234abcd"), Some(8));

        assert_eq!(parse_ffmpeg_version("ffprobe version 6.0"), None);
        assert_eq!(major_version("git-2024"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_major_version_roundtrip(major in 0u32..100, minor in 0u32..20, prefixed in any::<bool>()) {
            let token = format!("{}{}.{}", if prefixed { "n" } else { "" }, major, minor);
            let output = format!("ffmpeg version {} Copyright", token);
            let parsed = parse_ffmpeg_version(&output).unwrap();
            prop_assert_eq!(major_version(&parsed), Some(major));
        }
    }

    #[test]
    fn test_cache_dir_wins() {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join(executable_name(FFMPEG));
        std::fs::write(&binary, "").unwrap();

        assert_eq!(locate_binary(FFMPEG, Some(dir.path()), true).unwrap(), binary);
        assert_eq!(locate_binary(FFMPEG, Some(dir.path()), false).unwrap(), binary);
    }

    #[test]
    fn test_auto_provision_requires_binary_in_dir() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            locate_binary(FFPROBE, Some(dir.path()), true),
            Err(StartupError::NotProvisioned { .. })
        ));
    }

    #[test]
    fn test_missing_everywhere_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            locate_binary("clipcache-no-such-binary", Some(dir.path()), false),
            Err(StartupError::NotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_version_runs_binary() {
        use crate::encode::ffmpeg::test_scripts::fake_ffmpeg;

        let dir = TempDir::new().unwrap();
        let ok = fake_ffmpeg(dir.path(), "ffmpeg", "echo 'ffmpeg version 7.0.2 Copyright'");
        assert_eq!(probe_version(FFMPEG, &ok).await.unwrap().as_deref(), Some("7.0.2"));

        let broken = fake_ffmpeg(dir.path(), "broken", "exit 1");
        assert!(matches!(
            probe_version(FFMPEG, &broken).await,
            Err(StartupError::Unusable { .. })
        ));
    }
}
