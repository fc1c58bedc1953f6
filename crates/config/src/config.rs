//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Cache location configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Root of the tiered cache (holds `active/`, `rolling/` and `sources/`)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Directory that receives public copies of produced artifacts
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache/clipcache")
}

fn default_public_dir() -> PathBuf {
    PathBuf::from("public/static/clipcache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            public_dir: default_public_dir(),
        }
    }
}

/// Transcoder binary configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BinariesConfig {
    /// Directory searched for `ffmpeg`/`ffprobe` before falling back to PATH
    #[serde(default)]
    pub cache_binaries_dir: Option<PathBuf>,
    /// Whether binaries are expected to be provisioned into `cache_binaries_dir`
    #[serde(default)]
    pub auto_provision: bool,
}

/// Progress reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressConfig {
    /// Minimum percentage advance between two progress reports (default 5.0)
    #[serde(default = "default_progress_threshold")]
    pub threshold_percent: f64,
}

fn default_progress_threshold() -> f64 {
    5.0
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            threshold_percent: default_progress_threshold(),
        }
    }
}

/// A named custom profile declared in the config file.
///
/// Both `extension` and `video_codec` are optional here so that a half-filled
/// table still parses; the engine rejects incomplete entries when it registers
/// them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CustomProfileConfig {
    /// Output file extension, without the leading dot
    #[serde(default)]
    pub extension: Option<String>,
    /// Video codec passed to the transcoder
    #[serde(default)]
    pub video_codec: Option<String>,
    /// Audio codec; `None` drops audio
    #[serde(default)]
    pub audio_codec: Option<String>,
    /// Extra output options, already split into arguments
    #[serde(default)]
    pub output_options: Vec<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub binaries: BinariesConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub profiles: BTreeMap<String, CustomProfileConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and fills missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CLIPCACHE_CACHE_DIR -> cache.cache_dir
    /// - CLIPCACHE_PUBLIC_DIR -> cache.public_dir
    /// - CLIPCACHE_CACHE_BINARIES_DIR -> binaries.cache_binaries_dir
    /// - CLIPCACHE_AUTO_PROVISION -> binaries.auto_provision
    /// - CLIPCACHE_PROGRESS_THRESHOLD -> progress.threshold_percent
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CLIPCACHE_CACHE_DIR") {
            if !val.is_empty() {
                self.cache.cache_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CLIPCACHE_PUBLIC_DIR") {
            if !val.is_empty() {
                self.cache.public_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CLIPCACHE_CACHE_BINARIES_DIR") {
            if !val.is_empty() {
                self.binaries.cache_binaries_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("CLIPCACHE_AUTO_PROVISION") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.binaries.auto_provision = true,
                "false" | "0" | "no" => self.binaries.auto_provision = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("CLIPCACHE_PROGRESS_THRESHOLD") {
            if let Ok(threshold) = val.parse::<f64>() {
                self.progress.threshold_percent = threshold;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Directory holding downloaded or copied source assets
    pub fn sources_dir(&self) -> PathBuf {
        self.cache.cache_dir.join("sources")
    }
}
