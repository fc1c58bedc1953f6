//! Conversion job model for clipcache
//!
//! A [`ConversionJob`] is created for every request that misses the cache and
//! is tracked through its stages until it completes or fails. Requests that
//! cannot be converted at all resolve to [`Outcome::Skipped`] instead.

use crate::key::CacheKey;
use crate::options::OptionSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// What a job produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Convert { profile: String },
    Screenshots,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Convert { profile } => write!(f, "convert:{}", profile),
            JobKind::Screenshots => write!(f, "screenshots"),
        }
    }
}

/// Stage of a job, in the order they are passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Probing,
    Encoding,
    Committing,
    Completed,
    /// Nothing to convert after all, e.g. the source has no video stream
    Skipped(String),
    Failed(String),
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Queued => "queued",
            JobStage::Probing => "probing",
            JobStage::Encoding => "encoding",
            JobStage::Committing => "committing",
            JobStage::Completed => "completed",
            JobStage::Skipped(_) => "skipped",
            JobStage::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStage::Completed | JobStage::Skipped(_) | JobStage::Failed(_)
        )
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStage::Skipped(reason) => write!(f, "skipped: {}", reason),
            JobStage::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One unit of transcoding work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: String,
    pub kind: JobKind,
    pub source: PathBuf,
    pub options: OptionSet,
    pub key: CacheKey,
    /// Where the artifact lands in the active tier
    pub cache_path: PathBuf,
    /// Where the published copy lands
    pub public_path: PathBuf,
    pub stage: JobStage,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversionJob {
    pub fn new(
        kind: JobKind,
        source: &Path,
        options: OptionSet,
        key: CacheKey,
        cache_path: PathBuf,
        public_path: PathBuf,
    ) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            source: source.to_path_buf(),
            options,
            key,
            cache_path,
            public_path,
            stage: JobStage::Queued,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    pub fn set_stage(&mut self, stage: JobStage) {
        self.stage = stage;
        self.touch();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.set_stage(JobStage::Failed(reason.into()));
    }
}

fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// How an artifact was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Already in the active tier
    Hit,
    /// Moved up from the rolling tier
    Promoted,
    /// Produced by the transcoder in this run
    Converted,
}

/// A finished request: the cached artifact and its public copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub key: CacheKey,
    pub cache_path: PathBuf,
    pub public_path: PathBuf,
    pub status: CacheStatus,
}

/// Result of a request that may be legitimately skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    /// The source cannot be converted (e.g. it is not a video); not an error
    Skipped { reason: String },
}

impl<T> Outcome<T> {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped { .. })
    }

    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::Skipped { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Done(value) => Outcome::Done(f(value)),
            Outcome::Skipped { reason } => Outcome::Skipped { reason },
        }
    }
}
