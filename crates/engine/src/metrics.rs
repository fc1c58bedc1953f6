//! Metrics module for clipcache
//!
//! Keeps an in-memory snapshot of pipeline activity: per-job stage and
//! progress plus aggregate cache counters. The snapshot serializes to JSON
//! for `clipcache status` and for embedding hosts.

use crate::job::{ConversionJob, JobStage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Per-job view of a conversion in progress or finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub kind: String,
    pub source: String,
    pub key: String,
    pub stage: String,
    /// Last reported percentage, 0 to 100
    pub progress: f32,
    pub error: Option<String>,
}

impl From<&ConversionJob> for JobMetrics {
    fn from(job: &ConversionJob) -> Self {
        let error = match &job.stage {
            JobStage::Failed(reason) | JobStage::Skipped(reason) => Some(reason.clone()),
            _ => None,
        };
        Self {
            id: job.id.clone(),
            kind: job.kind.to_string(),
            source: job.source.display().to_string(),
            key: job.key.to_string(),
            stage: job.stage.as_str().to_string(),
            progress: if job.stage == JobStage::Completed {
                100.0
            } else {
                0.0
            },
            error,
        }
    }
}

/// Counters bumped once per finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    CacheHit,
    Promotion,
    Conversion,
    Failure,
    Skip,
    Download,
}

/// Complete metrics snapshot including jobs and aggregate stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub cache_hits: u64,
    pub promotions: u64,
    pub conversions: u64,
    pub failures: u64,
    pub skipped: u64,
    pub downloads: u64,
}

impl MetricsSnapshot {
    /// Insert or replace the entry for a job. Progress never goes backwards.
    pub fn upsert_job(&mut self, job: JobMetrics) {
        match self.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => {
                let progress = existing.progress.max(job.progress);
                *existing = JobMetrics { progress, ..job };
            }
            None => self.jobs.push(job),
        }
        self.stamp();
    }

    /// Record a progress percentage for a tracked job.
    pub fn set_progress(&mut self, id: &str, percent: f32) {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
            job.progress = percent.clamp(0.0, 100.0);
            self.stamp();
        }
    }

    pub fn record(&mut self, counter: Counter) {
        let slot = match counter {
            Counter::CacheHit => &mut self.cache_hits,
            Counter::Promotion => &mut self.promotions,
            Counter::Conversion => &mut self.conversions,
            Counter::Failure => &mut self.failures,
            Counter::Skip => &mut self.skipped,
            Counter::Download => &mut self.downloads,
        };
        *slot += 1;
        self.stamp();
    }

    pub fn set_queue(&mut self, queue_len: usize, running_jobs: usize) {
        self.queue_len = queue_len;
        self.running_jobs = running_jobs;
        self.stamp();
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    fn stamp(&mut self) {
        self.timestamp_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
    }
}

/// Shared metrics state for concurrent access across pipeline components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job_metrics(id: &str) -> JobMetrics {
        JobMetrics {
            id: id.to_string(),
            kind: "convert:h264".to_string(),
            source: "/src/clip.mp4".to_string(),
            key: "abc-def".to_string(),
            stage: "encoding".to_string(),
            progress: 0.0,
            error: None,
        }
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.upsert_job(job_metrics("a"));
        snapshot.upsert_job(job_metrics("b"));

        let mut done = job_metrics("a");
        done.stage = "completed".to_string();
        snapshot.upsert_job(done);

        assert_eq!(snapshot.jobs.len(), 2);
        assert_eq!(snapshot.jobs[0].stage, "completed");

        snapshot.set_progress("b", 35.0);
        let mut failed = job_metrics("b");
        failed.stage = "failed".to_string();
        snapshot.upsert_job(failed);
        assert_eq!(snapshot.jobs[1].progress, 35.0);
        assert!(snapshot.timestamp_unix_ms > 0);
    }

    #[test]
    fn test_progress_is_clamped_and_ignores_unknown_jobs() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.upsert_job(job_metrics("a"));
        snapshot.set_progress("a", 140.0);
        snapshot.set_progress("missing", 50.0);

        assert_eq!(snapshot.jobs[0].progress, 100.0);
        assert_eq!(snapshot.jobs.len(), 1);
    }

    #[test]
    fn test_counters() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.record(Counter::CacheHit);
        snapshot.record(Counter::CacheHit);
        snapshot.record(Counter::Promotion);
        snapshot.record(Counter::Skip);

        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.promotions, 1);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.conversions, 0);
    }

    #[tokio::test]
    async fn test_shared_metrics_starts_empty() {
        let metrics = new_shared_metrics();
        metrics.write().await.set_queue(3, 1);
        let snapshot = metrics.read().await.clone();
        assert_eq!((snapshot.queue_len, snapshot.running_jobs), (3, 1));
        assert!(snapshot.jobs.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_metrics_snapshot_round_trip(
            timestamp in any::<i64>(),
            queue_len in 0usize..1000,
            running_jobs in 0usize..2,
            cache_hits in any::<u64>(),
            failures in any::<u64>(),
            job_count in 0usize..5,
        ) {
            let jobs: Vec<JobMetrics> = (0..job_count).map(|i| JobMetrics {
                progress: i as f32 * 12.5,
                error: (i % 2 == 1).then(|| "Transcoder failed with exit code 1".to_string()),
                ..job_metrics(&format!("job-{}", i))
            }).collect();

            let snapshot = MetricsSnapshot {
                timestamp_unix_ms: timestamp,
                jobs,
                queue_len,
                running_jobs,
                cache_hits,
                failures,
                ..Default::default()
            };

            let json = snapshot.to_json().expect("serialization should succeed");
            let deserialized: MetricsSnapshot = serde_json::from_str(&json)
                .expect("deserialization should succeed");
            prop_assert_eq!(snapshot, deserialized);
        }
    }
}
