//! Progress parsing and throttling.
//!
//! ffmpeg's `-progress pipe:1` writes `key=value` blocks. Only the output
//! timestamp and the final `progress=end` marker matter here.

use std::time::Duration;

/// A relevant line of the progress stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    /// Output timestamp in seconds
    OutTime(f64),
    End,
}

/// Parse one progress line.
///
/// `out_time_ms` carries microseconds, like `out_time_us`.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => {
            let micros: i64 = value.trim().parse().ok()?;
            (micros >= 0).then(|| ProgressLine::OutTime(micros as f64 / 1_000_000.0))
        }
        "progress" if value.trim() == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

/// A progress report worth emitting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub eta: Option<Duration>,
}

/// Turns timestamps into throttled percentage reports.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration_secs: Option<f64>,
    threshold: f64,
    last_reported: f64,
}

impl ProgressTracker {
    pub fn new(duration_secs: Option<f64>, threshold_percent: f64) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| *d > 0.0),
            threshold: threshold_percent.max(0.0),
            last_reported: 0.0,
        }
    }

    /// Feed an output timestamp. Returns an update only once the percentage
    /// has advanced by at least the threshold since the last one.
    pub fn observe(&mut self, out_time_secs: f64, elapsed: Duration) -> Option<ProgressUpdate> {
        let duration = self.duration_secs?;
        let percent = (out_time_secs * 100.0 / duration).clamp(0.0, 100.0);
        if percent <= 0.0 || percent - self.last_reported < self.threshold {
            return None;
        }
        self.last_reported = percent;

        let eta = (percent < 100.0).then(|| {
            Duration::from_secs_f64(elapsed.as_secs_f64() / percent * (100.0 - percent))
        });
        Some(ProgressUpdate { percent, eta })
    }
}
