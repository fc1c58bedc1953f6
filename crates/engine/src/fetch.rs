//! Remote source fetching.
//!
//! Downloads run through the download queue (three slots, rate limited) with
//! a fixed retry policy. The fetcher owns a [`DownloadCache`] that collapses
//! concurrent requests for one URL onto a single in-flight download and
//! remembers finished downloads for its own lifetime.

use crate::queue::{ConversionQueue, QueueError};
use crate::reporter::SharedReporter;
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Error type for remote fetches
///
/// Cloneable so one failed download can be handed to every waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("IO error at {}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    /// Every attempt failed
    #[error("Giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("Download queue error: {0}")]
    Queue(#[from] QueueError),
}

impl FetchError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        FetchError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Moves bytes from a URL to a local file.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Download `url` into `destination`. A failed download leaves nothing
    /// at `destination`.
    async fn download(&self, url: &str, destination: &Path) -> Result<(), FetchError>;
}

/// HTTP(S) transport backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn download(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let transport_err = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transport_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }

        // Stream into a side file; only a complete body gets the real name
        let partial = partial_path(destination);
        let result = async {
            let mut file = tokio::fs::File::create(&partial)
                .await
                .map_err(|e| FetchError::io(&partial, e))?;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let data = chunk.map_err(transport_err)?;
                file.write_all(&data)
                    .await
                    .map_err(|e| FetchError::io(&partial, e))?;
            }
            file.flush().await.map_err(|e| FetchError::io(&partial, e))?;
            tokio::fs::rename(&partial, destination)
                .await
                .map_err(|e| FetchError::io(destination, e))
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        result
    }
}

/// Fixed-backoff retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

type SharedDownload = Shared<BoxFuture<'static, Result<PathBuf, FetchError>>>;

enum DownloadEntry {
    InFlight(SharedDownload),
    Done(PathBuf),
}

/// URL → in-flight or finished download.
#[derive(Default)]
pub struct DownloadCache {
    entries: Mutex<HashMap<String, DownloadEntry>>,
}

impl std::fmt::Debug for DownloadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCache").finish_non_exhaustive()
    }
}

impl DownloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local path of a finished download, if any.
    pub async fn resolved(&self, url: &str) -> Option<PathBuf> {
        match self.entries.lock().await.get(url) {
            Some(DownloadEntry::Done(path)) => Some(path.clone()),
            _ => None,
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| matches!(e, DownloadEntry::InFlight(_)))
            .count()
    }
}

struct FetcherInner {
    transport: Arc<dyn Transport>,
    queue: Arc<ConversionQueue>,
    retry: RetryPolicy,
    reporter: SharedReporter,
    downloads: DownloadCache,
}

/// Queued, retrying, de-duplicating downloader.
#[derive(Clone)]
pub struct RemoteFetcher {
    inner: Arc<FetcherInner>,
}

impl std::fmt::Debug for RemoteFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFetcher")
            .field("retry", &self.inner.retry)
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

impl RemoteFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<ConversionQueue>,
        retry: RetryPolicy,
        reporter: SharedReporter,
    ) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                transport,
                queue,
                retry,
                reporter,
                downloads: DownloadCache::new(),
            }),
        }
    }

    pub fn downloads(&self) -> &DownloadCache {
        &self.inner.downloads
    }

    /// Download `url` to `destination`, retrying per the policy.
    ///
    /// Each attempt takes its own queue slot; the backoff is spent outside
    /// the queue. An existing destination is reused without downloading.
    pub async fn fetch(&self, url: &str, destination: &Path) -> Result<PathBuf, FetchError> {
        if tokio::fs::try_exists(destination).await.unwrap_or(false) {
            return Ok(destination.to_path_buf());
        }

        let attempts = self.inner.retry.attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            let transport = self.inner.transport.clone();
            let (job_url, job_dest) = (url.to_string(), destination.to_path_buf());
            let result = self
                .inner
                .queue
                .enqueue(async move { transport.download(&job_url, &job_dest).await })
                .await?;

            match result {
                Ok(()) => {
                    self.inner
                        .reporter
                        .verbose(&format!("Downloaded {} to {}", url, destination.display()));
                    return Ok(destination.to_path_buf());
                }
                Err(err) => {
                    self.inner.reporter.warn(&format!(
                        "Download attempt {}/{} for {} failed: {}",
                        attempt, attempts, url, err
                    ));
                    last = Some(err);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.inner.retry.backoff).await;
            }
        }

        let last = last.map(|e| e.to_string()).unwrap_or_default();
        self.inner
            .reporter
            .error(&format!("Giving up on {} after {} attempts", url, attempts));
        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts,
            last,
        })
    }

    /// Like [`fetch`](Self::fetch), but concurrent calls for the same URL
    /// share one download and later calls reuse its result.
    pub async fn fetch_cached(&self, url: &str, destination: &Path) -> Result<PathBuf, FetchError> {
        let shared = {
            let mut entries = self.inner.downloads.entries.lock().await;
            match entries.get(url) {
                Some(DownloadEntry::Done(path)) if path.exists() => return Ok(path.clone()),
                Some(DownloadEntry::InFlight(download)) => download.clone(),
                _ => {
                    let this = self.clone();
                    let (owned_url, owned_dest) = (url.to_string(), destination.to_path_buf());
                    let download = async move { this.fetch(&owned_url, &owned_dest).await }
                        .boxed()
                        .shared();
                    entries.insert(url.to_string(), DownloadEntry::InFlight(download.clone()));
                    download
                }
            }
        };

        let result = shared.await;

        let mut entries = self.inner.downloads.entries.lock().await;
        match &result {
            Ok(path) => {
                entries.insert(url.to_string(), DownloadEntry::Done(path.clone()));
            }
            Err(_) => {
                // Failed downloads are not remembered; the next call retries
                if matches!(entries.get(url), Some(DownloadEntry::InFlight(_))) {
                    entries.remove(url);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{MemoryReporter, ReportLevel};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }

    fn fetcher(transport: Arc<dyn Transport>, reporter: Arc<MemoryReporter>) -> RemoteFetcher {
        RemoteFetcher::new(
            transport,
            Arc::new(ConversionQueue::downloads()),
            quick_retry(),
            reporter,
        )
    }

    /// Counts calls; fails the first `failures` of them.
    struct CountingTransport {
        calls: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn download(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures {
                return Err(FetchError::Transport {
                    url: url.to_string(),
                    message: "connection reset".into(),
                });
            }
            tokio::fs::write(destination, url).await.map_err(|e| FetchError::io(destination, e))
        }
    }

    #[tokio::test]
    async fn test_http_transport_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 100_000]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sources/abc.mp4");
        HttpTransport::default()
            .download(&format!("{}/clip.mp4", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap().len(), 100_000);
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_http_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let reporter = Arc::new(MemoryReporter::new());
        let fetcher = fetcher(Arc::new(HttpTransport::default()), reporter.clone());
        let url = format!("{}/gone.mp4", server.uri());
        let dest = dir.path().join("gone.mp4");

        let err = fetcher.fetch(&url, &dest).await.unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 3, ref last, .. } if last.contains("503")));
        assert_eq!(reporter.messages(ReportLevel::Warn).len(), 3);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            failures: 2,
            delay: Duration::ZERO,
        });
        let fetcher = fetcher(transport.clone(), Arc::new(MemoryReporter::new()));
        let dest = dir.path().join("flaky.mp4");

        let path = fetcher.fetch("https://example.test/flaky.mp4", &dest).await.unwrap();
        assert_eq!(path, dest);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_download() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            failures: 0,
            delay: Duration::from_millis(50),
        });
        let fetcher = fetcher(transport.clone(), Arc::new(MemoryReporter::new()));
        let url = "https://example.test/shared.mp4";
        let dest = dir.path().join("shared.mp4");

        let results = futures::future::join_all((0..6).map(|_| fetcher.fetch_cached(url, &dest))).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), dest);
        }
        assert_eq!(fetcher.downloads().resolved(url).await, Some(dest.clone()));
        assert_eq!(fetcher.downloads().in_flight().await, 0);

        // Later requests reuse the finished download
        fetcher.fetch_cached(url, &dest).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_download_is_forgotten() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            failures: 3,
            delay: Duration::ZERO,
        });
        let fetcher = fetcher(transport.clone(), Arc::new(MemoryReporter::new()));
        let url = "https://example.test/late.mp4";
        let dest = dir.path().join("late.mp4");

        assert!(fetcher.fetch_cached(url, &dest).await.is_err());
        assert_eq!(fetcher.downloads().resolved(url).await, None);

        // Fourth call succeeds
        assert_eq!(fetcher.fetch_cached(url, &dest).await.unwrap(), dest);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }
}
