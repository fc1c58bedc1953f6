//! Conversion pipeline for clipcache
//!
//! Drives a request from source to published artifact:
//!
//! 1. resolve the profile and the source (non-video sources are skipped)
//! 2. derive the cache key and try to restore from the active or rolling tier
//! 3. on a miss, queue a job that probes, builds filters and the encode
//!    specification, runs the transcoder into staging and commits the result
//! 4. copy the cached artifact to the public directory
//!
//! It also exposes the build lifecycle: rotation before a build and
//! reconciliation after it.

use crate::cache::{
    ArtifactId, BuildMode, CacheError, CacheSummary, LocatedArtifact, ReconcileOutcome,
    RestoreOutcome, RotationReport, Tier, TieredCacheStore,
};
use crate::config::Config;
use crate::encode::{EncodeError, FfmpegExecutor, TranscodeCommand, Transcoder};
use crate::fetch::{FetchError, HttpTransport, RemoteFetcher, RetryPolicy, Transport};
use crate::filters::build_filters;
use crate::job::{Artifact, CacheStatus, ConversionJob, JobKind, JobStage, Outcome};
use crate::key::{derive_key, CacheKey, KeyError};
use crate::metrics::{new_shared_metrics, Counter, JobMetrics, SharedMetrics};
use crate::options::{ConversionOptions, OptionSet, OptionsError};
use crate::probe::{FfprobeProber, ProbeError, Prober, StreamMetadata};
use crate::profile::{Profile, ProfileError, ProfileInput, ProfileRegistry};
use crate::publish::{public_path, publish_artifact, PublishError};
use crate::queue::{ConversionQueue, QueueError};
use crate::reporter::{Reporter, SharedReporter, TracingReporter};
use crate::screenshot::{plan_screenshots, screenshot_profile_name, ScreenshotOptions};
use crate::source::{
    classify_mime, classify_path, remote_digest, source_path, MediaType, SourceAsset, SourceError,
};
use crate::startup::{run_startup_checks, StartupError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error("Cache key error: {0}")]
    Key(#[from] KeyError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
}

/// A source that lives behind a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub url: String,
    /// Stable identifier assigned by the remote side
    pub remote_id: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
}

impl RemoteSource {
    pub fn new(url: impl Into<String>, remote_id: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            url: url.into(),
            remote_id: remote_id.into(),
            size_bytes,
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    fn url_path(&self) -> Option<PathBuf> {
        reqwest::Url::parse(&self.url)
            .ok()
            .map(|url| PathBuf::from(url.path()))
    }

    /// Media type from the declared MIME type, else from the URL path.
    pub fn media_type(&self) -> MediaType {
        self.mime_type
            .as_deref()
            .map(classify_mime)
            .or_else(|| self.url_path().and_then(|path| classify_path(&path)))
            .unwrap_or(MediaType::Other)
    }

    /// Extension of the URL path with its dot, lowercased, or empty.
    pub fn extension(&self) -> String {
        self.url_path()
            .and_then(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| format!(".{}", e.to_lowercase()))
            })
            .unwrap_or_default()
    }
}

/// Where a request's source comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Local(PathBuf),
    Remote(RemoteSource),
}

impl From<PathBuf> for SourceRef {
    fn from(path: PathBuf) -> Self {
        SourceRef::Local(path)
    }
}

impl From<RemoteSource> for SourceRef {
    fn from(remote: RemoteSource) -> Self {
        SourceRef::Remote(remote)
    }
}

/// Convert one source with one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertRequest {
    pub source: SourceRef,
    pub profile: String,
    pub options: OptionSet,
}

impl ConvertRequest {
    pub fn new(source: impl Into<SourceRef>, profile: impl Into<String>, options: OptionSet) -> Self {
        Self {
            source: source.into(),
            profile: profile.into(),
            options,
        }
    }
}

/// Extract still frames from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenshotRequest {
    pub source: SourceRef,
    pub options: OptionSet,
}

impl ScreenshotRequest {
    pub fn new(source: impl Into<SourceRef>, options: OptionSet) -> Self {
        Self {
            source: source.into(),
            options,
        }
    }
}

/// External collaborators of the pipeline.
#[derive(Clone)]
pub struct Components {
    pub prober: Arc<dyn Prober>,
    pub transcoder: Arc<dyn Transcoder>,
    pub transport: Arc<dyn Transport>,
    pub reporter: SharedReporter,
    pub retry: RetryPolicy,
}

impl Components {
    /// HTTP transport, default retry policy and tracing reporter.
    pub fn new(prober: Arc<dyn Prober>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            prober,
            transcoder,
            transport: Arc::new(HttpTransport::default()),
            reporter: Arc::new(TracingReporter),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

struct PipelineInner {
    config: Config,
    registry: ProfileRegistry,
    store: TieredCacheStore,
    conversions: ConversionQueue,
    fetcher: RemoteFetcher,
    prober: Arc<dyn Prober>,
    transcoder: Arc<dyn Transcoder>,
    reporter: SharedReporter,
    metrics: SharedMetrics,
}

/// The conversion engine. Cheap to clone; clones share queues and caches.
///
/// Must be created inside a Tokio runtime (the queues spawn their workers).
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("cache_dir", &self.inner.config.cache.cache_dir)
            .field("registry", &self.inner.registry)
            .field("conversions", &self.inner.conversions)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build a pipeline backed by the real ffmpeg and ffprobe.
    ///
    /// Custom profiles are validated before the binaries are looked up, so a
    /// broken profile table fails without touching the transcoder.
    pub async fn new(config: Config) -> Result<Self, PipelineError> {
        let registry = ProfileRegistry::from_config(&config)?;
        let binaries = run_startup_checks(&config).await?;

        let components = Components::new(
            Arc::new(FfprobeProber::new(binaries.ffprobe.clone())),
            Arc::new(FfmpegExecutor::new(
                binaries.ffmpeg.clone(),
                config.progress.threshold_percent,
            )),
        );
        components.reporter.verbose(&format!(
            "Using {} (version {}) and {}",
            binaries.ffmpeg.display(),
            binaries.ffmpeg_version.as_deref().unwrap_or("unknown"),
            binaries.ffprobe.display()
        ));

        Ok(Self::with_registry(config, registry, components))
    }

    /// Build a pipeline with the config's custom profiles and the given
    /// collaborators. Skips the binary checks.
    pub fn with_components(config: Config, components: Components) -> Result<Self, PipelineError> {
        let registry = ProfileRegistry::from_config(&config)?;
        Ok(Self::with_registry(config, registry, components))
    }

    /// Build a pipeline around an already populated registry, e.g. one with
    /// closure-based custom profiles registered in code.
    pub fn with_registry(config: Config, registry: ProfileRegistry, components: Components) -> Self {
        let downloads = Arc::new(ConversionQueue::downloads());
        let fetcher = RemoteFetcher::new(
            components.transport,
            downloads,
            components.retry,
            components.reporter.clone(),
        );

        Self {
            inner: Arc::new(PipelineInner {
                store: TieredCacheStore::new(config.cache.cache_dir.clone()),
                config,
                registry,
                conversions: ConversionQueue::conversions(),
                fetcher,
                prober: components.prober,
                transcoder: components.transcoder,
                reporter: components.reporter,
                metrics: new_shared_metrics(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &TieredCacheStore {
        &self.inner.store
    }

    pub fn fetcher(&self) -> &RemoteFetcher {
        &self.inner.fetcher
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.inner.metrics.clone()
    }

    /// Convert a source, reusing a cached artifact when there is one.
    pub async fn convert(&self, request: ConvertRequest) -> Result<Outcome<Artifact>, PipelineError> {
        let inner = &self.inner;
        let profile = inner.registry.resolve(&request.profile)?;
        let extension = inner.registry.extension(&profile)?;
        let options: ConversionOptions = request.options.resolve()?;

        let source = match inner.resolve_source(&request.source).await? {
            Outcome::Done(source) => source,
            Outcome::Skipped { reason } => return Ok(inner.skip(reason).await),
        };

        let key = derive_key(&source.digest, profile.name(), &request.options)?;
        let id = ArtifactId::video(&key, &extension);
        let public = public_path(&inner.config.cache.public_dir, &id);
        if let Some(artifact) = inner.restore(&id, &public).await? {
            return Ok(Outcome::Done(artifact));
        }

        let job = ConversionJob::new(
            JobKind::Convert {
                profile: profile.name().to_string(),
            },
            &source.path,
            request.options,
            key,
            inner.store.path_in(Tier::Active, &id),
            public,
        );
        inner.track(&job).await;
        inner.reporter.info(&format!(
            "Queued {} conversion of {} as job {}",
            profile,
            source.path.display(),
            job.id
        ));

        self.submit(job, id, source, Work::Convert { profile, options })
            .await
    }

    /// Extract screenshots, reusing a cached frame set when there is one.
    pub async fn screenshots(&self, request: ScreenshotRequest) -> Result<Outcome<Artifact>, PipelineError> {
        let inner = &self.inner;
        let options: ScreenshotOptions = request.options.resolve()?;

        let source = match inner.resolve_source(&request.source).await? {
            Outcome::Done(source) => source,
            Outcome::Skipped { reason } => return Ok(inner.skip(reason).await),
        };

        let key = derive_key(&source.digest, screenshot_profile_name(), &request.options)?;
        let id = ArtifactId::screenshots(&key);
        let public = public_path(&inner.config.cache.public_dir, &id);
        if let Some(artifact) = inner.restore(&id, &public).await? {
            return Ok(Outcome::Done(artifact));
        }

        let job = ConversionJob::new(
            JobKind::Screenshots,
            &source.path,
            request.options,
            key,
            inner.store.path_in(Tier::Active, &id),
            public,
        );
        inner.track(&job).await;
        inner.reporter.info(&format!(
            "Queued screenshots of {} as job {}",
            source.path.display(),
            job.id
        ));

        self.submit(job, id, source, Work::Screenshots(options)).await
    }

    /// Run a job in the conversion queue and account for its result.
    async fn submit(
        &self,
        job: ConversionJob,
        id: ArtifactId,
        source: SourceAsset,
        work: Work,
    ) -> Result<Outcome<Artifact>, PipelineError> {
        let worker = self.inner.clone();
        let result = self
            .inner
            .conversions
            .enqueue(async move { worker.run_job(job, id, source, work).await })
            .await;
        self.inner.settle(result).await
    }

    /// Pre-build tier rotation.
    pub async fn begin_build(&self, mode: BuildMode) -> Result<RotationReport, PipelineError> {
        let report = self.inner.store.rotate(mode).await?;
        let reporter = &self.inner.reporter;
        if report.skipped {
            reporter.verbose("Develop build: cache tiers left as they are");
        }
        if report.dropped_stale_rolling {
            reporter.verbose("Removed stale rolling cache tier");
        }
        if report.rotated_active {
            reporter.info("Rotated active cache tier to rolling");
        }
        Ok(report)
    }

    /// Post-build reconciliation of the cache tiers.
    pub async fn finish_build(&self) -> Result<ReconcileOutcome, PipelineError> {
        let outcome = self.inner.store.reconcile().await?;
        match outcome {
            ReconcileOutcome::PromotedRolling => self
                .inner
                .reporter
                .warn("Build left no active cache tier; restored the rolling tier"),
            ReconcileOutcome::DroppedRolling => {
                self.inner.reporter.verbose("Removed leftover rolling cache tier")
            }
            ReconcileOutcome::Settled | ReconcileOutcome::Empty => {}
        }
        Ok(outcome)
    }

    /// Where the artifacts stored under `key` are.
    pub async fn status(&self, key: &CacheKey) -> Result<Vec<LocatedArtifact>, PipelineError> {
        Ok(self.inner.store.locate(key).await?)
    }

    pub async fn summary(&self) -> Result<CacheSummary, PipelineError> {
        Ok(self.inner.store.summary().await?)
    }
}

/// Forwards to the pipeline reporter and records progress for one job.
struct JobReporter<'a> {
    inner: &'a dyn Reporter,
    metrics: &'a SharedMetrics,
    job_id: &'a str,
}

impl Reporter for JobReporter<'_> {
    fn info(&self, message: &str) {
        self.inner.info(message);
    }

    fn verbose(&self, message: &str) {
        self.inner.verbose(message);
    }

    fn warn(&self, message: &str) {
        self.inner.warn(message);
    }

    fn error(&self, message: &str) {
        self.inner.error(message);
    }

    fn progress(&self, percent: f64) {
        self.inner.progress(percent);
        // A contended snapshot drops this update; the next one catches up
        if let Ok(mut metrics) = self.metrics.try_write() {
            metrics.set_progress(self.job_id, percent as f32);
        }
    }
}

/// What a queued job produces, with its typed options.
enum Work {
    Convert {
        profile: Profile,
        options: ConversionOptions,
    },
    Screenshots(ScreenshotOptions),
}

impl PipelineInner {
    async fn resolve_source(&self, source: &SourceRef) -> Result<Outcome<SourceAsset>, PipelineError> {
        let asset = match source {
            SourceRef::Local(path) => SourceAsset::resolve_local(path).await?,
            SourceRef::Remote(remote) => {
                let media_type = remote.media_type();
                if media_type != MediaType::Video {
                    return Ok(Outcome::skipped(format!(
                        "{} is not a video source ({})",
                        remote.url, media_type
                    )));
                }

                let digest = remote_digest(&remote.remote_id, remote.size_bytes);
                let destination =
                    source_path(&self.config.sources_dir(), &digest, &remote.extension());
                let path = self.fetcher.fetch_cached(&remote.url, &destination).await?;
                self.metrics.write().await.record(Counter::Download);

                SourceAsset {
                    path,
                    digest,
                    media_type,
                    size_bytes: remote.size_bytes,
                }
            }
        };

        Ok(match asset.skip_reason() {
            Some(reason) => Outcome::skipped(reason),
            None => Outcome::Done(asset),
        })
    }

    async fn skip<T>(&self, reason: String) -> Outcome<T> {
        self.reporter.info(&format!("Skipping: {}", reason));
        self.metrics.write().await.record(Counter::Skip);
        Outcome::Skipped { reason }
    }

    /// Cache lookup plus publish. `None` on a miss.
    async fn restore(&self, id: &ArtifactId, public: &Path) -> Result<Option<Artifact>, PipelineError> {
        let (cache_path, status) = match self.store.restore(id).await? {
            RestoreOutcome::Active(path) => (path, CacheStatus::Hit),
            RestoreOutcome::Promoted(path) => (path, CacheStatus::Promoted),
            RestoreOutcome::Miss => return Ok(None),
        };

        let public_path = publish_artifact(&cache_path, public).await?;
        let counter = match status {
            CacheStatus::Promoted => {
                self.reporter
                    .verbose(&format!("Promoted {} from the rolling cache", id.file_name()));
                Counter::Promotion
            }
            _ => {
                self.reporter.verbose(&format!("Cache hit for {}", id.file_name()));
                Counter::CacheHit
            }
        };
        self.metrics.write().await.record(counter);

        Ok(Some(Artifact {
            key: id.key().clone(),
            cache_path,
            public_path,
            status,
        }))
    }

    async fn track(&self, job: &ConversionJob) {
        let mut metrics = self.metrics.write().await;
        metrics.upsert_job(JobMetrics::from(job));
        metrics.set_queue(self.conversions.pending(), self.conversions.in_flight());
    }

    async fn settle(
        &self,
        result: Result<Result<Outcome<Artifact>, PipelineError>, QueueError>,
    ) -> Result<Outcome<Artifact>, PipelineError> {
        let result = result.map_err(PipelineError::from).and_then(|r| r);

        let mut metrics = self.metrics.write().await;
        match &result {
            Ok(Outcome::Done(artifact)) if artifact.status == CacheStatus::Converted => {
                metrics.record(Counter::Conversion)
            }
            Ok(Outcome::Done(_)) => {}
            Ok(Outcome::Skipped { .. }) => metrics.record(Counter::Skip),
            Err(_) => metrics.record(Counter::Failure),
        }
        metrics.set_queue(self.conversions.pending(), self.conversions.in_flight());
        result
    }

    /// Body of a queued job. Runs inside the single conversion slot.
    async fn run_job(
        self: Arc<Self>,
        mut job: ConversionJob,
        id: ArtifactId,
        source: SourceAsset,
        work: Work,
    ) -> Result<Outcome<Artifact>, PipelineError> {
        // An earlier job for the same key may have produced it meanwhile
        if let Some(artifact) = self.restore(&id, &job.public_path).await? {
            job.set_stage(JobStage::Completed);
            self.track(&job).await;
            return Ok(Outcome::Done(artifact));
        }

        let result = self.encode_and_commit(&mut job, &id, &source, &work).await;
        match &result {
            Ok(Outcome::Done(_)) => job.set_stage(JobStage::Completed),
            Ok(Outcome::Skipped { reason }) => {
                self.reporter.info(&format!("Skipping: {}", reason));
                job.set_stage(JobStage::Skipped(reason.clone()));
            }
            Err(err) => {
                self.reporter
                    .error(&format!("Job {} for {} failed: {}", job.id, job.source.display(), err));
                job.fail(err.to_string());
            }
        }
        self.track(&job).await;
        result
    }

    async fn encode_and_commit(
        &self,
        job: &mut ConversionJob,
        id: &ArtifactId,
        source: &SourceAsset,
        work: &Work,
    ) -> Result<Outcome<Artifact>, PipelineError> {
        job.set_stage(JobStage::Probing);
        self.track(job).await;

        let metadata = match self.probe(source).await? {
            Outcome::Done(metadata) => metadata,
            Outcome::Skipped { reason } => return Ok(Outcome::Skipped { reason }),
        };

        let staged = self.store.staging_path(id).await?;
        let commands = match work {
            Work::Convert { profile, options } => {
                self.conversion_command(job, profile, options, source, &metadata, &staged)
                    .map(|command| vec![command])
            }
            Work::Screenshots(options) => {
                self.screenshot_commands(options, source, &metadata, &staged)
                    .await
            }
        };
        let commands = match commands {
            Ok(commands) => commands,
            Err(err) => {
                self.discard(&staged).await;
                return Err(err);
            }
        };

        job.set_stage(JobStage::Encoding);
        self.track(job).await;
        let reporter = JobReporter {
            inner: self.reporter.as_ref(),
            metrics: &self.metrics,
            job_id: &job.id,
        };
        for command in &commands {
            if let Err(err) = self.transcoder.run(command, &reporter).await {
                self.discard(&staged).await;
                return Err(err.into());
            }
        }

        job.set_stage(JobStage::Committing);
        self.track(job).await;
        let cache_path = match self.store.commit(id, &staged).await {
            Ok(path) => path,
            Err(err) => {
                self.discard(&staged).await;
                return Err(err.into());
            }
        };
        let public_path = publish_artifact(&cache_path, &job.public_path).await?;

        Ok(Outcome::Done(Artifact {
            key: id.key().clone(),
            cache_path,
            public_path,
            status: CacheStatus::Converted,
        }))
    }

    async fn discard(&self, staged: &Path) {
        if let Err(err) = self.store.discard_staging(staged).await {
            self.reporter.warn(&format!(
                "Could not remove staging output {}: {}",
                staged.display(),
                err
            ));
        }
    }

    /// Probe, or report why the source cannot be converted.
    async fn probe(&self, source: &SourceAsset) -> Result<Outcome<StreamMetadata>, PipelineError> {
        match self.prober.probe(&source.path).await {
            Ok(metadata) => Ok(Outcome::Done(metadata)),
            Err(ProbeError::NoVideoStream) => Ok(Outcome::skipped(format!(
                "{} has no video stream",
                source.path.display()
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn conversion_command(
        &self,
        job: &ConversionJob,
        profile: &Profile,
        options: &ConversionOptions,
        source: &SourceAsset,
        metadata: &StreamMetadata,
        staged: &Path,
    ) -> Result<TranscodeCommand, PipelineError> {
        let graph = build_filters(options, metadata);
        let input = ProfileInput {
            graph: &graph,
            options,
            raw_options: &job.options,
            metadata,
        };
        let spec = self.registry.encode(profile, &input)?;

        // Output length: the requested duration when a remap applies
        let duration = match (options.duration, metadata.duration_secs) {
            (Some(requested), Some(_)) if requested > 0.0 => Some(requested),
            (_, source_duration) => source_duration,
        };

        Ok(TranscodeCommand::from_spec(&spec, &source.path, staged, duration))
    }

    async fn screenshot_commands(
        &self,
        options: &ScreenshotOptions,
        source: &SourceAsset,
        metadata: &StreamMetadata,
        staged: &Path,
    ) -> Result<Vec<TranscodeCommand>, PipelineError> {
        let plan = plan_screenshots(options, metadata)?;
        tokio::fs::create_dir_all(staged)
            .await
            .map_err(|source| CacheError::Io {
                path: staged.to_path_buf(),
                source,
            })?;
        Ok(plan.commands(&source.path, staged))
    }
}
