//! clipcache
//!
//! Conversion cache and transcoder job orchestration for video assets:
//! profile-driven ffmpeg commands, a content-addressed two-tier cache and
//! serialized conversion and download queues.

pub mod cache;
pub mod encode;
pub mod fetch;
pub mod filters;
pub mod job;
pub mod key;
pub mod metrics;
pub mod options;
pub mod pipeline;
pub mod probe;
pub mod profile;
pub mod publish;
pub mod queue;
pub mod reporter;
pub mod screenshot;
pub mod source;
pub mod startup;

pub use clipcache_config as config;
pub use clipcache_config::Config;
pub use cache::{
    ArtifactId, BuildMode, CacheError, CacheSummary, LocatedArtifact, ReconcileOutcome,
    RestoreOutcome, RotationReport, Tier, TieredCacheStore,
};
pub use encode::{EncodeError, FfmpegExecutor, TranscodeCommand, Transcoder};
pub use fetch::{FetchError, HttpTransport, RemoteFetcher, RetryPolicy, Transport};
pub use job::{Artifact, CacheStatus, ConversionJob, JobKind, JobStage, Outcome};
pub use key::{derive_key, CacheKey, KeyError};
pub use metrics::{new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics};
pub use options::{ConversionOptions, OptionSet, OptionsError};
pub use pipeline::{
    Components, ConvertRequest, Pipeline, PipelineError, RemoteSource, ScreenshotRequest,
    SourceRef,
};
pub use probe::{FfprobeProber, ProbeError, Prober, StreamMetadata};
pub use profile::{CustomProfileSpec, EncodeSpec, Profile, ProfileError, ProfileRegistry};
pub use queue::{ConversionQueue, QueueError};
pub use reporter::{MemoryReporter, Reporter, SharedReporter, TracingReporter};
pub use screenshot::ScreenshotOptions;
pub use startup::{run_startup_checks, Binaries, StartupError};
