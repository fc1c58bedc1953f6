//! CLI entry point for clipcache
//!
//! Converts sources, extracts screenshots and manages the cache tiers around
//! a site build.

use clap::{Parser, Subcommand};
use clipcache::{
    BuildMode, CacheKey, Config, ConvertRequest, OptionSet, Pipeline, RemoteSource,
    ScreenshotRequest, SourceRef, TieredCacheStore,
};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// clipcache - cached, profile-driven video conversions
#[derive(Parser, Debug)]
#[command(name = "clipcache")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml). Defaults plus
    /// environment overrides when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a source with a profile
    Convert {
        /// Local path or http(s) URL
        source: String,

        #[arg(short, long)]
        profile: String,

        /// Conversion option, e.g. --opt maxWidth=640
        #[arg(long = "opt", value_name = "KEY=VALUE")]
        opts: Vec<String>,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Extract still frames
    Screenshots {
        /// Local path or http(s) URL
        source: String,

        /// Timestamp in seconds or percent of the duration, e.g. --at 50%
        #[arg(long = "at", value_name = "TIMESTAMP")]
        at: Vec<String>,

        #[arg(long)]
        width: Option<u32>,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Rotate the active cache tier to rolling before a build
    Rotate {
        /// Development build: leave the tiers alone
        #[arg(long)]
        develop: bool,
    },

    /// Settle the cache tiers after a build
    Reconcile,

    /// Show where a key's artifacts are, or a summary of both tiers
    Status { key: Option<String> },
}

/// Identity of a remote source, required for URLs.
#[derive(clap::Args, Debug)]
struct RemoteArgs {
    /// Stable identifier of the remote asset
    #[arg(long)]
    remote_id: Option<String>,

    /// Size of the remote asset in bytes
    #[arg(long)]
    size: Option<u64>,

    /// Declared MIME type of the remote asset
    #[arg(long)]
    mime_type: Option<String>,
}

fn source_ref(source: &str, remote: RemoteArgs) -> Result<SourceRef, String> {
    if !(source.starts_with("http://") || source.starts_with("https://")) {
        return Ok(SourceRef::Local(PathBuf::from(source)));
    }

    let (Some(remote_id), Some(size)) = (remote.remote_id, remote.size) else {
        return Err("Remote sources need --remote-id and --size".to_string());
    };
    let mut remote_source = RemoteSource::new(source, remote_id, size);
    if let Some(mime_type) = remote.mime_type {
        remote_source = remote_source.with_mime_type(mime_type);
    }
    Ok(SourceRef::Remote(remote_source))
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path)
            .map_err(|e| format!("Failed to load {}: {}", path.display(), e)),
        None => Ok(Config::from_env()),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

async fn run(args: Args) -> Result<(), String> {
    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Convert {
            source,
            profile,
            opts,
            remote,
        } => {
            let mut options = OptionSet::new();
            for pair in &opts {
                options.insert_pair(pair).map_err(|e| e.to_string())?;
            }
            let source = source_ref(&source, remote)?;

            let pipeline = Pipeline::new(config).await.map_err(|e| e.to_string())?;
            let outcome = pipeline
                .convert(ConvertRequest::new(source, profile, options))
                .await
                .map_err(|e| e.to_string())?;
            match outcome.done() {
                Some(artifact) => print_json(&artifact),
                None => print_json(&json!({ "status": "skipped" })),
            }
        }
        Command::Screenshots {
            source,
            at,
            width,
            remote,
        } => {
            let mut options = OptionSet::new();
            if !at.is_empty() {
                options.insert("timestamps", at);
            }
            if let Some(width) = width {
                options.insert("width", width);
            }
            let source = source_ref(&source, remote)?;

            let pipeline = Pipeline::new(config).await.map_err(|e| e.to_string())?;
            let outcome = pipeline
                .screenshots(ScreenshotRequest::new(source, options))
                .await
                .map_err(|e| e.to_string())?;
            match outcome.done() {
                Some(artifact) => print_json(&artifact),
                None => print_json(&json!({ "status": "skipped" })),
            }
        }
        Command::Rotate { develop } => {
            let mode = if develop {
                BuildMode::Develop
            } else {
                BuildMode::Production
            };
            let store = TieredCacheStore::new(config.cache.cache_dir);
            let report = store.rotate(mode).await.map_err(|e| e.to_string())?;
            tracing::info!(?report, "Cache rotation finished");
            print_json(&report)
        }
        Command::Reconcile => {
            let store = TieredCacheStore::new(config.cache.cache_dir);
            let outcome = store.reconcile().await.map_err(|e| e.to_string())?;
            tracing::info!(?outcome, "Cache reconciled");
            print_json(&outcome)
        }
        Command::Status { key } => {
            let store = TieredCacheStore::new(config.cache.cache_dir);
            match key {
                Some(key) => {
                    let key: CacheKey = key.parse().map_err(|e: clipcache::KeyError| e.to_string())?;
                    let located = store.locate(&key).await.map_err(|e| e.to_string())?;
                    print_json(&json!({ "key": key, "artifacts": located }))
                }
                None => {
                    let summary = store.summary().await.map_err(|e| e.to_string())?;
                    print_json(&summary)
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
