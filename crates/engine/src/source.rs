//! Source asset resolution.
//!
//! Resolves a path into a [`SourceAsset`]: absolute location, content digest
//! and media type. Only video sources are converted; anything else is
//! reported back as a skip rather than an error.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Video file extensions accepted as sources (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".m4v", ".mov", ".mkv", ".webm", ".avi", ".ts", ".m2ts", ".mpg", ".mpeg", ".ogv",
    ".wmv", ".flv",
];

/// Still image extensions, recognized so they can be skipped explicitly.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".avif", ".bmp", ".tif", ".tiff", ".svg",
];

const DIGEST_CHUNK: usize = 64 * 1024;

/// Error type for source resolution
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The source has no extension or content type to classify it by
    #[error("Cannot determine the file type of {}", .0.display())]
    UnknownType(PathBuf),

    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Broad media category of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Image,
    Other,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Video => write!(f, "video"),
            MediaType::Image => write!(f, "image"),
            MediaType::Other => write!(f, "other"),
        }
    }
}

/// Classifies a path by its extension.
///
/// Returns `None` when the path has no extension at all.
pub fn classify_path(path: &Path) -> Option<MediaType> {
    let ext = path.extension()?.to_str()?;
    let ext = format!(".{}", ext.to_lowercase());
    Some(if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        MediaType::Video
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        MediaType::Image
    } else {
        MediaType::Other
    })
}

/// Classifies a MIME type such as `video/mp4`.
pub fn classify_mime(mime: &str) -> MediaType {
    let essence = mime.split(';').next().unwrap_or("").trim().to_lowercase();
    match essence.split_once('/') {
        Some(("video", _)) => MediaType::Video,
        Some(("image", _)) => MediaType::Image,
        _ => MediaType::Other,
    }
}

/// An immutable, resolved source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAsset {
    pub path: PathBuf,
    /// SHA-256 hex identifying the content
    pub digest: String,
    pub media_type: MediaType,
    pub size_bytes: u64,
}

impl SourceAsset {
    /// Resolve a local file: absolute path, content digest, media type.
    pub async fn resolve_local(path: &Path) -> Result<Self, SourceError> {
        let absolute = match tokio::fs::canonicalize(path).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(SourceError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let media_type =
            classify_path(&absolute).ok_or_else(|| SourceError::UnknownType(absolute.clone()))?;
        let size_bytes = tokio::fs::metadata(&absolute)
            .await
            .map_err(|source| SourceError::Io {
                path: absolute.clone(),
                source,
            })?
            .len();
        let digest = digest_file(&absolute).await?;

        Ok(Self {
            path: absolute,
            digest,
            media_type,
            size_bytes,
        })
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    /// Why this source is skipped, or `None` for video sources.
    pub fn skip_reason(&self) -> Option<String> {
        (!self.is_video()).then(|| {
            format!(
                "{} is not a video source ({})",
                self.path.display(),
                self.media_type
            )
        })
    }

    /// File extension including the dot, lowercased, or empty.
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default()
    }
}

/// SHA-256 hex of a file's content, read in chunks.
pub async fn digest_file(path: &Path) -> Result<String, SourceError> {
    let io_err = |source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK];

    loop {
        let read = file.read(&mut buf).await.map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Digest of a remote asset, known before it is downloaded.
pub fn remote_digest(remote_id: &str, size_bytes: u64) -> String {
    hex::encode(Sha256::digest(format!("{}:{}", remote_id, size_bytes).as_bytes()))
}

/// Where a source with this digest is stored under the sources directory.
pub fn source_path(sources_dir: &Path, digest: &str, extension: &str) -> PathBuf {
    let ext = extension.trim_start_matches('.');
    if ext.is_empty() {
        sources_dir.join(digest)
    } else {
        sources_dir.join(format!("{}.{}", digest, ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_path_is_case_insensitive() {
        assert_eq!(classify_path(Path::new("clip.MOV")), Some(MediaType::Video));
        assert_eq!(classify_path(Path::new("/a/b/clip.webm")), Some(MediaType::Video));
        assert_eq!(classify_path(Path::new("poster.JPG")), Some(MediaType::Image));
        assert_eq!(classify_path(Path::new("notes.txt")), Some(MediaType::Other));
        assert_eq!(classify_path(Path::new("Makefile")), None);
    }

    #[test]
    fn test_classify_mime() {
        assert_eq!(classify_mime("video/mp4"), MediaType::Video);
        assert_eq!(classify_mime("Video/QuickTime; codecs=avc1"), MediaType::Video);
        assert_eq!(classify_mime("image/png"), MediaType::Image);
        assert_eq!(classify_mime("application/pdf"), MediaType::Other);
        assert_eq!(classify_mime(""), MediaType::Other);
    }

    #[tokio::test]
    async fn test_resolve_local_video() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"abc").unwrap();

        let asset = SourceAsset::resolve_local(&path).await.unwrap();
        assert!(asset.path.is_absolute());
        assert!(asset.is_video());
        assert_eq!(asset.size_bytes, 3);
        // sha256("abc")
        assert_eq!(
            asset.digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(asset.skip_reason(), None);
        assert_eq!(asset.extension(), ".mp4");
    }

    #[tokio::test]
    async fn test_non_video_carries_skip_reason() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("poster.png");
        std::fs::write(&path, b"png").unwrap();

        let asset = SourceAsset::resolve_local(&path).await.unwrap();
        assert_eq!(asset.media_type, MediaType::Image);
        assert!(asset.skip_reason().unwrap().contains("not a video source"));
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SourceAsset::resolve_local(&dir.path().join("missing.mp4")).await,
            Err(SourceError::NotFound(_))
        ));

        let bare = dir.path().join("README");
        std::fs::write(&bare, b"x").unwrap();
        assert!(matches!(
            SourceAsset::resolve_local(&bare).await,
            Err(SourceError::UnknownType(_))
        ));
    }

    #[tokio::test]
    async fn test_digest_spans_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.mkv");
        let body: Vec<u8> = (0..(DIGEST_CHUNK * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &body).unwrap();

        assert_eq!(digest_file(&path).await.unwrap(), hex::encode(Sha256::digest(&body)));
    }

    #[test]
    fn test_source_path_layout() {
        let dir = Path::new("/cache/sources");
        assert_eq!(source_path(dir, "abc", ".MP4"), dir.join("abc.MP4"));
        assert_eq!(source_path(dir, "abc", ""), dir.join("abc"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_remote_digest_depends_on_both_parts(id in "[a-z0-9]{1,16}", size in 0u64..1_000_000) {
            let digest = remote_digest(&id, size);
            prop_assert_eq!(digest.len(), 64);
            prop_assert_eq!(&digest, &remote_digest(&id, size));
            prop_assert_ne!(&digest, &remote_digest(&id, size + 1));
        }
    }
}
