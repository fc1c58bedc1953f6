//! Publishing of cached artifacts.
//!
//! A published artifact is a copy of the cached one under the public
//! directory, so the cache tiers can rotate without breaking what was
//! handed out. The copy goes to a temporary sibling first and is renamed
//! into place, so readers never see a half-written file.

use crate::cache::{copy_path, ArtifactId};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The cached artifact to publish is gone.
    #[error("Cached artifact missing: {}", .0.display())]
    MissingArtifact(PathBuf),

    /// Failed to copy the artifact next to its public location.
    #[error("Failed to copy {} to {}: {source}", from.display(), to.display())]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to move the copy into its public location.
    #[error("Failed to move copy into {}: {source}", to.display())]
    RenameFailed {
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Public location of an artifact.
pub fn public_path(public_dir: &Path, id: &ArtifactId) -> PathBuf {
    public_dir.join(id.file_name())
}

/// Temporary sibling used while copying into `destination`.
fn temp_path(destination: &Path) -> PathBuf {
    let mut temp = destination.as_os_str().to_owned();
    temp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    PathBuf::from(temp)
}

/// Copy a cached artifact (file or frame directory) to `destination`.
///
/// An existing file with the same size is left alone; anything else at the
/// destination is replaced.
pub async fn publish_artifact(cached: &Path, destination: &Path) -> Result<PathBuf, PublishError> {
    let source_meta = fs::metadata(cached)
        .await
        .map_err(|_| PublishError::MissingArtifact(cached.to_path_buf()))?;

    if let Ok(existing) = fs::metadata(destination).await {
        if source_meta.is_file() && existing.is_file() && existing.len() == source_meta.len() {
            return Ok(destination.to_path_buf());
        }
    }

    let temp = temp_path(destination);
    if let Err(source) = copy_path(cached, &temp).await {
        remove_any(&temp).await;
        return Err(PublishError::CopyFailed {
            from: cached.to_path_buf(),
            to: destination.to_path_buf(),
            source,
        });
    }

    // Directories cannot be renamed over a non-empty target
    if source_meta.is_dir() {
        remove_any(destination).await;
    }

    if let Err(source) = fs::rename(&temp, destination).await {
        remove_any(&temp).await;
        return Err(PublishError::RenameFailed {
            to: destination.to_path_buf(),
            source,
        });
    }

    Ok(destination.to_path_buf())
}

async fn remove_any(path: &Path) {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            let _ = fs::remove_dir_all(path).await;
        }
        Ok(_) => {
            let _ = fs::remove_file(path).await;
        }
        Err(_) => {}
    }
}
