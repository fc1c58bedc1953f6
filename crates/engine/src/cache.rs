//! Two-tier on-disk artifact cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! active/videos/<key>.<ext>       current build
//! active/screenshots/<key>/*.jpg
//! rolling/...                     previous build, kept as fallback
//! staging/                        in-progress outputs, never restored
//! ```
//!
//! Every mutation of the tier directories goes through [`TieredCacheStore`]
//! and is serialized by its internal lock.

use crate::key::CacheKey;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use walkdir::WalkDir;

const VIDEOS_DIR: &str = "videos";
const SCREENSHOTS_DIR: &str = "screenshots";
const STAGING_DIR: &str = "staging";

/// Error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A committed artifact is missing from staging
    #[error("Staged artifact not found: {}", .0.display())]
    MissingStaged(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Active,
    Rolling,
}

impl Tier {
    pub fn dir_name(self) -> &'static str {
        match self {
            Tier::Active => "active",
            Tier::Rolling => "rolling",
        }
    }
}

/// Whether the build may rotate tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    #[default]
    Production,
    /// Interactive/dev cycles never rotate
    Develop,
}

/// Kind of cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Video { extension: String },
    Screenshots,
}

/// Address of one artifact inside a tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    key: CacheKey,
    kind: ArtifactKind,
}

impl ArtifactId {
    pub fn video(key: &CacheKey, extension: &str) -> Self {
        Self {
            key: key.clone(),
            kind: ArtifactKind::Video {
                extension: extension.trim_start_matches('.').to_string(),
            },
        }
    }

    pub fn screenshots(key: &CacheKey) -> Self {
        Self {
            key: key.clone(),
            kind: ArtifactKind::Screenshots,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn kind(&self) -> &ArtifactKind {
        &self.kind
    }

    /// File or directory name of the artifact.
    pub fn file_name(&self) -> String {
        match &self.kind {
            ArtifactKind::Video { extension } => format!("{}.{}", self.key, extension),
            ArtifactKind::Screenshots => self.key.to_string(),
        }
    }

    /// Path relative to a tier directory.
    pub fn relative_path(&self) -> PathBuf {
        let parent = match self.kind {
            ArtifactKind::Video { .. } => VIDEOS_DIR,
            ArtifactKind::Screenshots => SCREENSHOTS_DIR,
        };
        Path::new(parent).join(self.file_name())
    }
}

/// Where an artifact currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Absent,
    RollingOnly,
    Active,
}

/// Result of a restore attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Already in the active tier
    Active(PathBuf),
    /// Moved from the rolling tier into the active tier
    Promoted(PathBuf),
    Miss,
}

impl RestoreOutcome {
    pub fn path(&self) -> Option<&Path> {
        match self {
            RestoreOutcome::Active(p) | RestoreOutcome::Promoted(p) => Some(p),
            RestoreOutcome::Miss => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        !matches!(self, RestoreOutcome::Miss)
    }
}

/// What a rotation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RotationReport {
    pub skipped: bool,
    pub dropped_stale_rolling: bool,
    pub rotated_active: bool,
}

/// What post-build reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Only the active tier exists
    Settled,
    /// The build left no active tier; rolling took its place
    PromotedRolling,
    /// Both tiers existed; rolling was removed
    DroppedRolling,
    /// Neither tier exists
    Empty,
}

/// An artifact found on disk by [`TieredCacheStore::locate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedArtifact {
    pub tier: Tier,
    pub path: PathBuf,
}

/// Artifact counts and sizes of one tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierSummary {
    pub present: bool,
    pub videos: usize,
    pub screenshot_sets: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub root: PathBuf,
    pub active: TierSummary,
    pub rolling: TierSummary,
}

/// The active/rolling cache rooted at one directory.
#[derive(Debug)]
pub struct TieredCacheStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl TieredCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.dir_name())
    }

    pub fn path_in(&self, tier: Tier, id: &ArtifactId) -> PathBuf {
        self.tier_dir(tier).join(id.relative_path())
    }

    pub async fn state(&self, id: &ArtifactId) -> ArtifactState {
        let _guard = self.lock.lock().await;
        self.state_unlocked(id).await
    }

    async fn state_unlocked(&self, id: &ArtifactId) -> ArtifactState {
        if exists(&self.path_in(Tier::Active, id)).await {
            ArtifactState::Active
        } else if exists(&self.path_in(Tier::Rolling, id)).await {
            ArtifactState::RollingOnly
        } else {
            ArtifactState::Absent
        }
    }

    /// Look an artifact up, promoting it out of the rolling tier if needed.
    ///
    /// Promotion moves the artifact: afterwards the rolling tier no longer
    /// holds it.
    pub async fn restore(&self, id: &ArtifactId) -> Result<RestoreOutcome, CacheError> {
        let _guard = self.lock.lock().await;
        let active = self.path_in(Tier::Active, id);

        match self.state_unlocked(id).await {
            ArtifactState::Active => Ok(RestoreOutcome::Active(active)),
            ArtifactState::RollingOnly => {
                move_path(&self.path_in(Tier::Rolling, id), &active).await?;
                Ok(RestoreOutcome::Promoted(active))
            }
            ArtifactState::Absent => Ok(RestoreOutcome::Miss),
        }
    }

    /// Fresh staging location for an artifact. The parent directory exists
    /// on return; the path itself does not.
    pub async fn staging_path(&self, id: &ArtifactId) -> Result<PathBuf, CacheError> {
        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await.map_err(io_err(&staging))?;
        Ok(staging.join(format!("{}-{}", uuid::Uuid::new_v4(), id.file_name())))
    }

    /// Move a finished artifact from staging into the active tier,
    /// replacing any previous copy.
    pub async fn commit(&self, id: &ArtifactId, staged: &Path) -> Result<PathBuf, CacheError> {
        if !exists(staged).await {
            return Err(CacheError::MissingStaged(staged.to_path_buf()));
        }

        let _guard = self.lock.lock().await;
        let active = self.path_in(Tier::Active, id);
        remove_path(&active).await?;
        move_path(staged, &active).await?;
        Ok(active)
    }

    /// Remove a staging file or directory left by a failed job.
    pub async fn discard_staging(&self, staged: &Path) -> Result<(), CacheError> {
        remove_path(staged).await
    }

    /// Pre-build rotation: drop a stale rolling tier, then turn the active
    /// tier into the new rolling tier. A no-op for [`BuildMode::Develop`].
    pub async fn rotate(&self, mode: BuildMode) -> Result<RotationReport, CacheError> {
        if mode == BuildMode::Develop {
            return Ok(RotationReport {
                skipped: true,
                ..Default::default()
            });
        }

        let _guard = self.lock.lock().await;
        let active = self.tier_dir(Tier::Active);
        let rolling = self.tier_dir(Tier::Rolling);
        let mut report = RotationReport::default();

        if exists(&rolling).await {
            remove_path(&rolling).await?;
            report.dropped_stale_rolling = true;
        }
        if exists(&active).await {
            move_path(&active, &rolling).await?;
            report.rotated_active = true;
        }

        Ok(report)
    }

    /// Post-build reconciliation. Resolves any tier combination a finished,
    /// aborted or crashed build may leave behind, and clears staging.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, CacheError> {
        let _guard = self.lock.lock().await;
        let active = self.tier_dir(Tier::Active);
        let rolling = self.tier_dir(Tier::Rolling);

        let outcome = match (exists(&active).await, exists(&rolling).await) {
            (false, true) => {
                move_path(&rolling, &active).await?;
                ReconcileOutcome::PromotedRolling
            }
            (true, true) => {
                remove_path(&rolling).await?;
                ReconcileOutcome::DroppedRolling
            }
            (true, false) => ReconcileOutcome::Settled,
            (false, false) => ReconcileOutcome::Empty,
        };

        remove_path(&self.root.join(STAGING_DIR)).await?;
        Ok(outcome)
    }

    /// Every artifact stored under `key`, in either tier, any kind.
    pub async fn locate(&self, key: &CacheKey) -> Result<Vec<LocatedArtifact>, CacheError> {
        let _guard = self.lock.lock().await;
        let mut found = Vec::new();

        for tier in [Tier::Active, Tier::Rolling] {
            let videos = self.tier_dir(tier).join(VIDEOS_DIR);
            let prefix = format!("{}.", key);
            match fs::read_dir(&videos).await {
                Ok(mut entries) => {
                    while let Some(entry) = entries.next_entry().await.map_err(io_err(&videos))? {
                        if entry.file_name().to_string_lossy().starts_with(&prefix) {
                            found.push(LocatedArtifact {
                                tier,
                                path: entry.path(),
                            });
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&videos)(e)),
            }

            let shots = self.path_in(tier, &ArtifactId::screenshots(key));
            if exists(&shots).await {
                found.push(LocatedArtifact { tier, path: shots });
            }
        }

        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }

    pub async fn summary(&self) -> Result<CacheSummary, CacheError> {
        let _guard = self.lock.lock().await;
        let active = self.tier_dir(Tier::Active);
        let rolling = self.tier_dir(Tier::Rolling);

        let (active, rolling) = tokio::task::spawn_blocking(move || {
            (summarize_tier(&active), summarize_tier(&rolling))
        })
        .await
        .map_err(|e| CacheError::Io {
            path: self.root.clone(),
            source: io::Error::other(e),
        })?;

        Ok(CacheSummary {
            root: self.root.clone(),
            active,
            rolling,
        })
    }
}

fn summarize_tier(dir: &Path) -> TierSummary {
    if !dir.is_dir() {
        return TierSummary::default();
    }

    let count = |sub: &str| {
        std::fs::read_dir(dir.join(sub))
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    };
    let bytes = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();

    TierSummary {
        present: true,
        videos: count(VIDEOS_DIR),
        screenshot_sets: count(SCREENSHOTS_DIR),
        bytes,
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Remove a file or directory tree; absent paths are fine.
async fn remove_path(path: &Path) -> Result<(), CacheError> {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(io_err(path))
}

/// Move a file or directory, falling back to copy + delete when a plain
/// rename is not possible (e.g. across filesystems).
async fn move_path(from: &Path, to: &Path) -> Result<(), CacheError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }

    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    let (src, dst) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || copy_recursive(&src, &dst))
        .await
        .map_err(|e| CacheError::Io {
            path: from.to_path_buf(),
            source: io::Error::other(e),
        })?
        .map_err(io_err(to))?;

    remove_path(from).await
}

fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_file() {
        std::fs::copy(from, to)?;
        return Ok(());
    }

    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copy a file or directory tree to `to`, creating parents as needed.
pub(crate) async fn copy_path(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    let (src, dst) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || copy_recursive(&src, &dst))
        .await
        .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::derive_key;
    use crate::options::OptionSet;
    use tempfile::TempDir;

    fn key(n: u8) -> CacheKey {
        derive_key(&format!("{:064x}", n), "h264", &OptionSet::new()).unwrap()
    }

    async fn put(store: &TieredCacheStore, tier: Tier, id: &ArtifactId, body: &str) -> PathBuf {
        let path = store.path_in(tier, id);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_restore_hit_promote_and_miss() {
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        let hot = ArtifactId::video(&key(1), "mp4");
        let warm = ArtifactId::video(&key(2), "mp4");
        let cold = ArtifactId::video(&key(3), "mp4");

        let hot_path = put(&store, Tier::Active, &hot, "hot").await;
        let warm_rolling = put(&store, Tier::Rolling, &warm, "warm").await;

        assert_eq!(store.restore(&hot).await.unwrap(), RestoreOutcome::Active(hot_path));
        assert_eq!(store.state(&warm).await, ArtifactState::RollingOnly);

        let promoted = store.restore(&warm).await.unwrap();
        assert_eq!(promoted, RestoreOutcome::Promoted(store.path_in(Tier::Active, &warm)));
        assert!(!warm_rolling.exists(), "promotion must move, not copy");
        assert_eq!(fs::read_to_string(promoted.path().unwrap()).await.unwrap(), "warm");
        assert_eq!(store.state(&warm).await, ArtifactState::Active);

        assert_eq!(store.restore(&cold).await.unwrap(), RestoreOutcome::Miss);
        assert_eq!(store.state(&cold).await, ArtifactState::Absent);
    }

    #[tokio::test]
    async fn test_commit_moves_staged_file_into_active() {
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        let id = ArtifactId::video(&key(4), ".webm");

        let staged = store.staging_path(&id).await.unwrap();
        assert!(staged.to_string_lossy().ends_with(&format!("{}.webm", key(4))));
        fs::write(&staged, "encoded").await.unwrap();

        let committed = store.commit(&id, &staged).await.unwrap();
        assert_eq!(committed, dir.path().join("active/videos").join(format!("{}.webm", key(4))));
        assert!(!staged.exists());
        assert_eq!(fs::read_to_string(&committed).await.unwrap(), "encoded");

        // Second commit replaces the first
        let staged = store.staging_path(&id).await.unwrap();
        fs::write(&staged, "re-encoded").await.unwrap();
        store.commit(&id, &staged).await.unwrap();
        assert_eq!(fs::read_to_string(&committed).await.unwrap(), "re-encoded");
    }

    #[tokio::test]
    async fn test_commit_without_staged_file_fails() {
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        let id = ArtifactId::video(&key(5), "mp4");
        let staged = store.staging_path(&id).await.unwrap();

        assert!(matches!(
            store.commit(&id, &staged).await,
            Err(CacheError::MissingStaged(_))
        ));
        assert_eq!(store.state(&id).await, ArtifactState::Absent);
    }

    #[tokio::test]
    async fn test_screenshot_sets_promote_as_directories() {
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        let id = ArtifactId::screenshots(&key(6));

        let set = store.path_in(Tier::Rolling, &id);
        fs::create_dir_all(&set).await.unwrap();
        fs::write(set.join("frame-00.jpg"), "a").await.unwrap();
        fs::write(set.join("frame-01.jpg"), "b").await.unwrap();

        let restored = store.restore(&id).await.unwrap();
        let active = restored.path().unwrap();
        assert!(active.join("frame-01.jpg").exists());
        assert!(!set.exists());
    }

    #[tokio::test]
    async fn test_rotate_shifts_active_to_rolling() {
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        let old = ArtifactId::video(&key(7), "mp4");
        let current = ArtifactId::video(&key(8), "mp4");
        put(&store, Tier::Rolling, &old, "old").await;
        put(&store, Tier::Active, &current, "current").await;

        let report = store.rotate(BuildMode::Production).await.unwrap();
        assert!(report.dropped_stale_rolling);
        assert!(report.rotated_active);
        assert!(!store.tier_dir(Tier::Active).exists());
        assert_eq!(store.state(&old).await, ArtifactState::Absent);
        assert_eq!(store.state(&current).await, ArtifactState::RollingOnly);

        // Restore after rotation promotes back
        assert!(matches!(
            store.restore(&current).await.unwrap(),
            RestoreOutcome::Promoted(_)
        ));
        assert_eq!(store.state(&current).await, ArtifactState::Active);
    }

    #[tokio::test]
    async fn test_develop_builds_never_rotate() {
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        let id = ArtifactId::video(&key(9), "mp4");
        put(&store, Tier::Active, &id, "x").await;

        let report = store.rotate(BuildMode::Develop).await.unwrap();
        assert!(report.skipped);
        assert_eq!(store.state(&id).await, ArtifactState::Active);
    }

    #[tokio::test]
    async fn test_reconcile_state_matrix() {
        // rolling only: partial build, rolling comes back as active
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        let id = ArtifactId::video(&key(10), "gif");
        put(&store, Tier::Rolling, &id, "kept").await;
        assert_eq!(store.reconcile().await.unwrap(), ReconcileOutcome::PromotedRolling);
        assert!(!store.tier_dir(Tier::Rolling).exists());
        assert_eq!(store.state(&id).await, ArtifactState::Active);

        // both: rolling is a leftover
        put(&store, Tier::Rolling, &ArtifactId::video(&key(11), "gif"), "stale").await;
        assert_eq!(store.reconcile().await.unwrap(), ReconcileOutcome::DroppedRolling);
        assert!(!store.tier_dir(Tier::Rolling).exists());
        assert_eq!(store.state(&id).await, ArtifactState::Active);

        // active only
        assert_eq!(store.reconcile().await.unwrap(), ReconcileOutcome::Settled);

        // nothing at all
        let empty = TempDir::new().unwrap();
        let store = TieredCacheStore::new(empty.path());
        assert_eq!(store.reconcile().await.unwrap(), ReconcileOutcome::Empty);
    }

    #[tokio::test]
    async fn test_reconcile_clears_staging() {
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        let staged = store.staging_path(&ArtifactId::video(&key(12), "mp4")).await.unwrap();
        fs::write(&staged, "partial").await.unwrap();

        store.reconcile().await.unwrap();
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_summary_counts_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        put(&store, Tier::Active, &ArtifactId::video(&key(13), "mp4"), "12345").await;
        let shots = store.path_in(Tier::Active, &ArtifactId::screenshots(&key(14)));
        fs::create_dir_all(&shots).await.unwrap();
        fs::write(shots.join("frame-00.jpg"), "123").await.unwrap();

        let summary = store.summary().await.unwrap();
        assert!(summary.active.present);
        assert_eq!(summary.active.videos, 1);
        assert_eq!(summary.active.screenshot_sets, 1);
        assert_eq!(summary.active.bytes, 8);
        assert!(!summary.rolling.present);
    }

    #[tokio::test]
    async fn test_locate_finds_every_kind_in_both_tiers() {
        let dir = TempDir::new().unwrap();
        let store = TieredCacheStore::new(dir.path());
        let k = key(15);
        let mp4 = put(&store, Tier::Active, &ArtifactId::video(&k, "mp4"), "a").await;
        let webm = put(&store, Tier::Rolling, &ArtifactId::video(&k, "webm"), "b").await;
        put(&store, Tier::Active, &ArtifactId::video(&key(16), "mp4"), "other").await;
        let shots = store.path_in(Tier::Active, &ArtifactId::screenshots(&k));
        fs::create_dir_all(&shots).await.unwrap();

        let found = store.locate(&k).await.unwrap();
        let paths: Vec<&PathBuf> = found.iter().map(|a| &a.path).collect();
        assert_eq!(found.len(), 3);
        assert!(paths.contains(&&mp4));
        assert!(paths.contains(&&webm));
        assert!(paths.contains(&&shots));
        assert!(found.iter().any(|a| a.tier == Tier::Rolling && a.path == webm));

        assert!(store.locate(&key(17)).await.unwrap().is_empty());
    }
}
