// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! The registry of storage directories a harvester writes plots into.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _};
use tokio::sync::OwnedMutexGuard;

use crate::common::utils::disk_space;

/// How long a storage path is excluded from selection after a failed write.
pub const WRITE_FAILURE_COOLDOWN: Duration = Duration::from_secs(60);

/// A single storage directory, typically one mounted disk.
///
/// The `busy` flag guarantees at most one concurrent writer per directory, which avoids the
/// fragmentation caused by interleaving two large sequential writes on the same spindle. It can
/// be observed without any lock; the transfer lock serializes the writes themselves.
#[derive(Debug)]
pub struct PlotPath {
    path: PathBuf,
    busy: AtomicBool,
    free_space: AtomicU64,
    total_space: AtomicU64,
    paused_until: Mutex<Option<Instant>>,
    transfer_lock: Arc<tokio::sync::Mutex<()>>,
}

impl PlotPath {
    /// Validates `path` as a storage directory and probes its filesystem.
    fn open(path: &Path) -> anyhow::Result<Arc<Self>> {
        let path = path
            .canonicalize()
            .with_context(|| format!("path {} failed expansion", path.display()))?;
        if !path.is_dir() {
            bail!("path {} is not a directory", path.display());
        }
        let space = disk_space(&path)
            .with_context(|| format!("path {} failed validation", path.display()))?;

        Ok(Arc::new(Self {
            path,
            busy: AtomicBool::new(false),
            free_space: AtomicU64::new(space.free),
            total_space: AtomicU64::new(space.total),
            paused_until: Mutex::new(None),
            transfer_lock: Arc::new(tokio::sync::Mutex::new(())),
        }))
    }

    /// Creates a path with explicit space figures, skipping the filesystem probe.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn with_space(path: PathBuf, free_space: u64, total_space: u64) -> Arc<Self> {
        Arc::new(Self {
            path,
            busy: AtomicBool::new(false),
            free_space: AtomicU64::new(free_space),
            total_space: AtomicU64::new(total_space),
            paused_until: Mutex::new(None),
            transfer_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// The absolute directory this path writes into.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn free_space(&self) -> u64 {
        self.free_space.load(Ordering::Relaxed)
    }

    pub fn total_space(&self) -> u64 {
        self.total_space.load(Ordering::Relaxed)
    }

    /// Whether a transfer is currently writing into this directory.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_busy(&self) {
        self.busy.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_busy(&self) {
        self.busy.store(false, Ordering::Relaxed);
    }

    /// Attempts to take the write lock without waiting.
    pub(crate) fn try_lock_transfer(&self) -> Option<OwnedMutexGuard<()>> {
        self.transfer_lock.clone().try_lock_owned().ok()
    }

    /// Excludes this path from selection for the given duration.
    pub fn pause(&self, cooldown: Duration) {
        *self
            .paused_until
            .lock()
            .expect("pause mutex is never poisoned") = Some(Instant::now() + cooldown);
    }

    /// Whether a pause is currently in effect.
    pub fn is_paused(&self) -> bool {
        self.paused_until
            .lock()
            .expect("pause mutex is never poisoned")
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Re-probes the filesystem for the current free space.
    ///
    /// The total never changes in normal operation but is refreshed along the way. A probe
    /// failure keeps the previous figures; a directory that disappeared will fail its next
    /// transfer instead.
    fn refresh(&self) {
        match disk_space(&self.path) {
            Ok(space) => {
                self.free_space.store(space.free, Ordering::Relaxed);
                self.total_space.store(space.total, Ordering::Relaxed);
            }
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(), "failed to refresh free space");
            }
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn set_free_space(&self, free_space: u64) {
        self.free_space.store(free_space, Ordering::Relaxed);
    }
}

/// The fixed set of storage paths, with a free-space ordered view for selection.
///
/// The path set itself is immutable after startup; only the ordering and the per-path space
/// figures change, guarded by a single mutex.
#[derive(Debug)]
pub struct PlotPaths {
    by_path: HashMap<PathBuf, Arc<PlotPath>>,
    sorted: Mutex<Vec<Arc<PlotPath>>>,
}

impl PlotPaths {
    /// Validates the configured directories and builds the registry.
    ///
    /// Every entry of `paths` must be an existing directory. Each entry of `expand_paths` is a
    /// parent whose immediate subdirectories all become storage paths. Fails if no usable path
    /// remains.
    pub fn open(paths: &[PathBuf], expand_paths: &[PathBuf]) -> anyhow::Result<Self> {
        let expanded = expand_storage_paths(paths, expand_paths)?;

        let mut by_path = HashMap::new();
        let mut sorted = Vec::new();
        for path in &expanded {
            let plot_path = PlotPath::open(path)?;
            if by_path
                .insert(plot_path.path().to_path_buf(), plot_path.clone())
                .is_none()
            {
                sorted.push(plot_path);
            }
        }

        let this = Self {
            by_path,
            sorted: Mutex::new(sorted),
        };
        this.resort();
        Ok(this)
    }

    /// Builds a registry directly from paths, without validation.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn from_parts(paths: Vec<Arc<PlotPath>>) -> Self {
        let by_path = paths
            .iter()
            .map(|path| (path.path().to_path_buf(), path.clone()))
            .collect();
        let this = Self {
            by_path,
            sorted: Mutex::new(paths),
        };
        this.resort();
        this
    }

    /// Looks up the storage path for an exact directory.
    pub fn get(&self, store: &Path) -> Option<&Arc<PlotPath>> {
        self.by_path.get(store)
    }

    /// Returns the non-busy, non-paused path with the most free space, if any.
    ///
    /// Ties on free space break by insertion order.
    pub fn select_best(&self) -> Option<Arc<PlotPath>> {
        let sorted = self.sorted.lock().expect("sort mutex is never poisoned");
        sorted
            .iter()
            .find(|path| !path.is_busy() && !path.is_paused())
            .cloned()
    }

    /// Re-probes one path's filesystem and restores the selection order.
    ///
    /// Called after every completed or failed transfer.
    pub fn refresh(&self, path: &PlotPath) {
        path.refresh();
        self.resort();
    }

    /// Iterates over all storage paths, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PlotPath>> {
        self.by_path.values()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    fn resort(&self) {
        let mut sorted = self.sorted.lock().expect("sort mutex is never poisoned");
        sorted.sort_by(|a, b| b.free_space().cmp(&a.free_space()));
    }
}

/// Combines the directly configured paths with the subdirectories of every expandable parent.
///
/// Fails on an unreadable parent and on an empty result; non-directory entries under a parent
/// are skipped.
fn expand_storage_paths(
    paths: &[PathBuf],
    expand_paths: &[PathBuf],
) -> anyhow::Result<Vec<PathBuf>> {
    let mut expanded = paths.to_vec();
    for parent in expand_paths {
        let entries = std::fs::read_dir(parent)
            .with_context(|| format!("failed to evaluate path {}", parent.display()))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to evaluate path {}", parent.display()))?;
            if entry.file_type()?.is_dir() {
                expanded.push(entry.path());
            }
        }
    }

    if expanded.is_empty() {
        bail!("at least one plot path must be specified");
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn registry(paths: &[(&str, u64)]) -> PlotPaths {
        PlotPaths::from_parts(
            paths
                .iter()
                .map(|(name, free)| PlotPath::with_space(PathBuf::from(*name), *free, 1_000))
                .collect(),
        )
    }

    #[test]
    fn select_best_prefers_most_free_space() {
        let paths = registry(&[("/a", 100), ("/b", 900), ("/c", 500)]);
        let best = paths.select_best().unwrap();
        assert_eq!(best.path(), Path::new("/b"));
    }

    #[test]
    fn select_best_breaks_ties_by_insertion_order() {
        let paths = registry(&[("/a", 500), ("/b", 500), ("/c", 500)]);
        let best = paths.select_best().unwrap();
        assert_eq!(best.path(), Path::new("/a"));
    }

    #[test]
    fn select_best_skips_busy_paths() {
        let paths = registry(&[("/a", 900), ("/b", 500)]);
        paths.get(Path::new("/a")).unwrap().mark_busy();
        let best = paths.select_best().unwrap();
        assert_eq!(best.path(), Path::new("/b"));
    }

    #[test]
    fn select_best_returns_none_when_all_busy() {
        let paths = registry(&[("/a", 900)]);
        paths.get(Path::new("/a")).unwrap().mark_busy();
        assert!(paths.select_best().is_none());
    }

    #[test]
    fn select_best_skips_paused_paths() {
        let paths = registry(&[("/a", 900), ("/b", 500)]);
        paths
            .get(Path::new("/a"))
            .unwrap()
            .pause(Duration::from_secs(60));
        let best = paths.select_best().unwrap();
        assert_eq!(best.path(), Path::new("/b"));
    }

    #[test]
    fn pause_expires() {
        let path = PlotPath::with_space(PathBuf::from("/a"), 900, 1_000);
        path.pause(Duration::from_millis(0));
        assert!(!path.is_paused());
    }

    #[test]
    fn updated_free_space_restores_selection_order() {
        let paths = registry(&[("/a", 900), ("/b", 500)]);
        paths.get(Path::new("/a")).unwrap().set_free_space(100);
        paths.resort();
        let best = paths.select_best().unwrap();
        assert_eq!(best.path(), Path::new("/b"));
    }

    #[test]
    fn busy_flag_round_trips() {
        let path = PlotPath::with_space(PathBuf::from("/a"), 900, 1_000);
        assert!(!path.is_busy());
        path.mark_busy();
        assert!(path.is_busy());
        path.clear_busy();
        assert!(!path.is_busy());
    }

    #[test]
    fn transfer_lock_is_exclusive() {
        let path = PlotPath::with_space(PathBuf::from("/a"), 900, 1_000);
        let guard = path.try_lock_transfer().unwrap();
        assert!(path.try_lock_transfer().is_none());
        drop(guard);
        assert!(path.try_lock_transfer().is_some());
    }

    #[test]
    fn open_rejects_missing_directory() {
        assert!(PlotPaths::open(&[PathBuf::from("/definitely/does/not/exist")], &[]).is_err());
    }

    #[test]
    fn open_rejects_files() -> garden_test_utils::Result {
        let dir = TempDir::new()?;
        let file = dir.path().join("not-a-directory");
        std::fs::write(&file, b"plot")?;
        assert!(PlotPaths::open(&[file], &[]).is_err());
        Ok(())
    }

    #[test]
    fn expansion_rejects_empty_input() {
        assert!(expand_storage_paths(&[], &[]).is_err());
    }

    #[test]
    fn expansion_picks_up_subdirectories() -> garden_test_utils::Result {
        let parent = TempDir::new()?;
        std::fs::create_dir(parent.path().join("disk0"))?;
        std::fs::create_dir(parent.path().join("disk1"))?;
        std::fs::write(parent.path().join("ignored-file"), b"")?;

        let expanded = expand_storage_paths(&[], &[parent.path().to_path_buf()])?;
        assert_eq!(expanded.len(), 2);
        assert!(expanded.iter().all(|path| path.is_dir()));
        Ok(())
    }
}
