// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Discovery of new and existing plot files.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;

/// Watches the configured directories for newly created plot files.
///
/// Matching create events are pushed onto the bounded transfer queue; a full queue blocks the
/// watcher's own thread, which is the backpressure the rest of the pipeline relies on.
#[derive(Debug)]
pub(crate) struct PlotWatcher {
    _watcher: RecommendedWatcher,
}

impl PlotWatcher {
    pub fn start(
        paths: &[PathBuf],
        suffix: &str,
        queue: mpsc::Sender<PathBuf>,
    ) -> anyhow::Result<Self> {
        let suffix = suffix.to_owned();
        let mut watcher = notify::recommended_watcher(
            move |event: Result<Event, notify::Error>| match event {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_)) {
                        return;
                    }
                    for path in event.paths {
                        if !has_plot_suffix(&path, &suffix) {
                            continue;
                        }
                        tracing::info!(path = %path.display(), "new plot created");
                        if queue.blocking_send(path).is_err() {
                            tracing::warn!("transfer queue closed, dropping watch event");
                        }
                    }
                }
                Err(error) => tracing::warn!(%error, "filesystem watcher error"),
            },
        )
        .context("failed to initialize the filesystem watcher")?;

        for path in paths {
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch plots path {}", path.display()))?;
        }
        Ok(Self { _watcher: watcher })
    }
}

pub(crate) fn has_plot_suffix(path: &Path, suffix: &str) -> bool {
    path.extension().and_then(|extension| extension.to_str()) == Some(suffix)
}

/// Enumerates the files carrying the plot suffix in each watch directory.
pub(crate) fn existing_plots(paths: &[PathBuf], suffix: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut plots = Vec::new();
    for dir in paths {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list files for path {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to list files for path {}", dir.display()))?
                .path();
            if path.is_file() && has_plot_suffix(&path, suffix) {
                plots.push(path);
            }
        }
    }
    Ok(plots)
}

#[cfg(test)]
mod tests {
    use garden_test_utils::param_test;
    use tempfile::TempDir;

    use super::*;

    param_test! {
        suffix_filter {
            plain_plot("/plots/a.plot", "plot", true),
            wrong_extension("/plots/a.tmp", "plot", false),
            no_extension("/plots/a", "plot", false),
            in_progress_double_extension("/plots/a.plot.tmp", "plot", false),
            custom_suffix("/plots/a.fin", "fin", true),
        }
    }
    fn suffix_filter(path: &str, suffix: &str, matches: bool) {
        assert_eq!(has_plot_suffix(Path::new(path), suffix), matches);
    }

    #[test]
    fn existing_plots_filters_by_suffix() -> garden_test_utils::Result {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("a.plot"), b"a")?;
        std::fs::write(dir.path().join("b.plot"), b"b")?;
        std::fs::write(dir.path().join("c.tmp"), b"c")?;
        std::fs::create_dir(dir.path().join("nested.plot"))?;

        let mut found = existing_plots(&[dir.path().to_path_buf()], "plot")?;
        found.sort();
        assert_eq!(
            found,
            vec![dir.path().join("a.plot"), dir.path().join("b.plot")]
        );
        Ok(())
    }

    #[test]
    fn existing_plots_fails_on_missing_directory() {
        assert!(existing_plots(&[PathBuf::from("/definitely/does/not/exist")], "plot").is_err());
    }
}
