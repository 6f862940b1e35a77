//! The "last good" copy of the production tree used by recovery.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;
use vigil_common::fs::{replace_file, VerifiedCopier};
use vigil_common::{VigilError, VigilResult};

/// Files copied and skipped by a best-effort tree copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeCopyReport {
    pub copied: usize,
    pub failed: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct KnownGoodStore {
    root: PathBuf,
    executable: PathBuf,
}

impl KnownGoodStore {
    pub fn new(root: impl Into<PathBuf>, executable: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            executable: executable.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn executable(&self) -> PathBuf {
        self.root.join(&self.executable)
    }

    /// Snapshots production before it is touched.
    ///
    /// The executable goes through a verified copy and must succeed; the
    /// remaining files are copied best effort. Without a production
    /// executable there is nothing to snapshot and the existing copy is kept.
    pub async fn refresh(
        &self,
        production_root: &Path,
        excluded: &[PathBuf],
        copier: &VerifiedCopier,
    ) -> VigilResult<Option<TreeCopyReport>> {
        let installed = production_root.join(&self.executable);
        if !installed.is_file() {
            warn!(
                "no production executable at {}, keeping the existing known-good copy",
                installed.display()
            );
            return Ok(None);
        }

        let target = self.executable();
        copier
            .copy_file(&installed, &target)
            .await
            .into_result(&installed, &target)?;

        let mut skip = excluded.to_vec();
        skip.push(self.executable.clone());
        let report = copy_tree_best_effort(production_root, &self.root, &skip).await?;
        debug!(
            "known-good refreshed: executable plus {} files ({} skipped)",
            report.copied,
            report.failed.len()
        );
        Ok(Some(report))
    }

    /// Copies everything except the executable back into production, best effort.
    pub async fn restore_tree(
        &self,
        production_root: &Path,
        excluded: &[PathBuf],
    ) -> VigilResult<TreeCopyReport> {
        if !self.root.is_dir() {
            return Err(VigilError::KnownGoodMissing {
                path: self.root.clone(),
            });
        }
        let mut skip = excluded.to_vec();
        skip.push(self.executable.clone());
        copy_tree_best_effort(&self.root, production_root, &skip).await
    }
}

/// Per-file copy that carries on past failures. `skip` holds relative paths.
async fn copy_tree_best_effort(
    source: &Path,
    dest: &Path,
    skip: &[PathBuf],
) -> VigilResult<TreeCopyReport> {
    let (source, dest, skip) = (source.to_path_buf(), dest.to_path_buf(), skip.to_vec());
    tokio::task::spawn_blocking(move || {
        let mut report = TreeCopyReport::default();
        let walker = WalkDir::new(&source)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(&source) {
                Ok(relative) => !skip.iter().any(|s| relative.starts_with(s)),
                Err(_) => true,
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("skipping unreadable entry: {}", e);
                    if let Some(path) = e.path() {
                        report.failed.push(path.to_path_buf());
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&source) else {
                continue;
            };
            match replace_file(entry.path(), &dest.join(relative)) {
                Ok(()) => report.copied += 1,
                Err(e) => {
                    debug!("could not copy {}: {}", relative.display(), e);
                    report.failed.push(relative.to_path_buf());
                }
            }
        }
        report
    })
    .await
    .map_err(|e| VigilError::io(None, "copy tree", io::Error::other(e.to_string())))
}
