//! Workspace baselines and rollback.
//!
//! A git work tree is restored by checking the worktree back out from the
//! index. Touched paths are additionally copied into a manifest snapshot
//! (`snapshots/<id>/`), which is the only baseline outside git. A snapshot
//! taken by the pre-tool hook holds true pre-change content and is marked
//! `pending` until a gate run consumes it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::git::Git;
use super::store::write_atomic;
use crate::core::ids::new_id;

/// Files copied into a single snapshot.
pub const MAX_SNAPSHOT_FILES: usize = 200;
/// Snapshots kept on disk; older ones are pruned.
pub const KEEP_SNAPSHOTS: usize = 20;

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("git restore failed: {0}")]
    Git(String),
    #[error("restore {path}: {source}")]
    Restore {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rollback left the workspace unrestored: {0}")]
    Verify(String),
}

/// Context marker for a gate run that could not establish its baseline.
#[derive(Debug, Error)]
#[error("could not establish a rollback baseline")]
pub struct BaselineUnavailable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the workspace root.
    pub path: String,
    /// Whether the path was a regular file when captured. Paths that did not
    /// exist are deleted on restore.
    pub existed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub id: String,
    pub created: DateTime<Utc>,
    pub root: PathBuf,
    /// Captured before the tool ran and not yet consumed by a gate run.
    #[serde(default)]
    pub pending: bool,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    dir: PathBuf,
    pub manifest: SnapshotManifest,
}

impl Snapshot {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stored_path(&self, rel: &str) -> PathBuf {
        self.dir.join(FILES_DIR).join(rel)
    }

    fn write_manifest(&self) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(&self.manifest).context("serialize manifest")?;
        buf.push('\n');
        write_atomic(&self.dir.join(MANIFEST_FILE), &buf)
    }

    fn restore(&self) -> Result<(), RollbackError> {
        let root = &self.manifest.root;
        for entry in &self.manifest.entries {
            let target = root.join(&entry.path);
            let result = if entry.existed {
                copy_file(&self.stored_path(&entry.path), &target)
            } else {
                match fs::remove_file(&target) {
                    Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            };
            result.map_err(|source| RollbackError::Restore {
                path: entry.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn verify(&self) -> Result<(), RollbackError> {
        let root = &self.manifest.root;
        for entry in &self.manifest.entries {
            let target = root.join(&entry.path);
            if entry.existed {
                let expected = fs::read(self.stored_path(&entry.path));
                let actual = fs::read(&target);
                match (expected, actual) {
                    (Ok(expected), Ok(actual)) if expected == actual => {}
                    _ => return Err(RollbackError::Verify(format!("{} differs from baseline", entry.path))),
                }
            } else if target.exists() {
                return Err(RollbackError::Verify(format!("{} should not exist", entry.path)));
            }
        }
        Ok(())
    }
}

fn copy_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to).map(|_| ())
}

/// Reject absolute paths and paths escaping the root.
fn is_safe_relative(rel: &str) -> bool {
    let path = Path::new(rel);
    !rel.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Copy `paths` (relative to `root`) into a new snapshot under `snapshots_dir`.
#[instrument(skip_all, fields(root = %root.display(), pending))]
pub fn capture(
    snapshots_dir: &Path,
    root: &Path,
    paths: &[String],
    pending: bool,
    now: DateTime<Utc>,
) -> Result<Snapshot> {
    let id = new_id("snap", now);
    let dir = snapshots_dir.join(&id);
    fs::create_dir_all(&dir).with_context(|| format!("create snapshot {}", dir.display()))?;

    let mut snapshot = Snapshot {
        dir,
        manifest: SnapshotManifest {
            id,
            created: now,
            root: root.to_path_buf(),
            pending,
            entries: Vec::new(),
        },
    };

    for rel in paths.iter().take(MAX_SNAPSHOT_FILES) {
        if !is_safe_relative(rel) {
            warn!(path = %rel, "skipping path outside workspace");
            continue;
        }
        let source = root.join(rel);
        let existed = source.is_file();
        if existed {
            copy_file(&source, &snapshot.stored_path(rel))
                .with_context(|| format!("copy {} into snapshot", source.display()))?;
        } else if source.exists() {
            debug!(path = %rel, "skipping non-file path");
            continue;
        }
        snapshot.manifest.entries.push(ManifestEntry {
            path: rel.clone(),
            existed,
        });
    }

    snapshot.write_manifest()?;
    debug!(id = %snapshot.manifest.id, files = snapshot.manifest.entries.len(), "snapshot captured");
    Ok(snapshot)
}

fn load(dir: &Path) -> Result<Snapshot> {
    let path = dir.join(MANIFEST_FILE);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let manifest = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Snapshot {
        dir: dir.to_path_buf(),
        manifest,
    })
}

fn snapshot_dirs(snapshots_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(snapshots_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("list {}", snapshots_dir.display())),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("list {}", snapshots_dir.display()))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    // Ids are time-ordered, so name order is age order.
    dirs.sort();
    Ok(dirs)
}

/// Consume the newest pending pre-tool snapshot for `root`, if any.
pub fn take_pending(snapshots_dir: &Path, root: &Path) -> Result<Option<Snapshot>> {
    for dir in snapshot_dirs(snapshots_dir)?.into_iter().rev() {
        let mut snapshot = match load(&dir) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "ignoring unreadable snapshot");
                continue;
            }
        };
        if snapshot.manifest.pending && snapshot.manifest.root == root {
            snapshot.manifest.pending = false;
            snapshot.write_manifest()?;
            debug!(id = %snapshot.manifest.id, "consumed pre-tool snapshot");
            return Ok(Some(snapshot));
        }
    }
    Ok(None)
}

/// Delete all but the newest `keep` snapshots.
pub fn prune(snapshots_dir: &Path, keep: usize) -> Result<usize> {
    let dirs = snapshot_dirs(snapshots_dir)?;
    let excess = dirs.len().saturating_sub(keep);
    for dir in &dirs[..excess] {
        fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    if excess > 0 {
        debug!(removed = excess, "pruned snapshots");
    }
    Ok(excess)
}

/// How a baseline restores the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMethod {
    GitCheckout,
    SnapshotRestore,
}

/// Restorable pre-change state for one gate run.
#[derive(Debug)]
pub struct Baseline {
    git: Option<Git>,
    snapshot: Option<Snapshot>,
    /// Snapshot was captured before the tool ran.
    pre_change: bool,
    restored: bool,
}

impl Baseline {
    /// Establish the baseline: git if available, plus the pre-tool snapshot if
    /// one is pending, otherwise a fresh snapshot of the touched paths.
    pub fn establish(
        snapshots_dir: &Path,
        root: &Path,
        touched: &[String],
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let git = Git::detect(root);
        let (snapshot, pre_change) = match take_pending(snapshots_dir, root)? {
            Some(snapshot) => (Some(snapshot), true),
            None if git.is_none() => {
                warn!("no pre-tool snapshot outside git; baseline holds current content");
                (Some(capture(snapshots_dir, root, touched, false, now)?), false)
            }
            None => (None, false),
        };
        if let Err(err) = prune(snapshots_dir, KEEP_SNAPSHOTS) {
            warn!(err = %format!("{err:#}"), "snapshot prune failed");
        }
        Ok(Self {
            git,
            snapshot,
            pre_change,
            restored: false,
        })
    }

    pub fn method(&self) -> RollbackMethod {
        if self.git.is_some() {
            RollbackMethod::GitCheckout
        } else {
            RollbackMethod::SnapshotRestore
        }
    }

    pub fn is_pre_change(&self) -> bool {
        self.git.is_some() || self.pre_change
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        self.snapshot.as_ref().map(|s| s.manifest.id.as_str())
    }

    /// Restore the workspace and verify the result. Idempotent.
    #[instrument(skip_all)]
    pub fn rollback(&mut self) -> Result<RollbackMethod, RollbackError> {
        if self.restored {
            debug!("rollback already applied");
            return Ok(self.method());
        }
        if let Some(git) = &self.git {
            git.restore_worktree()
                .map_err(|err| RollbackError::Git(format!("{err:#}")))?;
        }
        // A pre-tool snapshot also covers untracked and created files.
        let replay = self.snapshot.as_ref().filter(|_| self.pre_change || self.git.is_none());
        if let Some(snapshot) = replay {
            snapshot.restore()?;
        }
        if let Some(git) = &self.git {
            git.ensure_tracked_clean()
                .map_err(|err| RollbackError::Verify(format!("{err:#}")))?;
        } else if let Some(snapshot) = replay {
            snapshot.verify()?;
        }
        self.restored = true;
        info!(method = ?self.method(), "workspace rolled back");
        Ok(self.method())
    }

    /// Drop the snapshot after an accepted change.
    pub fn release(self) -> Result<()> {
        if let Some(snapshot) = self.snapshot {
            fs::remove_dir_all(snapshot.dir())
                .with_context(|| format!("remove {}", snapshot.dir().display()))?;
        }
        Ok(())
    }
}

/// Manifests of all readable snapshots, oldest first.
pub fn list(snapshots_dir: &Path) -> Result<Vec<SnapshotManifest>> {
    Ok(snapshot_dirs(snapshots_dir)?
        .iter()
        .filter_map(|dir| load(dir).ok().map(|s| s.manifest))
        .collect())
}
