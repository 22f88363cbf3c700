//! Git adapter for the gate.
//!
//! Git is the preferred baseline: the diff-size check reads `--numstat`, and
//! rollback checks the working tree back out from the index.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Line totals from `git diff --numstat`. Binary files count as zero lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub added: u64,
    pub deleted: u64,
    pub files: u64,
}

impl DiffStats {
    pub fn delta(&self) -> u64 {
        self.added + self.deleted
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// A wrapper for `root` if it is the top of a git work tree.
    pub fn detect(root: &Path) -> Option<Self> {
        root.join(".git").exists().then(|| Self::new(root))
    }

    /// Unstaged line changes against the index.
    #[instrument(skip_all)]
    pub fn diff_numstat(&self) -> Result<DiffStats> {
        let out = self.run_capture(&["diff", "--numstat"])?;
        let stats = parse_numstat(&out);
        debug!(added = stats.added, deleted = stats.deleted, files = stats.files, "diff stats");
        Ok(stats)
    }

    /// Paths with unstaged modifications to tracked files.
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Discard unstaged modifications to tracked files.
    #[instrument(skip_all)]
    pub fn restore_worktree(&self) -> Result<()> {
        debug!(workdir = %self.workdir.display(), "checking out worktree from index");
        self.run_checked(&["checkout", "--", "."])?;
        Ok(())
    }

    /// Fail if any tracked file still differs from the index.
    pub fn ensure_tracked_clean(&self) -> Result<()> {
        let remaining = self.changed_paths()?;
        if remaining.is_empty() {
            return Ok(());
        }
        warn!(remaining = remaining.len(), "tracked changes survived checkout");
        Err(anyhow!(
            "tracked changes remain after checkout: {}",
            remaining.join(", ")
        ))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_numstat(out: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in out.lines() {
        let mut parts = line.split('\t');
        let (Some(added), Some(deleted), Some(_path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        stats.added += added.parse::<u64>().unwrap_or(0);
        stats.deleted += deleted.parse::<u64>().unwrap_or(0);
        stats.files += 1;
    }
    stats
}
