//! Paths and initialization for the `.toolgate/` state directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ToolgateConfig, write_config};
use super::store::Record;

pub const STATE_DIR_NAME: &str = ".toolgate";
/// Overrides the state directory location.
pub const STATE_DIR_ENV: &str = "TOOLGATE_STATE_DIR";

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub snapshots_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl StatePaths {
    /// Paths under `<root>/.toolgate`, or under `TOOLGATE_STATE_DIR` when set.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = match std::env::var_os(STATE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => root.join(PathBuf::from(dir)),
            _ => root.join(STATE_DIR_NAME),
        };
        Self::with_state_dir(root, state_dir)
    }

    pub fn with_state_dir(root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            root: root.into(),
            config_path: state_dir.join("config.toml"),
            snapshots_dir: state_dir.join("snapshots"),
            gitignore_path: state_dir.join(".gitignore"),
            state_dir,
        }
    }

    pub fn record_path(&self, record: Record) -> PathBuf {
        self.state_dir.join(record.file_name())
    }
}

/// Options for `init_state`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config and `.gitignore`.
    pub force: bool,
}

/// Create the state directory, its `.gitignore`, and a default config.
///
/// Existing state records are never touched, even with `force`.
pub fn init_state(paths: &StatePaths, options: &InitOptions) -> Result<()> {
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "toolgate init: {} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "toolgate init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.snapshots_dir)?;
    fs::write(&paths.gitignore_path, STATE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &ToolgateConfig::default(), CONFIG_HEADER)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const STATE_GITIGNORE: &str = "*\n";

const CONFIG_HEADER: &str = "\
# toolgate configuration
#
# Checks run in order after the diff limit; the first failure rejects the
# change and rolls the workspace back. Exit code 0 is the only pass signal.
#
# [[checks]]
# name = \"lint\"
# command = [\"ruff\", \"check\", \".\"]
# signature_pattern = '\\b([A-Z]{1,4}\\d{3,4})\\b'
# guidance = \"Run `ruff check --fix .` and remove unused imports.\"
#
# [[checks]]
# name = \"test\"
# command = [\"pytest\", \"-q\"]
# timeout_secs = 900
# required = true

";
