//! Per-invocation context shared by every command.

use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::io::config::{ToolgateConfig, load_config};
use crate::io::init::StatePaths;
use crate::io::store::{FileStore, StateStore};

/// Paths, config, and the state store for one project root.
///
/// Holds no state across invocations; everything durable goes through
/// [`StateStore`].
pub struct Session {
    pub paths: StatePaths,
    pub config: ToolgateConfig,
    store: Box<dyn StateStore>,
}

impl Session {
    /// Load config for `root` and open the file-backed store.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = StatePaths::new(root);
        let config = load_config(&paths.config_path)?;
        let store = FileStore::new(&paths.state_dir, config.lock_timeout());
        Ok(Self::with_store(paths, config, store))
    }

    pub fn with_store(
        paths: StatePaths,
        config: ToolgateConfig,
        store: impl StateStore + 'static,
    ) -> Self {
        Self {
            paths,
            config,
            store: Box::new(store),
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }
}

/// Log and collect a bookkeeping error, returning the value on success.
///
/// State writes after the first one in a hook are recovered locally: the
/// hook still reports its verdict and lists what could not be recorded.
pub(crate) fn keep<T>(errors: &mut Vec<String>, what: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "{what} failed");
            errors.push(format!("{what}: {err:#}"));
            None
        }
    }
}
