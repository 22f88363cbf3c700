//! Project root discovery and touched-path summary.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use super::git::Git;

pub const ROOT_MARKERS: [&str; 4] = [".git", "Cargo.toml", "pyproject.toml", "package.json"];
pub const MAX_ROOT_DEPTH: usize = 20;
pub const MAX_TOUCHED_PATHS: usize = 50;

/// Nearest ancestor of `start` (inclusive) holding a root marker, else `start`.
pub fn find_project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .take(MAX_ROOT_DEPTH + 1)
        .find(|dir| ROOT_MARKERS.iter().any(|marker| dir.join(marker).exists()))
        .unwrap_or(start)
        .to_path_buf()
}

/// Root-relative paths a tool invocation may have changed.
///
/// Git-reported changes first, then the event's target path; de-duplicated and
/// capped at [`MAX_TOUCHED_PATHS`].
pub fn touched_paths(root: &Path, git: Option<&Git>, tool_input: &Value) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut paths = Vec::new();

    let from_git = match git.map(Git::changed_paths).transpose() {
        Ok(found) => found.unwrap_or_default(),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "git diff failed; using event paths only");
            Vec::new()
        }
    };
    let from_event = ["file_path", "path"]
        .iter()
        .filter_map(|key| tool_input.get(key).and_then(Value::as_str))
        .filter_map(|path| relative_to_root(root, path));

    for path in from_git.into_iter().chain(from_event) {
        if paths.len() >= MAX_TOUCHED_PATHS {
            break;
        }
        if seen.insert(path.clone()) {
            paths.push(path);
        }
    }
    paths
}

/// `path` relative to `root`; `None` for empty paths or paths outside `root`.
pub fn relative_to_root(root: &Path, path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let candidate = Path::new(path);
    let relative = if candidate.is_absolute() {
        candidate.strip_prefix(root).ok()?
    } else {
        candidate
    };
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn finds_nearest_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("project");
        let nested = project.join("src").join("deep");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(project.join("pyproject.toml"), "").expect("marker");

        assert_eq!(find_project_root(&nested), project);
    }

    #[test]
    fn falls_back_to_start_without_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let nested = temp.path().join("a");
        fs::create_dir_all(&nested).expect("mkdir");
        let found = find_project_root(&nested);
        // Some ancestor of the temp dir may carry a marker; never below start.
        assert!(nested.starts_with(&found));
    }

    #[test]
    fn event_paths_are_root_relative_and_deduplicated() {
        let root = Path::new("/work/app");
        let input = json!({"file_path": "/work/app/src/main.py", "path": "src/main.py"});
        assert_eq!(touched_paths(root, None, &input), vec!["src/main.py".to_string()]);
    }

    #[test]
    fn rejects_paths_outside_root() {
        let root = Path::new("/work/app");
        assert_eq!(relative_to_root(root, "/etc/passwd"), None);
        assert_eq!(relative_to_root(root, "../secret"), None);
        assert_eq!(relative_to_root(root, "./a/b.txt"), Some("a/b.txt".to_string()));
        assert_eq!(relative_to_root(root, "  "), None);
    }
}
