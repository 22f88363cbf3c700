//! Test-only helpers: temp repos, scripted check runners, event builders.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::types::ToolResponse;
use crate::io::checks::{CheckRequest, CheckRun, CheckRunner};
use crate::io::config::{CheckConfig, ToolgateConfig};
use crate::io::event::HookEvent;
use crate::io::init::{STATE_DIR_NAME, StatePaths};
use crate::io::store::{FileStore, Lines, MemoryStore, Record, StateStore, StoreError, Update};
use crate::session::Session;

/// Temporary git repository with one committed file.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    /// `git init` + commit of `app.py`.
    pub fn new() -> Result<Self> {
        let repo = Self::plain()?;
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "toolgate@example.com"])?;
        repo.git(&["config", "user.name", "toolgate"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("app.py", "import os\n")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "init"])?;
        Ok(repo)
    }

    /// Temporary directory that is not a git repository.
    pub fn plain() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> StatePaths {
        StatePaths::with_state_dir(self.path(), self.path().join(STATE_DIR_NAME))
    }

    /// File-backed session over this repo, independent of `TOOLGATE_STATE_DIR`.
    pub fn session(&self, config: ToolgateConfig) -> Session {
        let paths = self.paths();
        let store = FileStore::new(&paths.state_dir, config.lock_timeout());
        Session::with_store(paths, config, store)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Scripted result for one [`ScriptedRunner`] call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Exit { code: i32, stdout: String },
    Timeout,
    /// Program not found.
    Missing,
}

impl Scripted {
    pub fn pass() -> Self {
        Scripted::Exit {
            code: 0,
            stdout: String::new(),
        }
    }

    pub fn fail(code: i32, stdout: &str) -> Self {
        Scripted::Exit {
            code,
            stdout: stdout.to_string(),
        }
    }
}

/// Check runner returning queued results in call order and recording requests.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: RefCell<VecDeque<Scripted>>,
    calls: RefCell<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Argv of every call so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }
}

impl CheckRunner for ScriptedRunner {
    fn run(&self, request: &CheckRequest) -> Result<CheckRun> {
        self.calls.borrow_mut().push(request.argv.clone());
        let next = self
            .script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted runner exhausted at {:?}", request.argv))?;
        let run = |exit_code, timed_out, stdout: String| CheckRun {
            exit_code,
            timed_out,
            stdout,
            stderr: String::new(),
            elapsed: Duration::from_millis(10),
        };
        match next {
            Scripted::Exit { code, stdout } => Ok(run(Some(code), false, stdout)),
            Scripted::Timeout => Ok(run(None, true, String::new())),
            Scripted::Missing => Err(anyhow::Error::new(IoError::new(
                ErrorKind::NotFound,
                format!("{} not found", request.argv.join(" ")),
            ))
            .context("spawn check")),
        }
    }
}

/// In-memory store whose writes to selected records time out on the lock.
/// Reads always succeed.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: BTreeSet<Record>,
}

impl FailingStore {
    pub fn new(failing: &[Record]) -> Self {
        Self {
            inner: MemoryStore::default(),
            failing: failing.iter().copied().collect(),
        }
    }

    /// Every write fails.
    pub fn all() -> Self {
        Self::new(&Record::ALL)
    }

    fn check(&self, record: Record) -> Result<()> {
        if self.failing.contains(&record) {
            return Err(StoreError::LockTimeout {
                lock: format!("{}.lock", record.file_name()),
                waited_ms: 0,
            }
            .into());
        }
        Ok(())
    }
}

impl StateStore for FailingStore {
    fn read(&self, record: Record) -> Result<Option<String>> {
        self.inner.read(record)
    }

    fn modify(&self, record: Record, update: &mut Update<'_>) -> Result<()> {
        self.check(record)?;
        self.inner.modify(record, update)
    }

    fn append(&self, record: Record, build: &mut Lines<'_>) -> Result<()> {
        self.check(record)?;
        self.inner.append(record, build)
    }
}

/// A check named `name` running `name` as its program.
pub fn check(name: &str) -> CheckConfig {
    CheckConfig {
        name: name.to_string(),
        command: vec![name.to_string()],
        signature_pattern: None,
        timeout_secs: None,
        verify_command: None,
        guidance: None,
        required: false,
    }
}

/// Successful `Edit` of `file_path` in `cwd`.
pub fn edit_event(cwd: &Path, file_path: &str) -> HookEvent {
    HookEvent {
        tool_name: "Edit".to_string(),
        tool_input: json!({ "file_path": file_path }),
        tool_response: ToolResponse {
            success: Some(true),
            ..ToolResponse::default()
        },
        cwd: Some(cwd.to_path_buf()),
    }
}

/// `Bash` run of `command` with the given exit code and stderr.
pub fn bash_event(command: &str, exit_code: i64, stderr: &str) -> HookEvent {
    HookEvent {
        tool_name: "Bash".to_string(),
        tool_input: json!({ "command": command }),
        tool_response: ToolResponse {
            exit_code: Some(exit_code),
            stderr: stderr.to_string(),
            ..ToolResponse::default()
        },
        cwd: None,
    }
}

/// Hook payload as a host would send it on stdin.
pub fn event_json(event: &HookEvent) -> Value {
    json!({
        "tool_name": event.tool_name,
        "tool_input": event.tool_input,
        "tool_response": event.tool_response,
        "cwd": event.cwd,
    })
}
