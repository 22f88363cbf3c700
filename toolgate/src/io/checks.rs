//! Check runner seam for gate checks and fix-task verify commands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use super::process::{command_from_argv, run_command_with_timeout};

/// Set in every check subprocess; a gate started with it set exits at once.
pub const GATE_RUNNING_ENV: &str = "TOOLGATE_GATE_RUNNING";

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CheckRequest {
    pub fn new(argv: &[String], workdir: &Path, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            argv: argv.to_vec(),
            workdir: workdir.to_path_buf(),
            timeout,
            output_limit_bytes,
        }
    }
}

/// Completed external command. Spawn failures are reported as `Err` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRun {
    /// `None` when killed by a signal or on timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CheckRun {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

pub trait CheckRunner {
    /// Run one command. A missing program surfaces as an `io::Error` of kind
    /// `NotFound` (see [`super::process::is_not_found`]).
    fn run(&self, request: &CheckRequest) -> Result<CheckRun>;
}

/// Runs checks as real subprocesses.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCheckRunner;

impl CheckRunner for ProcessCheckRunner {
    fn run(&self, request: &CheckRequest) -> Result<CheckRun> {
        let mut cmd = command_from_argv(&request.argv)?;
        cmd.current_dir(&request.workdir).env(GATE_RUNNING_ENV, "1");
        let output = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)?;
        Ok(CheckRun {
            exit_code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            timed_out: output.timed_out,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            elapsed: output.elapsed,
        })
    }
}
