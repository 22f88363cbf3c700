//! Quality gate, self-healer, and fix queue for coding-agent tool events.
//!
//! Hook commands (`snapshot`, `gate`, `heal`, `learn`) read one event as
//! JSON on stdin. Every command prints its result as JSON on stdout and
//! signals the verdict through the exit code.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use toolgate::exit_codes;
use toolgate::io::checks::ProcessCheckRunner;
use toolgate::io::event::{HookEvent, ParsedEvent, parse_event_bytes, read_stdin};
use toolgate::io::init::{InitOptions, StatePaths, init_state};
use toolgate::io::snapshot::{BaselineUnavailable, RollbackError};
use toolgate::io::workspace::find_project_root;
use toolgate::session::Session;
use toolgate::{fixes, gate, heal, learn, logging, status, tasks};

#[derive(Parser)]
#[command(
    name = "toolgate",
    version,
    about = "Deterministic quality gate and fix queue for coding-agent tool events"
)]
struct Cli {
    /// Project root. Defaults to the nearest ancestor of the event cwd (or the
    /// current directory) holding `.git`, `Cargo.toml`, `pyproject.toml`, or `package.json`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.toolgate/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Pre-tool hook: copy the paths the tool will touch into a pending baseline.
    Snapshot,
    /// Post-tool hook: run the checks and roll back on failure.
    Gate,
    /// Post-tool hook: record a failed tool invocation as an incident.
    Heal,
    /// Post-tool hook: learn the outcome of a tool use.
    Learn,
    /// Manage the active task.
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Inspect and process the fix queue.
    Fix {
        #[command(subcommand)]
        action: FixCommand,
    },
    /// Show the active task, metrics, fix queue, and top failures.
    Status,
    /// Inspect or reset the pattern table.
    Patterns {
        #[command(subcommand)]
        action: PatternsCommand,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Start a task. Fails if one is already active.
    Start { goal: String },
    /// Close the active task.
    Close {
        #[arg(long, conflicts_with = "fail", required_unless_present = "fail")]
        success: bool,
        #[arg(long)]
        fail: bool,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Print the active task.
    Show,
}

#[derive(Subcommand)]
enum FixCommand {
    /// Fix-queue counts by status.
    Stats,
    /// Verify the oldest pending fix task.
    ProcessOne,
}

#[derive(Subcommand)]
enum PatternsCommand {
    Show,
    /// Clear every pattern counter.
    Reset,
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("toolgate: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<RollbackError>().is_some() {
        exit_codes::ROLLBACK_FAILED
    } else if err.downcast_ref::<BaselineUnavailable>().is_some() {
        exit_codes::BASELINE_FAILED
    } else {
        exit_codes::INVALID
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root;
    match cli.command {
        Command::Init { force } => {
            let paths = StatePaths::new(operator_root(root.as_deref())?);
            init_state(&paths, &InitOptions { force })?;
            print_json(&json!({
                "state_dir": paths.state_dir,
                "config": paths.config_path,
            }))
        }
        Command::Snapshot => hook(root.as_deref(), |session, event| {
            gate::capture_pre_tool(session, event, Utc::now()).map(|report| (report, exit_codes::OK))
        }),
        Command::Gate => hook(root.as_deref(), |session, event| {
            let report = gate::run_gate(session, &ProcessCheckRunner, event, Utc::now())?;
            let code = report.exit_code();
            Ok((report, code))
        }),
        Command::Heal => hook(root.as_deref(), |session, event| {
            heal::heal(session, event, Utc::now()).map(|outcome| (outcome, exit_codes::OK))
        }),
        Command::Learn => hook(root.as_deref(), |session, event| {
            learn::learn(session, event, Utc::now()).map(|learned| (learned, exit_codes::OK))
        }),
        Command::Task { action } => {
            let session = Session::open(&operator_root(root.as_deref())?)?;
            match action {
                TaskCommand::Start { goal } => {
                    print_json(&tasks::start_task(&session, &goal, Utc::now())?)
                }
                TaskCommand::Close { success, note, .. } => {
                    print_json(&tasks::close_task(&session, success, &note, Utc::now())?)
                }
                TaskCommand::Show => print_json(&tasks::show_task(&session)),
            }
        }
        Command::Fix { action } => {
            let session = Session::open(&operator_root(root.as_deref())?)?;
            match action {
                FixCommand::Stats => print_json(&fixes::queue_stats(&session)),
                FixCommand::ProcessOne => print_json(&fixes::process_one_task(
                    &session,
                    &ProcessCheckRunner,
                    Utc::now(),
                )?),
            }
        }
        Command::Status => {
            let session = Session::open(&operator_root(root.as_deref())?)?;
            print_json(&status::status(&session))
        }
        Command::Patterns { action } => {
            let session = Session::open(&operator_root(root.as_deref())?)?;
            match action {
                PatternsCommand::Show => print_json(&learn::show_patterns(&session)),
                PatternsCommand::Reset => {
                    learn::reset(&session)?;
                    print_json(&json!({ "reset": true }))
                }
            }
        }
    }
}

/// Shared hook plumbing: recursion guard, event parsing, root discovery.
///
/// A malformed event is counted as neutral and accepted.
fn hook<T: Serialize>(
    root: Option<&Path>,
    handle: impl FnOnce(&Session, &HookEvent) -> Result<(T, i32)>,
) -> Result<i32> {
    if gate::recursion_guard_active() {
        return print_json(&json!({ "skipped": "recursion_guard" }));
    }
    let raw = read_stdin()?;
    match parse_event_bytes(&raw) {
        ParsedEvent::Malformed(reason) => {
            let session = Session::open(&operator_root(root)?)?;
            if let Err(err) = learn::record_malformed(&session, Utc::now()) {
                warn!(err = %format!("{err:#}"), "could not count malformed event");
            }
            print_json(&json!({ "skipped": "malformed_event", "reason": reason }))
        }
        ParsedEvent::Event(event) => {
            let start = match (root, &event.cwd) {
                (Some(root), _) => root.to_path_buf(),
                (None, Some(cwd)) if cwd.is_dir() => find_project_root(cwd),
                (None, _) => operator_root(None)?,
            };
            let session = Session::open(&start)?;
            let (value, code) = handle(&session, &event)?;
            print_json(&value)?;
            Ok(code)
        }
    }
}

fn operator_root(root: Option<&Path>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root.to_path_buf()),
        None => {
            let cwd = std::env::current_dir().context("resolve current directory")?;
            Ok(find_project_root(&cwd))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<i32> {
    let payload = serde_json::to_string_pretty(value).context("serialize result")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}
