//! Orchestration for one quality-gate run and the pre-tool snapshot hook.
//!
//! A gate run establishes a baseline, then runs the diff limit and each
//! configured check in order, stopping at the first failure. A failure is
//! recorded (pattern, incident, fix task, task note) and the workspace is
//! rolled back. Bookkeeping errors never skip the rollback; they are
//! collected on the report instead.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::core::signature::{self, CHECK_ERROR, DIFF_LIMIT_CHECK, GATE_PASS};
use crate::core::types::{IncidentSource, Outcome};
use crate::exit_codes;
use crate::incidents::{self, NewIncident};
use crate::io::checks::{CheckRequest, CheckRunner, GATE_RUNNING_ENV};
use crate::io::config::CheckConfig;
use crate::io::event::HookEvent;
use crate::io::git::Git;
use crate::io::process::is_not_found;
use crate::io::snapshot::{self, Baseline, BaselineUnavailable, RollbackMethod};
use crate::io::state::{record_pattern, update_metrics};
use crate::io::workspace::touched_paths;
use crate::session::{Session, keep};
use crate::tasks::{self, GatePassEffect};

/// Output tail stored on gate incidents.
const INCIDENT_OUTPUT_CHARS: usize = 2000;

/// True when running inside a check spawned by another gate run.
pub fn recursion_guard_active() -> bool {
    std::env::var_os(GATE_RUNNING_ENV).is_some_and(|value| !value.is_empty())
}

/// Result of one gate run, printed as JSON for the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateReport {
    pub passed: bool,
    /// A non-required check was skipped because its program is missing.
    pub degraded: bool,
    /// Checks that ran, in order, with their pass state.
    pub checks: Vec<(String, bool)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    pub failed_check: Option<String>,
    pub failed_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    /// False when the change was rejected without a pre-change baseline to
    /// restore (no git, no pre-tool snapshot).
    pub rolled_back: bool,
    pub rollback_method: Option<RollbackMethod>,
    /// The baseline holds content from before the tool ran.
    pub baseline_pre_change: bool,
    pub incident_id: Option<String>,
    pub fix_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<GatePassEffect>,
    pub root: String,
    pub elapsed_sec: f64,
    /// Bookkeeping failures that did not stop the run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl GateReport {
    pub fn exit_code(&self) -> i32 {
        match (self.passed, self.degraded) {
            (true, false) => exit_codes::OK,
            (true, true) => exit_codes::DEGRADED,
            (false, _) => exit_codes::REJECTED,
        }
    }
}

/// First failing check.
#[derive(Debug, Clone)]
struct Failure {
    check: String,
    signature: String,
    output: String,
    verify_command: Vec<String>,
    guidance: String,
}

#[derive(Debug, Default)]
struct CheckPass {
    checks: Vec<(String, bool)>,
    skipped: Vec<String>,
    failure: Option<Failure>,
}

/// Run the gate for `event`. Returns `Err` only when no baseline could be
/// established, carrying [`snapshot::BaselineUnavailable`], or when the
/// rollback failed, carrying a [`snapshot::RollbackError`].
#[instrument(skip_all, fields(tool = %event.tool_name))]
pub fn run_gate<R: CheckRunner>(
    session: &Session,
    runner: &R,
    event: &HookEvent,
    now: DateTime<Utc>,
) -> Result<GateReport> {
    let start = Instant::now();
    let root = session.root();
    let git = Git::detect(root);
    let touched = touched_paths(root, git.as_ref(), &event.tool_input);
    debug!(touched = touched.len(), git = git.is_some(), "gate starting");

    let mut baseline = Baseline::establish(&session.paths.snapshots_dir, root, &touched, now)
        .context(BaselineUnavailable)?;
    let pass = run_checks(session, runner, git.as_ref());

    let mut report = GateReport {
        passed: pass.failure.is_none(),
        degraded: !pass.skipped.is_empty(),
        checks: pass.checks,
        skipped: pass.skipped,
        failed_check: None,
        failed_signature: None,
        guidance: None,
        rolled_back: false,
        rollback_method: None,
        baseline_pre_change: baseline.is_pre_change(),
        incident_id: None,
        fix_task_id: None,
        task: None,
        root: root.display().to_string(),
        elapsed_sec: 0.0,
        errors: Vec::new(),
    };

    match pass.failure {
        None => {
            accept(session, event, &mut report, now);
            if let Err(err) = baseline.release() {
                warn!(err = %format!("{err:#}"), "snapshot release failed");
            }
        }
        Some(failure) => reject(session, event, &mut baseline, failure, &touched, &mut report, now)?,
    }

    report.elapsed_sec = start.elapsed().as_secs_f64();
    info!(
        passed = report.passed,
        degraded = report.degraded,
        rolled_back = report.rolled_back,
        elapsed_sec = report.elapsed_sec,
        "gate finished"
    );
    Ok(report)
}

fn run_checks<R: CheckRunner>(session: &Session, runner: &R, git: Option<&Git>) -> CheckPass {
    let mut pass = CheckPass::default();
    let config = &session.config;

    if let Some(git) = git
        && config.diff_limit_lines > 0
    {
        let result = diff_limit(git, config.diff_limit_lines);
        let ok = result.is_none();
        pass.checks.push((DIFF_LIMIT_CHECK.to_string(), ok));
        if let Some(failure) = result {
            pass.failure = Some(failure);
            return pass;
        }
    }

    for check in &config.checks {
        match run_check(session, runner, check) {
            CheckOutcome::Passed => pass.checks.push((check.name.clone(), true)),
            CheckOutcome::Skipped => pass.skipped.push(check.name.clone()),
            CheckOutcome::Failed(failure) => {
                pass.checks.push((check.name.clone(), false));
                pass.failure = Some(failure);
                return pass;
            }
        }
    }
    pass
}

fn diff_limit(git: &Git, limit: u64) -> Option<Failure> {
    let verify_command = diff_limit_command(limit);
    let guidance = format!("Split the change into smaller edits of at most {limit} changed lines.");
    match git.diff_numstat() {
        Ok(stats) if stats.delta() <= limit => {
            debug!(delta = stats.delta(), limit, "diff within limit");
            None
        }
        Ok(stats) => Some(Failure {
            check: DIFF_LIMIT_CHECK.to_string(),
            signature: signature::diff_limit_exceeded(stats.delta()),
            output: format!(
                "{} lines changed across {} files (limit {limit})",
                stats.delta(),
                stats.files
            ),
            verify_command,
            guidance,
        }),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "diff limit check errored");
            Some(Failure {
                check: DIFF_LIMIT_CHECK.to_string(),
                signature: CHECK_ERROR.to_string(),
                output: format!("{err:#}"),
                verify_command,
                guidance,
            })
        }
    }
}

/// Re-runs the diff limit as a standalone verify command.
fn diff_limit_command(limit: u64) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("test \"$(git diff --numstat | awk '{{s += $1 + $2}} END {{print s + 0}}')\" -le {limit}"),
    ]
}

enum CheckOutcome {
    Passed,
    Skipped,
    Failed(Failure),
}

fn run_check<R: CheckRunner>(session: &Session, runner: &R, check: &CheckConfig) -> CheckOutcome {
    let config = &session.config;
    let request = CheckRequest::new(
        &check.command,
        session.root(),
        check.timeout(config.check_timeout_secs),
        config.output_limit_bytes,
    );
    let failure = |signature: String, output: String| Failure {
        check: check.name.clone(),
        signature,
        output,
        verify_command: check.verify_argv().to_vec(),
        guidance: check.guidance_text(),
    };

    match runner.run(&request) {
        Ok(run) if run.passed() => {
            debug!(check = %check.name, elapsed_ms = run.elapsed.as_millis() as u64, "check passed");
            CheckOutcome::Passed
        }
        Ok(run) if run.timed_out => {
            warn!(check = %check.name, timeout_secs = request.timeout.as_secs(), "check timed out");
            CheckOutcome::Failed(failure(
                CHECK_ERROR.to_string(),
                format!(
                    "timed out after {}s\n{}",
                    request.timeout.as_secs(),
                    run.combined_output()
                ),
            ))
        }
        Ok(run) => {
            let output = run.combined_output();
            // Validated on load; a bad pattern falls back to `<name>:fail`.
            let pattern = check.pattern().ok().flatten();
            let signature = signature::check_failure(&check.name, pattern.as_ref(), &output);
            info!(check = %check.name, exit_code = ?run.exit_code, signature = %signature, "check failed");
            CheckOutcome::Failed(failure(signature, output))
        }
        Err(err) if is_not_found(&err) && !check.required => {
            warn!(check = %check.name, command = %check.command.join(" "), "check program missing; skipping");
            CheckOutcome::Skipped
        }
        Err(err) => {
            warn!(check = %check.name, err = %format!("{err:#}"), "check errored");
            CheckOutcome::Failed(failure(CHECK_ERROR.to_string(), format!("{err:#}")))
        }
    }
}

fn accept(session: &Session, event: &HookEvent, report: &mut GateReport, now: DateTime<Utc>) {
    let store = session.store();
    let errors = &mut report.errors;
    keep(errors, "record pass pattern", record_pattern(store, GATE_PASS, Outcome::Success, now));
    let degraded = report.degraded;
    keep(
        errors,
        "update metrics",
        update_metrics(store, now, |metrics| metrics.record_gate_pass(now, degraded)),
    );
    report.task = keep(
        errors,
        "advance active task",
        tasks::record_gate_pass(session, &event.tool_name, now),
    )
    .flatten();
}

fn reject(
    session: &Session,
    event: &HookEvent,
    baseline: &mut Baseline,
    failure: Failure,
    touched: &[String],
    report: &mut GateReport,
    now: DateTime<Utc>,
) -> Result<()> {
    let store = session.store();
    let errors = &mut report.errors;

    keep(
        errors,
        "record failure pattern",
        record_pattern(store, &failure.signature, Outcome::Failure, now),
    );
    let recorded = keep(
        errors,
        "record incident",
        incidents::record(
            store,
            NewIncident {
                source: IncidentSource::QualityGate,
                source_tool: event.tool_name.clone(),
                classification: failure.check.clone(),
                signature: failure.signature.clone(),
                raw_context: json!({
                    "event": event.raw_context(),
                    "check": failure.check,
                    "output": tail(&failure.output, INCIDENT_OUTPUT_CHARS),
                    "touched": touched,
                    "baseline": baseline.snapshot_id(),
                }),
                suggested_fix: failure.guidance.clone(),
                verify_command: failure.verify_command.clone(),
                cwd: Some(session.root().display().to_string()),
            },
            now,
        ),
    );
    if let Some(recorded) = recorded {
        errors.extend(recorded.errors);
        report.incident_id = Some(recorded.incident_id);
        report.fix_task_id = recorded.fix_task_id;
    }
    keep(
        errors,
        "note failure on active task",
        tasks::record_gate_failure(session, &failure.signature, now),
    );

    // Restoring a baseline captured after the tool ran would be a no-op.
    let rollback = if report.baseline_pre_change {
        Some(baseline.rollback())
    } else {
        warn!("no pre-change baseline; rejected change left in place");
        None
    };
    let rolled_back = matches!(rollback, Some(Ok(_)));
    let incident_recorded = report.incident_id.is_some();
    keep(
        errors,
        "update metrics",
        update_metrics(store, now, |metrics| {
            metrics.record_gate_failure(now, &failure.check, rolled_back);
            if incident_recorded {
                metrics.record_incident();
            }
        }),
    );

    report.failed_check = Some(failure.check);
    report.failed_signature = Some(failure.signature);
    report.guidance = Some(failure.guidance);
    match rollback {
        None => Ok(()),
        Some(Ok(method)) => {
            report.rolled_back = true;
            report.rollback_method = Some(method);
            Ok(())
        }
        Some(Err(err)) => {
            error!(err = %err, root = %report.root, "rollback failed; workspace left unrestored");
            Err(err).context("quality gate rejected the change but rollback failed")
        }
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text.char_indices().nth(skip).map_or(0, |(idx, _)| idx);
    &text[start..]
}

/// Result of the pre-tool snapshot hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    pub snapshot_id: String,
    pub files: Vec<String>,
}

/// Capture the paths `event` is about to touch as a pending baseline.
#[instrument(skip_all, fields(tool = %event.tool_name))]
pub fn capture_pre_tool(session: &Session, event: &HookEvent, now: DateTime<Utc>) -> Result<SnapshotReport> {
    let root: &Path = session.root();
    let git = Git::detect(root);
    let touched = touched_paths(root, git.as_ref(), &event.tool_input);
    let captured = snapshot::capture(&session.paths.snapshots_dir, root, &touched, true, now)?;
    if let Err(err) = snapshot::prune(&session.paths.snapshots_dir, snapshot::KEEP_SNAPSHOTS) {
        warn!(err = %format!("{err:#}"), "snapshot prune failed");
    }
    Ok(SnapshotReport {
        snapshot_id: captured.manifest.id,
        files: captured
            .manifest
            .entries
            .into_iter()
            .map(|entry| entry.path)
            .collect(),
    })
}
