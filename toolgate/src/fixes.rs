//! Verification-only fix queue processing.
//!
//! Processing never edits the workspace: it re-runs the stored verify
//! command of the oldest pending task and records the verdict.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::fix_queue::QueueStats;
use crate::core::signature::{FIX_COMPLETED, FIX_FAILED};
use crate::core::types::{FixResult, FixStatus, FixTask, Outcome};
use crate::io::checks::{CheckRequest, CheckRunner};
use crate::io::state::{append_fix_events, load_fix_queue, record_pattern, update_metrics};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProcessOutcome {
    NoPendingTask,
    Processed {
        task_id: String,
        incident_id: String,
        status: FixStatus,
        attempts: u32,
        verify_result: FixResult,
    },
}

pub fn queue_stats(session: &Session) -> QueueStats {
    load_fix_queue(session.store()).stats()
}

/// Process the oldest pending fix task.
///
/// The task is marked `attempted` under the queue lock before the verify
/// command runs, so a crash mid-run leaves it attempted rather than pending.
#[instrument(skip_all)]
pub fn process_one_task<R: CheckRunner>(
    session: &Session,
    runner: &R,
    now: DateTime<Utc>,
) -> Result<ProcessOutcome> {
    let store = session.store();
    let picked = append_fix_events(store, |queue| match queue.next_pending() {
        None => Ok((Vec::new(), None)),
        Some(task) => {
            let event = queue.transition(&task.id, FixStatus::Attempted, now, None)?;
            let mut task = task.clone();
            task.status = FixStatus::Attempted;
            task.attempts += 1;
            Ok((vec![event], Some(task)))
        }
    })?;
    let Some(task) = picked else {
        info!("no pending fix task");
        return Ok(ProcessOutcome::NoPendingTask);
    };
    info!(task = %task.id, incident = %task.incident_id, "verifying fix task");

    let result = verify(session, runner, &task);
    let success = result.exit_code == Some(0) && !result.timed_out && result.error.is_none();
    let status = if success {
        FixStatus::Completed
    } else {
        FixStatus::Failed
    };
    let finished = now + chrono::Duration::milliseconds((result.duration_secs * 1000.0) as i64);
    let duration_secs = result.duration_secs;

    append_fix_events(store, |queue| {
        let event = queue.transition(&task.id, status, finished, Some(result.clone()))?;
        Ok((vec![event], ()))
    })?;
    update_metrics(store, finished, |metrics| {
        metrics.record_fix_verification(success, duration_secs);
    })?;
    let (signature, outcome) = if success {
        (FIX_COMPLETED, Outcome::Success)
    } else {
        (FIX_FAILED, Outcome::Failure)
    };
    record_pattern(store, signature, outcome, finished)?;
    info!(task = %task.id, status = status.as_str(), "fix task processed");

    Ok(ProcessOutcome::Processed {
        task_id: task.id,
        incident_id: task.incident_id,
        status,
        attempts: task.attempts,
        verify_result: result,
    })
}

fn verify<R: CheckRunner>(session: &Session, runner: &R, task: &FixTask) -> FixResult {
    let config = &session.config;
    let workdir = task
        .cwd
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| session.root().to_path_buf());
    let request = CheckRequest::new(
        &task.verify_command,
        &workdir,
        Duration::from_secs(config.check_timeout_secs),
        config.output_limit_bytes,
    );
    match runner.run(&request) {
        Ok(run) => FixResult {
            exit_code: run.exit_code,
            timed_out: run.timed_out,
            duration_secs: run.elapsed.as_secs_f64(),
            stdout: run.stdout,
            stderr: run.stderr,
            error: None,
        },
        Err(err) => {
            warn!(task = %task.id, err = %format!("{err:#}"), "verify command could not run");
            FixResult {
                exit_code: None,
                timed_out: false,
                duration_secs: 0.0,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("{err:#}")),
            }
        }
    }
}
