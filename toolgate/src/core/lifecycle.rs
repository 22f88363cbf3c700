//! Active-task state machine.
//!
//! `none -> active` on start, `active -> active` on each passing gate,
//! `active -> closed_success | closed_failed` on close. At most one task is
//! active; starting another while one is active is an error.

use crate::core::types::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Notes kept on a task; older notes are dropped first.
pub const MAX_NOTES: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {id} is already active: {goal}")]
    AlreadyActive { id: String, goal: String },
    #[error("no active task")]
    NoActiveTask,
    #[error("task goal is empty")]
    EmptyGoal,
}

/// Optional rule closing a task after repeated passing gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoClosePolicy {
    pub min_passes: u32,
    /// Seconds since the last gate failure before auto-close is allowed.
    pub quiet_secs: u64,
}

impl Default for AutoClosePolicy {
    fn default() -> Self {
        Self {
            min_passes: 3,
            quiet_secs: 600,
        }
    }
}

/// Line in `tasks.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        task: Task,
    },
    Progress {
        task_id: String,
        at: DateTime<Utc>,
        progress: f64,
        tool_name: String,
    },
    Closed {
        task: Task,
        duration_secs: f64,
    },
}

pub fn start(
    active: Option<&Task>,
    id: String,
    goal: &str,
    now: DateTime<Utc>,
) -> Result<Task, TaskError> {
    if let Some(current) = active {
        return Err(TaskError::AlreadyActive {
            id: current.id.clone(),
            goal: current.goal.clone(),
        });
    }
    let goal = goal.trim();
    if goal.is_empty() {
        return Err(TaskError::EmptyGoal);
    }
    Ok(Task {
        id,
        goal: goal.to_string(),
        started_at: now,
        progress: 0.0,
        status: TaskStatus::Active,
        closed_at: None,
        note: String::new(),
        progress_events: 0,
        blocked: false,
        confidence: 1.0,
        notes: Vec::new(),
        last_gate_fail_at: None,
    })
}

/// Apply a passing gate: progress grows by `step`, capped at 1.
///
/// A gate pass also clears a tool-failure block.
pub fn advance(task: &mut Task, step: f64) {
    let step = if step.is_finite() { step.max(0.0) } else { 0.0 };
    task.progress = (task.progress + step).min(1.0);
    task.progress_events += 1;
    task.blocked = false;
}

pub fn add_note(task: &mut Task, note: String) {
    task.notes.push(note);
    if task.notes.len() > MAX_NOTES {
        let excess = task.notes.len() - MAX_NOTES;
        task.notes.drain(..excess);
    }
}

pub fn record_gate_failure(task: &mut Task, signature: &str, now: DateTime<Utc>) {
    task.last_gate_fail_at = Some(now);
    add_note(task, format!("quality_gate_fail:{signature}"));
}

/// Mark the task blocked by a tool failure and lower its confidence.
pub fn block(task: &mut Task, penalty: f64) {
    task.blocked = true;
    task.confidence = (task.confidence - penalty).clamp(0.0, 1.0);
}

/// Close `task`, returning the closed record and its duration in seconds.
pub fn close(mut task: Task, success: bool, note: &str, now: DateTime<Utc>) -> (Task, f64) {
    task.status = if success {
        TaskStatus::ClosedSuccess
    } else {
        TaskStatus::ClosedFailed
    };
    task.closed_at = Some(now);
    task.note = note.trim().to_string();
    let duration_secs = (now - task.started_at).num_milliseconds().max(0) as f64 / 1000.0;
    (task, duration_secs)
}

pub fn should_auto_close(task: &Task, policy: &AutoClosePolicy, now: DateTime<Utc>) -> bool {
    if task.progress_events < policy.min_passes {
        return false;
    }
    match task.last_gate_fail_at {
        Some(failed_at) => (now - failed_at).num_seconds() > policy.quiet_secs as i64,
        None => true,
    }
}
