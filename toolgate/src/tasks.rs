//! Active-task commands and the task side of gate and heal events.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::ids::new_id;
use crate::core::lifecycle::{self, TaskError, TaskEvent};
use crate::core::types::{Task, TaskStatus};
use crate::io::state::{append_task_event, load_active_task, modify_active_task, update_metrics};
use crate::io::store::StateStore;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTask {
    pub task: Task,
    pub duration_secs: f64,
}

/// Start a task. Fails with [`TaskError::AlreadyActive`] if one is active,
/// leaving it untouched.
#[instrument(skip_all)]
pub fn start_task(session: &Session, goal: &str, now: DateTime<Utc>) -> Result<Task> {
    let store = session.store();
    let task = modify_active_task(store, |active| {
        let task = lifecycle::start(active.as_ref(), new_id("task", now), goal, now)?;
        Ok((Some(task.clone()), task))
    })?;
    append_task_event(store, &TaskEvent::Started { task: task.clone() })?;
    info!(task = %task.id, "task started");
    Ok(task)
}

/// Close the active task.
#[instrument(skip_all, fields(success))]
pub fn close_task(
    session: &Session,
    success: bool,
    note: &str,
    now: DateTime<Utc>,
) -> Result<ClosedTask> {
    let store = session.store();
    let (task, duration_secs) = modify_active_task(store, |active| {
        let task = active.ok_or(TaskError::NoActiveTask)?;
        Ok((None, lifecycle::close(task, success, note, now)))
    })?;
    finish_close(store, task, duration_secs, now)
}

fn finish_close(
    store: &dyn StateStore,
    task: Task,
    duration_secs: f64,
    now: DateTime<Utc>,
) -> Result<ClosedTask> {
    append_task_event(
        store,
        &TaskEvent::Closed {
            task: task.clone(),
            duration_secs,
        },
    )?;
    let success = task.status == TaskStatus::ClosedSuccess;
    update_metrics(store, now, |metrics| {
        metrics.record_task_close(success, duration_secs);
    })?;
    info!(task = %task.id, success, duration_secs, "task closed");
    Ok(ClosedTask {
        task,
        duration_secs,
    })
}

pub fn show_task(session: &Session) -> Option<Task> {
    load_active_task(session.store())
}

/// What a passing gate did to the active task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatePassEffect {
    pub task_id: String,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_closed: Option<ClosedTask>,
}

/// Advance the active task after a passing gate, auto-closing it when the
/// configured policy allows. `None` when no task is active.
pub fn record_gate_pass(
    session: &Session,
    tool_name: &str,
    now: DateTime<Utc>,
) -> Result<Option<GatePassEffect>> {
    let store = session.store();
    let step = session.config.progress_step;
    let policy = session.config.auto_close;
    let advanced = modify_active_task(store, |active| {
        let Some(mut task) = active else {
            return Ok((None, None));
        };
        lifecycle::advance(&mut task, step);
        let snapshot = task.clone();
        if let Some(policy) = &policy
            && lifecycle::should_auto_close(&task, policy, now)
        {
            let closed = lifecycle::close(task, true, "auto-closed after passing gates", now);
            return Ok((None, Some((snapshot, Some(closed)))));
        }
        Ok((Some(task), Some((snapshot, None))))
    })?;
    let Some((task, closed)) = advanced else {
        return Ok(None);
    };

    append_task_event(
        store,
        &TaskEvent::Progress {
            task_id: task.id.clone(),
            at: now,
            progress: task.progress,
            tool_name: tool_name.to_string(),
        },
    )?;
    update_metrics(store, now, |metrics| metrics.record_task_progress())?;

    let auto_closed = match closed {
        Some((closed, duration_secs)) => Some(finish_close(store, closed, duration_secs, now)?),
        None => None,
    };
    Ok(Some(GatePassEffect {
        task_id: task.id,
        progress: task.progress,
        auto_closed,
    }))
}

/// Note a gate failure on the active task. Returns the task id if one was active.
pub fn record_gate_failure(
    session: &Session,
    signature: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    modify_active_task(session.store(), |active| {
        let Some(mut task) = active else {
            return Ok((None, None));
        };
        lifecycle::record_gate_failure(&mut task, signature, now);
        let id = task.id.clone();
        Ok((Some(task), Some(id)))
    })
}

/// Block the active task after a tool failure, lowering its confidence.
pub fn block_active(session: &Session, incident_id: &str) -> Result<Option<f64>> {
    let penalty = session.config.confidence_penalty;
    modify_active_task(session.store(), |active| {
        let Some(mut task) = active else {
            return Ok((None, None));
        };
        lifecycle::block(&mut task, penalty);
        lifecycle::add_note(&mut task, format!("blocked_by:{incident_id}"));
        let confidence = task.confidence;
        Ok((Some(task), Some(confidence)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lifecycle::AutoClosePolicy;
    use crate::io::config::ToolgateConfig;
    use crate::io::init::StatePaths;
    use crate::io::state::{load_metrics, load_task_events};
    use crate::io::store::MemoryStore;

    fn session(config: ToolgateConfig) -> Session {
        Session::with_store(
            StatePaths::with_state_dir("/work", "/work/.toolgate"),
            config,
            MemoryStore::default(),
        )
    }

    #[test]
    fn start_while_active_fails_and_keeps_the_active_task() {
        let session = session(ToolgateConfig::default());
        let now = Utc::now();
        let first = start_task(&session, "first", now).expect("start");

        let err = start_task(&session, "second", now).expect_err("already active");
        assert!(matches!(
            err.downcast_ref::<TaskError>(),
            Some(TaskError::AlreadyActive { .. })
        ));
        assert_eq!(show_task(&session), Some(first));
        assert_eq!(load_task_events(session.store()).len(), 1);
    }

    #[test]
    fn close_without_active_task_fails() {
        let session = session(ToolgateConfig::default());
        let err = close_task(&session, true, "", Utc::now()).expect_err("none active");
        assert_eq!(err.downcast_ref::<TaskError>(), Some(&TaskError::NoActiveTask));
    }

    #[test]
    fn close_updates_metrics_and_clears_pointer() {
        let session = session(ToolgateConfig::default());
        let started = Utc::now();
        start_task(&session, "ship", started).expect("start");
        let closed = close_task(&session, false, "abandoned", started + chrono::Duration::seconds(30))
            .expect("close");

        assert_eq!(closed.task.status, TaskStatus::ClosedFailed);
        assert_eq!(closed.duration_secs, 30.0);
        assert_eq!(show_task(&session), None);

        let metrics = load_metrics(session.store());
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.success_rate, 0.0);
    }

    #[test]
    fn gate_pass_without_task_is_a_no_op() {
        let session = session(ToolgateConfig::default());
        assert_eq!(record_gate_pass(&session, "Edit", Utc::now()).expect("pass"), None);
        assert_eq!(load_metrics(session.store()).task_progress_events, 0);
    }

    #[test]
    fn gate_passes_auto_close_when_configured() {
        let session = session(ToolgateConfig {
            auto_close: Some(AutoClosePolicy {
                min_passes: 2,
                quiet_secs: 600,
            }),
            ..ToolgateConfig::default()
        });
        let now = Utc::now();
        start_task(&session, "ship", now).expect("start");

        let first = record_gate_pass(&session, "Edit", now)
            .expect("pass")
            .expect("active");
        assert!(first.auto_closed.is_none());
        let second = record_gate_pass(&session, "Edit", now)
            .expect("pass")
            .expect("active");
        let closed = second.auto_closed.expect("auto closed");
        assert_eq!(closed.task.status, TaskStatus::ClosedSuccess);
        assert_eq!(show_task(&session), None);
        assert_eq!(load_metrics(session.store()).tasks_successful, 1);
    }

    #[test]
    fn block_lowers_confidence_and_gate_failure_adds_note() {
        let session = session(ToolgateConfig {
            confidence_penalty: 0.25,
            ..ToolgateConfig::default()
        });
        let now = Utc::now();
        start_task(&session, "ship", now).expect("start");

        assert_eq!(block_active(&session, "inc_1").expect("block"), Some(0.75));
        record_gate_failure(&session, "lint:F401", now).expect("note");

        let task = show_task(&session).expect("active");
        assert!(task.blocked);
        assert!(task.notes.contains(&"quality_gate_fail:lint:F401".to_string()));
        assert_eq!(task.last_gate_fail_at, Some(now));
    }
}
