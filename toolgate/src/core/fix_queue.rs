//! Fix-task queue folded from an append-only event log.
//!
//! `fix_queue.jsonl` holds task creations and status transitions. The current
//! queue is the fold of those events; a transition is only ever appended after
//! it has been validated against the folded state.

use crate::core::types::{FixResult, FixStatus, FixTask};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Line in `fix_queue.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FixEvent {
    Created {
        task: FixTask,
    },
    Transition {
        id: String,
        status: FixStatus,
        at: DateTime<Utc>,
        #[serde(default)]
        result: Option<FixResult>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FixTransitionError {
    #[error("unknown fix task {0}")]
    UnknownTask(String),
    #[error("fix task {id} cannot move from {} to {}", from.as_str(), to.as_str())]
    Illegal {
        id: String,
        from: FixStatus,
        to: FixStatus,
    },
    #[error("fix task {0} already exists")]
    Duplicate(String),
}

/// Forward-only transitions: `pending -> attempted -> completed | failed`.
pub fn can_transition(from: FixStatus, to: FixStatus) -> bool {
    matches!(
        (from, to),
        (FixStatus::Pending, FixStatus::Attempted)
            | (FixStatus::Attempted, FixStatus::Completed)
            | (FixStatus::Attempted, FixStatus::Failed)
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixQueue {
    tasks: Vec<FixTask>,
}

impl FixQueue {
    /// Fold a log, skipping events that do not apply (duplicates or
    /// out-of-order transitions left by a torn write).
    pub fn fold<I: IntoIterator<Item = FixEvent>>(events: I) -> Self {
        let mut queue = Self::default();
        for event in events {
            let _ = queue.apply(event);
        }
        queue
    }

    pub fn tasks(&self) -> &[FixTask] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&FixTask> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn apply(&mut self, event: FixEvent) -> Result<(), FixTransitionError> {
        match event {
            FixEvent::Created { task } => {
                if self.get(&task.id).is_some() {
                    return Err(FixTransitionError::Duplicate(task.id));
                }
                self.tasks.push(task);
            }
            FixEvent::Transition {
                id, status, result, ..
            } => {
                let task = self
                    .tasks
                    .iter_mut()
                    .find(|task| task.id == id)
                    .ok_or_else(|| FixTransitionError::UnknownTask(id.clone()))?;
                if !can_transition(task.status, status) {
                    return Err(FixTransitionError::Illegal {
                        id,
                        from: task.status,
                        to: status,
                    });
                }
                task.status = status;
                if status == FixStatus::Attempted {
                    task.attempts += 1;
                }
                if result.is_some() {
                    task.last_result = result;
                }
            }
        }
        Ok(())
    }

    /// Build a validated transition event for task `id`.
    pub fn transition(
        &self,
        id: &str,
        to: FixStatus,
        at: DateTime<Utc>,
        result: Option<FixResult>,
    ) -> Result<FixEvent, FixTransitionError> {
        let task = self
            .get(id)
            .ok_or_else(|| FixTransitionError::UnknownTask(id.to_string()))?;
        if !can_transition(task.status, to) {
            return Err(FixTransitionError::Illegal {
                id: id.to_string(),
                from: task.status,
                to,
            });
        }
        Ok(FixEvent::Transition {
            id: id.to_string(),
            status: to,
            at,
            result,
        })
    }

    /// Oldest pending task by creation time.
    pub fn next_pending(&self) -> Option<&FixTask> {
        self.tasks
            .iter()
            .filter(|task| task.status == FixStatus::Pending)
            .min_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in &self.tasks {
            match task.status {
                FixStatus::Pending => stats.pending += 1,
                FixStatus::Attempted => stats.attempted += 1,
                FixStatus::Completed => stats.completed += 1,
                FixStatus::Failed => stats.failed += 1,
            }
            stats.total += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(id: &str, timestamp: DateTime<Utc>) -> FixTask {
        FixTask {
            id: id.to_string(),
            timestamp,
            incident_id: format!("inc_{id}"),
            signature: "lint:F401".to_string(),
            suggested_fix: "remove import".to_string(),
            verify_command: vec!["true".to_string()],
            cwd: None,
            status: FixStatus::Pending,
            attempts: 0,
            last_result: None,
        }
    }

    fn result(exit_code: i32) -> FixResult {
        FixResult {
            exit_code: Some(exit_code),
            timed_out: false,
            duration_secs: 0.5,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        }
    }

    #[test]
    fn transitions_only_move_forward() {
        use FixStatus::{Attempted, Completed, Failed, Pending};
        assert!(can_transition(Pending, Attempted));
        assert!(can_transition(Attempted, Completed));
        assert!(can_transition(Attempted, Failed));
        assert!(!can_transition(Attempted, Pending));
        assert!(!can_transition(Pending, Completed));
        assert!(!can_transition(Completed, Attempted));
        assert!(!can_transition(Failed, Attempted));
    }

    #[test]
    fn next_pending_is_oldest() {
        let now = Utc::now();
        let queue = FixQueue::fold([
            FixEvent::Created {
                task: task("b", now),
            },
            FixEvent::Created {
                task: task("a", now - Duration::seconds(5)),
            },
        ]);
        assert_eq!(queue.next_pending().map(|t| t.id.as_str()), Some("a"));
    }

    #[test]
    fn fold_applies_transitions_and_attempts() {
        let now = Utc::now();
        let mut queue = FixQueue::fold([FixEvent::Created {
            task: task("a", now),
        }]);

        let attempted = queue
            .transition("a", FixStatus::Attempted, now, None)
            .expect("attempt");
        queue.apply(attempted).expect("apply");
        let completed = queue
            .transition("a", FixStatus::Completed, now, Some(result(0)))
            .expect("complete");
        queue.apply(completed).expect("apply");

        let task = queue.get("a").expect("task");
        assert_eq!(task.status, FixStatus::Completed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_result, Some(result(0)));
        assert!(queue.next_pending().is_none());
    }

    #[test]
    fn finished_tasks_cannot_be_reprocessed() {
        let now = Utc::now();
        let mut done = task("a", now);
        done.status = FixStatus::Failed;
        let queue = FixQueue::fold([FixEvent::Created { task: done }]);

        let err = queue
            .transition("a", FixStatus::Attempted, now, None)
            .expect_err("illegal");
        assert_eq!(
            err,
            FixTransitionError::Illegal {
                id: "a".to_string(),
                from: FixStatus::Failed,
                to: FixStatus::Attempted,
            }
        );
        assert!(matches!(
            queue.transition("zz", FixStatus::Attempted, now, None),
            Err(FixTransitionError::UnknownTask(_))
        ));
    }

    #[test]
    fn fold_skips_invalid_events() {
        let now = Utc::now();
        let queue = FixQueue::fold([
            FixEvent::Created {
                task: task("a", now),
            },
            FixEvent::Created {
                task: task("a", now),
            },
            FixEvent::Transition {
                id: "a".to_string(),
                status: FixStatus::Completed,
                at: now,
                result: None,
            },
        ]);
        assert_eq!(queue.tasks().len(), 1);
        assert_eq!(queue.tasks()[0].status, FixStatus::Pending);
    }

    #[test]
    fn stats_count_each_status() {
        let now = Utc::now();
        let mut failed = task("c", now);
        failed.status = FixStatus::Failed;
        let queue = FixQueue::fold([
            FixEvent::Created {
                task: task("a", now),
            },
            FixEvent::Created {
                task: task("b", now),
            },
            FixEvent::Created { task: failed },
        ]);
        assert_eq!(
            queue.stats(),
            QueueStats {
                pending: 2,
                attempted: 0,
                completed: 0,
                failed: 1,
                total: 3,
            }
        );
    }
}
