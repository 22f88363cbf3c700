//! Incident and fix-task creation shared by the gate and the self-healer.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::core::fix_queue::FixEvent;
use crate::core::ids::new_id;
use crate::core::types::{FixStatus, FixTask, Incident, IncidentSource, IncidentStatus};
use crate::io::state::{append_fix_events, append_incident};
use crate::io::store::StateStore;

/// Everything known about a failure at the moment it is recorded.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub source: IncidentSource,
    pub source_tool: String,
    pub classification: String,
    pub signature: String,
    pub raw_context: Value,
    pub suggested_fix: String,
    pub verify_command: Vec<String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedIncident {
    pub incident_id: String,
    /// `None` if the fix task could not be written; the incident stays open.
    pub fix_task_id: Option<String>,
    pub errors: Vec<String>,
}

/// Write one pending fix task and the incident that links to it.
///
/// The fix task goes first so a linked incident never points at a task that
/// does not exist. A failed fix-task write is reported, not propagated; a
/// failed incident write is propagated.
pub fn record(store: &dyn StateStore, new: NewIncident, now: DateTime<Utc>) -> Result<RecordedIncident> {
    let incident_id = new_id("inc", now);
    let fix_task_id = new_id("fix", now);
    let mut errors = Vec::new();

    let task = FixTask {
        id: fix_task_id.clone(),
        timestamp: now,
        incident_id: incident_id.clone(),
        signature: new.signature.clone(),
        suggested_fix: new.suggested_fix,
        verify_command: new.verify_command,
        cwd: new.cwd,
        status: FixStatus::Pending,
        attempts: 0,
        last_result: None,
    };
    let fix_task_id = match append_fix_events(store, |_| {
        Ok((vec![FixEvent::Created { task: task.clone() }], ()))
    }) {
        Ok(()) => Some(fix_task_id),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "fix task not written");
            errors.push(format!("create fix task: {err:#}"));
            None
        }
    };

    let incident = Incident {
        id: incident_id.clone(),
        timestamp: now,
        source: new.source,
        source_tool: new.source_tool,
        classification: new.classification,
        signature: new.signature,
        raw_context: new.raw_context,
        fix_task_id: fix_task_id.clone(),
        status: if fix_task_id.is_some() {
            IncidentStatus::Linked
        } else {
            IncidentStatus::Open
        },
    };
    append_incident(store, &incident)?;
    info!(
        incident = %incident.id,
        fix_task = ?incident.fix_task_id,
        classification = %incident.classification,
        "incident recorded"
    );

    Ok(RecordedIncident {
        incident_id,
        fix_task_id,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::state::{load_fix_queue, load_incidents};
    use crate::io::store::MemoryStore;

    fn new_incident() -> NewIncident {
        NewIncident {
            source: IncidentSource::QualityGate,
            source_tool: "Edit".to_string(),
            classification: "lint".to_string(),
            signature: "lint:F401".to_string(),
            raw_context: Value::Null,
            suggested_fix: "remove the import".to_string(),
            verify_command: vec!["ruff".to_string(), "check".to_string()],
            cwd: Some("/work".to_string()),
        }
    }

    #[test]
    fn incident_links_one_pending_fix_task() {
        let store = MemoryStore::default();
        let recorded = record(&store, new_incident(), Utc::now()).expect("record");

        let incidents = load_incidents(&store);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, IncidentStatus::Linked);
        assert_eq!(incidents[0].fix_task_id, recorded.fix_task_id);

        let queue = load_fix_queue(&store);
        assert_eq!(queue.tasks().len(), 1);
        let task = &queue.tasks()[0];
        assert_eq!(task.status, FixStatus::Pending);
        assert_eq!(task.incident_id, recorded.incident_id);
        assert_eq!(task.signature, "lint:F401");
        assert!(recorded.errors.is_empty());
    }

    #[test]
    fn repeated_failures_are_not_coalesced() {
        let store = MemoryStore::default();
        let now = Utc::now();
        let first = record(&store, new_incident(), now).expect("first");
        let second = record(&store, new_incident(), now).expect("second");
        assert_ne!(first.incident_id, second.incident_id);
        assert_eq!(load_fix_queue(&store).stats().pending, 2);
    }
}
