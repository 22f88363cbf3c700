//! Self-healer: turns a failed tool invocation into an incident and fix task.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::classifier::{self, IncidentClass};
use crate::core::fix_plan::{PlanInputs, render_plan};
use crate::core::types::{IncidentSource, Outcome};
use crate::incidents::{self, NewIncident};
use crate::io::event::HookEvent;
use crate::io::state::{record_pattern, update_metrics};
use crate::session::{Session, keep};
use crate::tasks;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HealOutcome {
    /// The tool invocation did not fail.
    NoFailure,
    Incident {
        classification: IncidentClass,
        signature: String,
        /// `None` if the incident could not be written.
        incident_id: Option<String>,
        fix_task_id: Option<String>,
        suggested_fix: String,
        verify_command: Vec<String>,
        /// Confidence of the active task after the penalty.
        #[serde(skip_serializing_if = "Option::is_none")]
        task_confidence: Option<f64>,
        /// State writes that failed; the rest were still attempted.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        errors: Vec<String>,
    },
}

/// Classify a failed tool invocation and record it.
///
/// Only an unrenderable fix plan is an error. State write failures are
/// collected on the outcome and the remaining writes still run.
#[instrument(skip_all, fields(tool = %event.tool_name))]
pub fn heal(session: &Session, event: &HookEvent, now: DateTime<Utc>) -> Result<HealOutcome> {
    if !classifier::response_failed(&event.tool_response) {
        debug!("tool invocation succeeded; nothing to heal");
        return Ok(HealOutcome::NoFailure);
    }
    let store = session.store();
    let text = event.tool_response.error_text();
    let classification = classifier::classify(&text);
    let signature = classifier::incident_signature(classification, &text);
    let root = session.root().display().to_string();

    let plan = render_plan(
        classification,
        &session.config.fix_plans,
        &PlanInputs {
            target: event.target_path().map(str::to_string),
            cwd: root.clone(),
            module: classifier::python_module(&text),
            tool_name: event.tool_name.clone(),
        },
    )?;

    let mut errors = Vec::new();
    let recorded = keep(
        &mut errors,
        "record incident",
        incidents::record(
            store,
            NewIncident {
                source: IncidentSource::SelfHeal,
                source_tool: event.tool_name.clone(),
                classification: classification.as_str().to_string(),
                signature: signature.clone(),
                raw_context: event.raw_context(),
                suggested_fix: plan.suggested_fix.clone(),
                verify_command: plan.verify_command.clone(),
                cwd: Some(root),
            },
            now,
        ),
    );
    let (incident_id, fix_task_id) = match recorded {
        Some(recorded) => {
            errors.extend(recorded.errors);
            (Some(recorded.incident_id), recorded.fix_task_id)
        }
        None => (None, None),
    };

    keep(
        &mut errors,
        "record incident pattern",
        record_pattern(store, &classification.pattern_signature(), Outcome::Failure, now),
    );
    if incident_id.is_some() {
        keep(
            &mut errors,
            "update metrics",
            update_metrics(store, now, |metrics| metrics.record_incident()),
        );
    }
    let blocker = incident_id.as_deref().unwrap_or(signature.as_str());
    let task_confidence = keep(
        &mut errors,
        "block active task",
        tasks::block_active(session, blocker),
    )
    .flatten();

    Ok(HealOutcome::Incident {
        classification,
        signature,
        incident_id,
        fix_task_id,
        suggested_fix: plan.suggested_fix,
        verify_command: plan.verify_command,
        task_confidence,
        errors,
    })
}
