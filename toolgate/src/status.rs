//! Read-only status view for operators.

use serde::Serialize;
use tracing::warn;

use crate::core::fix_queue::QueueStats;
use crate::core::metrics::Metrics;
use crate::core::patterns::PatternCounter;
use crate::core::types::{IncidentStatus, Task};
use crate::io::snapshot;
use crate::io::state::{load_active_task, load_fix_queue, load_incidents, load_metrics, load_patterns};
use crate::session::Session;

const TOP_FAILURES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSummary {
    pub signature: String,
    #[serde(flatten)]
    pub counter: PatternCounter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub root: String,
    pub state_dir: String,
    pub active_task: Option<Task>,
    pub metrics: Metrics,
    pub fix_queue: QueueStats,
    /// Incidents whose fix task could not be created.
    pub unlinked_incidents: usize,
    pub pending_snapshots: usize,
    pub top_failures: Vec<FailureSummary>,
}

pub fn status(session: &Session) -> StatusReport {
    let store = session.store();
    let patterns = load_patterns(store);
    let pending_snapshots = match snapshot::list(&session.paths.snapshots_dir) {
        Ok(manifests) => manifests.iter().filter(|m| m.pending).count(),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "snapshots unreadable");
            0
        }
    };
    StatusReport {
        root: session.root().display().to_string(),
        state_dir: session.paths.state_dir.display().to_string(),
        active_task: load_active_task(store),
        metrics: load_metrics(store),
        fix_queue: load_fix_queue(store).stats(),
        unlinked_incidents: load_incidents(store)
            .iter()
            .filter(|incident| incident.status == IncidentStatus::Open)
            .count(),
        pending_snapshots,
        top_failures: patterns
            .top_failures(TOP_FAILURES)
            .into_iter()
            .map(|(signature, counter)| FailureSummary {
                signature: signature.to_string(),
                counter: counter.clone(),
            })
            .collect(),
    }
}
