//! Shared deterministic types for toolgate core logic.
//!
//! These records are the on-disk contracts between independent hook
//! invocations. Field names are part of the persisted layout and must stay
//! stable; new fields must carry `#[serde(default)]` so older records load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome attached to a learned pattern event.
///
/// `Neutral` events are logged but carry no outcome: they bump `total` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Where an incident was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSource {
    QualityGate,
    SelfHeal,
}

/// Incident lifecycle. Only `status` may change after an incident is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Linked,
}

/// A recorded, classified failure event (`incidents.jsonl`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: IncidentSource,
    /// Tool whose invocation produced the failure (`unknown_tool` if absent).
    pub source_tool: String,
    /// Taxonomy class for self-heal incidents, failing check name for gate incidents.
    pub classification: String,
    /// Most specific signature known for this failure (e.g. `lint:F401`).
    #[serde(default)]
    pub signature: String,
    /// Tool input/response and check output captured at failure time.
    #[serde(default)]
    pub raw_context: Value,
    #[serde(default)]
    pub fix_task_id: Option<String>,
    pub status: IncidentStatus,
}

/// Fix task processing state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    Pending,
    Attempted,
    Completed,
    Failed,
}

impl FixStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FixStatus::Pending => "pending",
            FixStatus::Attempted => "attempted",
            FixStatus::Completed => "completed",
            FixStatus::Failed => "failed",
        }
    }
}

/// Result of running a fix task's verify command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixResult {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_secs: f64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Set when the verify command could not be run at all.
    #[serde(default)]
    pub error: Option<String>,
}

/// An actionable, deterministically re-verifiable follow-up to an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixTask {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub incident_id: String,
    /// Signature of the originating incident.
    #[serde(default)]
    pub signature: String,
    pub suggested_fix: String,
    /// Side-effect free; exit code 0 is the only success signal.
    pub verify_command: Vec<String>,
    /// Working directory the verify command runs in.
    #[serde(default)]
    pub cwd: Option<String>,
    pub status: FixStatus,
    pub attempts: u32,
    #[serde(default)]
    pub last_result: Option<FixResult>,
}

/// Work item lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    ClosedSuccess,
    ClosedFailed,
}

/// The single in-flight work item (`active_task.json`) and its closed form
/// in `tasks.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal: String,
    pub started_at: DateTime<Utc>,
    /// Fraction in `[0, 1]`. Never decreases.
    pub progress: f64,
    pub status: TaskStatus,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub progress_events: u32,
    /// Set by tool-failure incidents, cleared by the next passing gate.
    #[serde(default)]
    pub blocked: bool,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub last_gate_fail_at: Option<DateTime<Utc>>,
}

fn full_confidence() -> f64 {
    1.0
}

/// Outcome fields of an externally observed tool invocation.
///
/// Every field is optional on the wire; absent fields mean "unknown", never failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: Option<bool>,
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: String,
}

impl ToolResponse {
    /// Concatenated error-bearing text used for classification.
    pub fn error_text(&self) -> String {
        [
            self.error.as_str(),
            self.stderr.as_str(),
            self.stdout.as_str(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
    }
}
