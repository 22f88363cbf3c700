//! Aggregate execution metrics (`metrics.json`).
//!
//! The record is only ever changed through the `record_*` operations below;
//! derived fields are recomputed on every write, never edited directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Current on-disk layout version. Older layouts are migrated by [`migrate`].
pub const METRICS_SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub version: u64,
    pub created: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,

    /// Verification runs; always `gate_passes + gate_failures`.
    pub runs: u64,
    pub gate_passes: u64,
    pub gate_failures: u64,
    /// Passing runs where at least one check was skipped (missing tool).
    pub degraded_runs: u64,
    pub rollback_count: u64,
    pub last_failed_check: Option<String>,
    pub last_run: Option<DateTime<Utc>>,

    pub incidents_total: u64,
    pub incidents_open: u64,
    pub fixes_completed: u64,
    pub fixes_failed: u64,
    pub mean_time_to_verify_fix: Option<f64>,

    pub tasks_completed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub task_progress_events: u64,
    /// `tasks_successful / tasks_completed`, `0.0` before the first close.
    pub success_rate: f64,
    pub mean_time_to_close_task: Option<f64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            version: METRICS_SCHEMA_VERSION,
            created: None,
            last_updated: None,
            runs: 0,
            gate_passes: 0,
            gate_failures: 0,
            degraded_runs: 0,
            rollback_count: 0,
            last_failed_check: None,
            last_run: None,
            incidents_total: 0,
            incidents_open: 0,
            fixes_completed: 0,
            fixes_failed: 0,
            mean_time_to_verify_fix: None,
            tasks_completed: 0,
            tasks_successful: 0,
            tasks_failed: 0,
            task_progress_events: 0,
            success_rate: 0.0,
            mean_time_to_close_task: None,
        }
    }
}

impl Metrics {
    /// Count a passing verification run.
    pub fn record_gate_pass(&mut self, now: DateTime<Utc>, degraded: bool) {
        self.runs += 1;
        self.gate_passes += 1;
        if degraded {
            self.degraded_runs += 1;
        }
        self.last_run = Some(now);
    }

    /// Count a failing verification run. `rolled_back` is false when the
    /// rollback failed or there was no pre-change baseline to restore.
    pub fn record_gate_failure(&mut self, now: DateTime<Utc>, failed_check: &str, rolled_back: bool) {
        self.runs += 1;
        self.gate_failures += 1;
        if rolled_back {
            self.rollback_count += 1;
        }
        self.last_failed_check = Some(failed_check.to_string());
        self.last_run = Some(now);
    }

    pub fn record_incident(&mut self) {
        self.incidents_total += 1;
        self.incidents_open += 1;
    }

    /// Count a processed fix task. A completed fix closes one open incident.
    pub fn record_fix_verification(&mut self, success: bool, duration_secs: f64) {
        if success {
            self.fixes_completed += 1;
            self.incidents_open = self.incidents_open.saturating_sub(1);
        } else {
            self.fixes_failed += 1;
        }
        let verified = self.fixes_completed + self.fixes_failed;
        self.mean_time_to_verify_fix = Some(running_mean(
            self.mean_time_to_verify_fix,
            verified,
            duration_secs,
        ));
    }

    pub fn record_task_progress(&mut self) {
        self.task_progress_events += 1;
    }

    pub fn record_task_close(&mut self, success: bool, duration_secs: f64) {
        self.tasks_completed += 1;
        if success {
            self.tasks_successful += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.mean_time_to_close_task = Some(running_mean(
            self.mean_time_to_close_task,
            self.tasks_completed,
            duration_secs,
        ));
        self.refresh_derived();
    }

    /// Recompute derived statistics from the raw counters.
    pub fn refresh_derived(&mut self) {
        self.success_rate = if self.tasks_completed == 0 {
            0.0
        } else {
            self.tasks_successful as f64 / self.tasks_completed as f64
        };
    }

    /// Stamp bookkeeping timestamps before a write.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.created.is_none() {
            self.created = Some(now);
        }
        self.last_updated = Some(now);
        self.version = METRICS_SCHEMA_VERSION;
        self.refresh_derived();
    }
}

/// Mean over `count` samples given the mean of the first `count - 1`.
fn running_mean(current: Option<f64>, count: u64, sample: f64) -> f64 {
    match current {
        Some(mean) if count > 1 => (mean * (count - 1) as f64 + sample) / count as f64,
        _ => sample,
    }
}

/// Upgrade any known metrics layout to the current one.
///
/// Version 1 layouts carry a free-form string `version` and no pass/fail split
/// of `runs`; every failing run of that era was rolled back, so the split is
/// reconstructed from `rollback_count`.
pub fn migrate(mut value: Value) -> Result<Metrics, serde_json::Error> {
    let version = value.get("version").and_then(Value::as_u64).unwrap_or(1);
    if let Value::Object(map) = &mut value {
        if version < 2 {
            let runs = map.get("runs").and_then(Value::as_u64).unwrap_or(0);
            let rollbacks = map
                .get("rollback_count")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                .min(runs);
            map.entry("gate_failures").or_insert(json!(rollbacks));
            map.entry("gate_passes")
                .or_insert(json!(runs.saturating_sub(rollbacks)));
        }
        map.insert("version".to_string(), json!(METRICS_SCHEMA_VERSION));
    }
    let mut metrics: Metrics = serde_json::from_value(value)?;
    metrics.refresh_derived();
    Ok(metrics)
}
