//! Typed accessors over the raw state store.
//!
//! Readers never fail on bad data: a missing record is zero state, a corrupt
//! record is logged and treated as zero state, and a corrupt log line is
//! skipped on its own.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use super::store::{Record, StateStore};
use crate::core::fix_queue::{FixEvent, FixQueue};
use crate::core::lifecycle::TaskEvent;
use crate::core::metrics::{self, Metrics};
use crate::core::patterns::{self, PatternTable};
use crate::core::types::{Incident, Outcome, Task};

fn parse_value(record: Record, contents: Option<&str>) -> Option<Value> {
    let text = contents?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(record = record.file_name(), err = %err, "corrupt record, using zero state");
            None
        }
    }
}

fn decode_metrics(contents: Option<&str>) -> Metrics {
    let Some(value) = parse_value(Record::Metrics, contents) else {
        return Metrics::default();
    };
    metrics::migrate(value).unwrap_or_else(|err| {
        warn!(err = %err, "unreadable metrics layout, using zero state");
        Metrics::default()
    })
}

fn decode_patterns(contents: Option<&str>) -> PatternTable {
    let Some(value) = parse_value(Record::Patterns, contents) else {
        return PatternTable::default();
    };
    patterns::migrate(value).unwrap_or_else(|err| {
        warn!(err = %err, "unreadable pattern layout, using zero state");
        PatternTable::default()
    })
}

fn decode_active_task(contents: Option<&str>) -> Option<Task> {
    let value = parse_value(Record::ActiveTask, contents)?;
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value) {
        Ok(task) => Some(task),
        Err(err) => {
            warn!(err = %err, "corrupt active task, treating as none");
            None
        }
    }
}

/// Decode a line-delimited log, skipping lines that do not parse.
pub fn decode_lines<T: DeserializeOwned>(record: Record, contents: Option<&str>) -> Vec<T> {
    let Some(contents) = contents else {
        return Vec::new();
    };
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str(line) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(record = record.file_name(), line = idx + 1, err = %err, "skipping corrupt log line");
                None
            }
        })
        .collect()
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize record")?;
    buf.push('\n');
    Ok(buf)
}

fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("serialize log line")
}

pub fn load_metrics(store: &dyn StateStore) -> Metrics {
    match store.read(Record::Metrics) {
        Ok(contents) => decode_metrics(contents.as_deref()),
        Err(err) => {
            warn!(err = %err, "metrics unreadable, using zero state");
            Metrics::default()
        }
    }
}

/// Apply `apply` to the metrics record under its lock and return the result.
pub fn update_metrics(
    store: &dyn StateStore,
    now: DateTime<Utc>,
    mut apply: impl FnMut(&mut Metrics),
) -> Result<Metrics> {
    let mut updated = None;
    store.modify(Record::Metrics, &mut |current| {
        let mut metrics = decode_metrics(current);
        apply(&mut metrics);
        metrics.touch(now);
        let encoded = encode(&metrics)?;
        updated = Some(metrics);
        Ok(Some(encoded))
    })?;
    updated.ok_or_else(|| anyhow!("metrics update did not run"))
}

pub fn load_patterns(store: &dyn StateStore) -> PatternTable {
    match store.read(Record::Patterns) {
        Ok(contents) => decode_patterns(contents.as_deref()),
        Err(err) => {
            warn!(err = %err, "patterns unreadable, using zero state");
            PatternTable::default()
        }
    }
}

/// Count one outcome for `signature`; atomic per record.
pub fn record_pattern(
    store: &dyn StateStore,
    signature: &str,
    outcome: Outcome,
    now: DateTime<Utc>,
) -> Result<()> {
    store.modify(Record::Patterns, &mut |current| {
        let mut table = decode_patterns(current);
        table.record(signature, outcome, now);
        encode(&table).map(Some)
    })
}

/// Operator-only wholesale reset.
pub fn reset_patterns(store: &dyn StateStore) -> Result<()> {
    store.modify(Record::Patterns, &mut |_| encode(&PatternTable::default()).map(Some))
}

pub fn load_incidents(store: &dyn StateStore) -> Vec<Incident> {
    match store.read(Record::Incidents) {
        Ok(contents) => decode_lines(Record::Incidents, contents.as_deref()),
        Err(err) => {
            warn!(err = %err, "incidents unreadable, using zero state");
            Vec::new()
        }
    }
}

pub fn append_incident(store: &dyn StateStore, incident: &Incident) -> Result<()> {
    let line = encode_line(incident)?;
    store.append(Record::Incidents, &mut |_| Ok(vec![line.clone()]))
}

pub fn load_fix_queue(store: &dyn StateStore) -> FixQueue {
    match store.read(Record::FixQueue) {
        Ok(contents) => FixQueue::fold(decode_lines::<FixEvent>(Record::FixQueue, contents.as_deref())),
        Err(err) => {
            warn!(err = %err, "fix queue unreadable, using zero state");
            FixQueue::default()
        }
    }
}

/// Append fix-queue events built against the queue folded under the lock.
pub fn append_fix_events<R>(
    store: &dyn StateStore,
    mut build: impl FnMut(&FixQueue) -> Result<(Vec<FixEvent>, R)>,
) -> Result<R> {
    let mut out = None;
    store.append(Record::FixQueue, &mut |current| {
        let mut queue = FixQueue::fold(decode_lines::<FixEvent>(Record::FixQueue, current));
        let (events, value) = build(&queue)?;
        let mut lines = Vec::with_capacity(events.len());
        for event in events {
            lines.push(encode_line(&event)?);
            queue
                .apply(event)
                .context("fix queue event does not apply")?;
        }
        out = Some(value);
        Ok(lines)
    })?;
    out.ok_or_else(|| anyhow!("fix queue append did not run"))
}

pub fn load_active_task(store: &dyn StateStore) -> Option<Task> {
    match store.read(Record::ActiveTask) {
        Ok(contents) => decode_active_task(contents.as_deref()),
        Err(err) => {
            warn!(err = %err, "active task unreadable, treating as none");
            None
        }
    }
}

/// Read-modify-write of the active-task pointer. `apply` returns the new
/// pointer (`None` clears it) and a value passed back to the caller.
pub fn modify_active_task<R>(
    store: &dyn StateStore,
    mut apply: impl FnMut(Option<Task>) -> Result<(Option<Task>, R)>,
) -> Result<R> {
    let mut out = None;
    store.modify(Record::ActiveTask, &mut |current| {
        let (next, value) = apply(decode_active_task(current))?;
        out = Some(value);
        encode(&next).map(Some)
    })?;
    out.ok_or_else(|| anyhow!("active task update did not run"))
}

pub fn load_task_events(store: &dyn StateStore) -> Vec<TaskEvent> {
    match store.read(Record::Tasks) {
        Ok(contents) => decode_lines(Record::Tasks, contents.as_deref()),
        Err(err) => {
            warn!(err = %err, "task log unreadable, using zero state");
            Vec::new()
        }
    }
}

pub fn append_task_event(store: &dyn StateStore, event: &TaskEvent) -> Result<()> {
    let line = encode_line(event)?;
    store.append(Record::Tasks, &mut |_| Ok(vec![line.clone()]))
}
