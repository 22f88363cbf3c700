//! Signature-keyed outcome counters (`patterns.json`).

use crate::core::types::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const PATTERNS_SCHEMA_VERSION: u64 = 2;

/// Signature used when a caller supplies an empty one.
pub const UNKNOWN_SIGNATURE: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternCounter {
    pub total: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternTable {
    pub version: u64,
    pub patterns: BTreeMap<String, PatternCounter>,
}

impl Default for PatternTable {
    fn default() -> Self {
        Self {
            version: PATTERNS_SCHEMA_VERSION,
            patterns: BTreeMap::new(),
        }
    }
}

impl PatternTable {
    /// Count one event for `signature`. Neutral events bump `total` only.
    pub fn record(&mut self, signature: &str, outcome: Outcome, now: DateTime<Utc>) {
        let counter = self
            .patterns
            .entry(normalize_signature(signature))
            .or_default();
        counter.total += 1;
        match outcome {
            Outcome::Success => counter.success_count += 1,
            Outcome::Failure => counter.failure_count += 1,
            Outcome::Neutral => {}
        }
        counter.last_seen = Some(now);
    }

    pub fn get(&self, signature: &str) -> Option<&PatternCounter> {
        self.patterns.get(&normalize_signature(signature))
    }

    /// Signatures with at least one failure, most failures first.
    pub fn top_failures(&self, limit: usize) -> Vec<(&str, &PatternCounter)> {
        let mut failing: Vec<_> = self
            .patterns
            .iter()
            .filter(|(_, counter)| counter.failure_count > 0)
            .map(|(signature, counter)| (signature.as_str(), counter))
            .collect();
        failing.sort_by(|a, b| {
            b.1.failure_count
                .cmp(&a.1.failure_count)
                .then_with(|| a.0.cmp(b.0))
        });
        failing.truncate(limit);
        failing
    }
}

/// Collapse whitespace noise so equivalent signatures share a counter.
pub fn normalize_signature(signature: &str) -> String {
    let joined = signature.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        UNKNOWN_SIGNATURE.to_string()
    } else {
        joined
    }
}

/// Load any known pattern-table layout.
///
/// Older layouts grouped counters by event type, each bucket holding a
/// `by_signature` map; those buckets are flattened and counters for the same
/// signature are summed.
pub fn migrate(value: Value) -> Result<PatternTable, serde_json::Error> {
    let is_current = value.get("version").and_then(Value::as_u64).is_some()
        && value.get("patterns").is_some_and(Value::is_object);
    if is_current {
        return serde_json::from_value(value);
    }

    let mut table = PatternTable::default();
    let Some(buckets) = value.get("patterns").and_then(Value::as_object) else {
        return Ok(table);
    };
    for bucket in buckets.values() {
        let Some(by_signature) = bucket.get("by_signature").and_then(Value::as_object) else {
            continue;
        };
        for (signature, raw) in by_signature {
            let legacy: PatternCounter = serde_json::from_value(raw.clone())?;
            let counter = table
                .patterns
                .entry(normalize_signature(signature))
                .or_default();
            counter.total += legacy.total;
            counter.success_count += legacy.success_count;
            counter.failure_count += legacy.failure_count;
            counter.last_seen = counter.last_seen.max(legacy.last_seen);
        }
    }
    Ok(table)
}
