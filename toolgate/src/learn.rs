//! Pattern learning from observed tool uses, plus operator pattern commands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::core::classifier::response_failed;
use crate::core::patterns::{PatternCounter, PatternTable, normalize_signature};
use crate::core::signature::{self, MALFORMED_EVENT};
use crate::core::types::Outcome;
use crate::io::event::HookEvent;
use crate::io::state::{load_patterns, record_pattern, reset_patterns};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Learned {
    pub signature: String,
    pub outcome: Outcome,
    pub counter: Option<PatternCounter>,
}

/// Record the outcome of one tool use under its tool-use signature.
pub fn learn(session: &Session, event: &HookEvent, now: DateTime<Utc>) -> Result<Learned> {
    let signature = normalize_signature(&signature::tool_use(&event.tool_name, &event.tool_input));
    let outcome = if response_failed(&event.tool_response) {
        Outcome::Failure
    } else {
        Outcome::Success
    };
    record_pattern(session.store(), &signature, outcome, now)?;
    debug!(signature = %signature, ?outcome, "tool use learned");
    let counter = load_patterns(session.store()).get(&signature).cloned();
    Ok(Learned {
        signature,
        outcome,
        counter,
    })
}

/// Count an unusable inbound event without an outcome.
pub fn record_malformed(session: &Session, now: DateTime<Utc>) -> Result<()> {
    record_pattern(session.store(), MALFORMED_EVENT, Outcome::Neutral, now)
}

pub fn show_patterns(session: &Session) -> PatternTable {
    load_patterns(session.store())
}

pub fn reset(session: &Session) -> Result<()> {
    reset_patterns(session.store())
}
