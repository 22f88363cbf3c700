//! Inbound hook event parsing.
//!
//! Hosts send one JSON object per invocation on stdin. Older hosts use
//! different field names (`tool`, `params`, `input`, `result`), and any field
//! may be absent. Parsing never fails: unusable input yields
//! [`ParsedEvent::Malformed`] so callers can log it and continue.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::types::ToolResponse;

pub const UNKNOWN_TOOL: &str = "unknown_tool";

/// Normalized tool event.
#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_response: ToolResponse,
    pub cwd: Option<PathBuf>,
}

impl HookEvent {
    /// `tool_input.file_path`, falling back to `tool_input.path`.
    pub fn target_path(&self) -> Option<&str> {
        ["file_path", "path"]
            .iter()
            .find_map(|key| self.tool_input.get(key).and_then(Value::as_str))
            .filter(|path| !path.trim().is_empty())
    }

    /// Raw context stored on incidents.
    pub fn raw_context(&self) -> Value {
        serde_json::json!({
            "tool_name": self.tool_name,
            "tool_input": self.tool_input,
            "tool_response": self.tool_response,
            "cwd": self.cwd,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Event(HookEvent),
    /// Input was not a JSON object; the reason is for logs only.
    Malformed(String),
}

/// Read all of stdin as bytes; decoding happens in [`parse_event_bytes`].
pub fn read_stdin() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .context("read hook event from stdin")?;
    Ok(buf)
}

/// Like [`parse_event`], but input that is not UTF-8 is malformed.
pub fn parse_event_bytes(raw: &[u8]) -> ParsedEvent {
    match std::str::from_utf8(raw) {
        Ok(text) => parse_event(text),
        Err(err) => {
            warn!(err = %err, "hook event is not UTF-8");
            ParsedEvent::Malformed(format!("hook event is not UTF-8: {err}"))
        }
    }
}

/// Empty input is treated as `{}`.
pub fn parse_event(raw: &str) -> ParsedEvent {
    let raw = raw.trim();
    if raw.is_empty() {
        debug!("empty hook event, using defaults");
        return ParsedEvent::Event(from_object(&Map::new()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => ParsedEvent::Event(from_object(&map)),
        Ok(other) => {
            let reason = format!("expected a JSON object, got {}", kind(&other));
            warn!(reason = %reason, "malformed hook event");
            ParsedEvent::Malformed(reason)
        }
        Err(err) => {
            warn!(err = %err, "malformed hook event");
            ParsedEvent::Malformed(err.to_string())
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn first<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| map.get(*key).filter(|value| !value.is_null()))
}

fn from_object(map: &Map<String, Value>) -> HookEvent {
    let tool_name = first(map, &["tool_name", "tool"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_TOOL)
        .to_string();
    let tool_input = first(map, &["tool_input", "params", "input"])
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));
    let tool_response = first(map, &["tool_response", "result"])
        .map(parse_response)
        .unwrap_or_default();
    let cwd = first(map, &["cwd"])
        .and_then(Value::as_str)
        .filter(|cwd| !cwd.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("PWD").map(PathBuf::from));
    HookEvent {
        tool_name,
        tool_input,
        tool_response,
        cwd,
    }
}

/// Field-by-field so one odd field does not discard the rest.
fn parse_response(value: &Value) -> ToolResponse {
    let Value::Object(map) = value else {
        // Some hosts send the tool output as a bare string.
        return ToolResponse {
            stdout: value.as_str().unwrap_or_default().to_string(),
            ..ToolResponse::default()
        };
    };
    let text = |key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    ToolResponse {
        success: map.get("success").and_then(Value::as_bool),
        exit_code: map.get("exit_code").and_then(lenient_int),
        stdout: text("stdout"),
        stderr: text("stderr"),
        error: text("error"),
    }
}

/// Integers, integral floats, and numeric strings; anything else is unknown.
fn lenient_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(raw: &str) -> HookEvent {
        match parse_event(raw) {
            ParsedEvent::Event(event) => event,
            ParsedEvent::Malformed(reason) => panic!("malformed: {reason}"),
        }
    }

    #[test]
    fn parses_current_shape() {
        let parsed = event(
            &json!({
                "tool_name": "Bash",
                "tool_input": {"command": "pytest -q"},
                "tool_response": {"success": false, "exit_code": 1, "stderr": "boom"},
                "cwd": "/work/app"
            })
            .to_string(),
        );
        assert_eq!(parsed.tool_name, "Bash");
        assert_eq!(parsed.tool_input["command"], "pytest -q");
        assert_eq!(parsed.tool_response.success, Some(false));
        assert_eq!(parsed.tool_response.exit_code, Some(1));
        assert_eq!(parsed.tool_response.stderr, "boom");
        assert_eq!(parsed.cwd, Some(PathBuf::from("/work/app")));
    }

    #[test]
    fn accepts_legacy_aliases() {
        let parsed = event(
            &json!({
                "tool": "Edit",
                "params": {"file_path": "src/app.py"},
                "result": {"exit_code": "2", "error": "denied"},
                "cwd": "/w"
            })
            .to_string(),
        );
        assert_eq!(parsed.tool_name, "Edit");
        assert_eq!(parsed.target_path(), Some("src/app.py"));
        assert_eq!(parsed.tool_response.exit_code, Some(2));
        assert_eq!(parsed.tool_response.error, "denied");

        let parsed = event(&json!({"input": {"path": "a.txt"}}).to_string());
        assert_eq!(parsed.target_path(), Some("a.txt"));
        assert_eq!(parsed.tool_name, UNKNOWN_TOOL);
    }

    #[test]
    fn missing_fields_default_safely() {
        let parsed = event("");
        assert_eq!(parsed.tool_name, UNKNOWN_TOOL);
        assert_eq!(parsed.tool_response, ToolResponse::default());
        assert!(parsed.tool_input.as_object().is_some_and(Map::is_empty));

        let parsed = event(r#"{"tool_response": {"exit_code": "nope", "success": "yes"}}"#);
        assert_eq!(parsed.tool_response.exit_code, None);
        assert_eq!(parsed.tool_response.success, None);
    }

    #[test]
    fn string_response_becomes_stdout() {
        let parsed = event(r#"{"tool_name": "Read", "tool_response": "file body"}"#);
        assert_eq!(parsed.tool_response.stdout, "file body");
        assert_eq!(parsed.tool_response.success, None);
    }

    #[test]
    fn non_objects_are_malformed() {
        assert!(matches!(parse_event("{not json"), ParsedEvent::Malformed(_)));
        assert!(matches!(parse_event("[1, 2]"), ParsedEvent::Malformed(_)));
        assert!(matches!(parse_event("42"), ParsedEvent::Malformed(_)));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        assert!(matches!(
            parse_event_bytes(b"\xff\xfe{}"),
            ParsedEvent::Malformed(reason) if reason.contains("UTF-8")
        ));
        assert!(matches!(
            parse_event_bytes(br#"{"tool_name": "Edit"}"#),
            ParsedEvent::Event(HookEvent { tool_name, .. }) if tool_name == "Edit"
        ));
    }
}
