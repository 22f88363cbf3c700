//! Deterministic pattern signatures.

use regex::Regex;
use serde_json::Value;

pub const GATE_PASS: &str = "quality_gate_pass";
/// A check that could not run to a verdict (spawn error, timeout, missing required tool).
pub const CHECK_ERROR: &str = "check:error";
pub const FIX_COMPLETED: &str = "fix_task_completed";
pub const FIX_FAILED: &str = "fix_task_failed";
pub const MALFORMED_EVENT: &str = "event:malformed";

/// Name of the built-in diff-size check.
pub const DIFF_LIMIT_CHECK: &str = "diff_limit";

const COMMAND_PREFIX_CHARS: usize = 80;

/// Signature of a failing check.
///
/// With a pattern, the first capture group (or whole match) found in the
/// check output becomes the suffix: `lint:F401`. Otherwise `<name>:fail`.
pub fn check_failure(name: &str, pattern: Option<&Regex>, output: &str) -> String {
    let code = pattern.and_then(|re| {
        re.captures(output).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().trim().to_string())
        })
    });
    match code {
        Some(code) if !code.is_empty() => format!("{name}:{code}"),
        _ => format!("{name}:fail"),
    }
}

pub fn diff_limit_exceeded(delta: u64) -> String {
    format!("diff:limit_exceeded:{delta}")
}

/// Signature for an observed tool use: `bash:<command prefix>`,
/// `<tool>:<path>` for file tools, otherwise `tool:<name>`.
pub fn tool_use(tool_name: &str, tool_input: &Value) -> String {
    let field = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| tool_input.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    match tool_name {
        "Bash" => match field(&["command", "cmd"]) {
            Some(command) => {
                let prefix: String = command.chars().take(COMMAND_PREFIX_CHARS).collect();
                format!("bash:{prefix}")
            }
            None => "bash:unknown".to_string(),
        },
        "Edit" | "MultiEdit" | "Write" | "Read" => format!(
            "{}:{}",
            tool_name.to_lowercase(),
            field(&["file_path", "path"]).unwrap_or("unknown")
        ),
        "" => "tool:unknown".to_string(),
        other => format!("tool:{other}"),
    }
}
