//! Rule-based classification of failed tool invocations.
//!
//! Rules are evaluated in order and the first match wins. Anything unmatched
//! is a [`IncidentClass::GenericFailure`].

use crate::core::types::ToolResponse;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Closed incident taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentClass {
    PermissionDenied,
    ImportError,
    FileNotFound,
    SyntaxError,
    Timeout,
    GenericFailure,
}

impl IncidentClass {
    pub const ALL: [IncidentClass; 6] = [
        IncidentClass::PermissionDenied,
        IncidentClass::ImportError,
        IncidentClass::FileNotFound,
        IncidentClass::SyntaxError,
        IncidentClass::Timeout,
        IncidentClass::GenericFailure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IncidentClass::PermissionDenied => "permission_denied",
            IncidentClass::ImportError => "import_error",
            IncidentClass::FileNotFound => "file_not_found",
            IncidentClass::SyntaxError => "syntax_error",
            IncidentClass::Timeout => "timeout",
            IncidentClass::GenericFailure => "generic_failure",
        }
    }

    /// Class-level pattern signature (`incident:<class>`).
    pub fn pattern_signature(self) -> String {
        format!("incident:{}", self.as_str())
    }
}

impl fmt::Display for IncidentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate over lowercased error text.
#[derive(Debug)]
enum Matcher {
    Contains(&'static [&'static str]),
    Pattern(Regex),
}

impl Matcher {
    fn matches(&self, text: &str) -> bool {
        match self {
            Matcher::Contains(needles) => needles.iter().any(|needle| text.contains(needle)),
            Matcher::Pattern(re) => re.is_match(text),
        }
    }
}

static RULES: LazyLock<Vec<(Matcher, IncidentClass)>> = LazyLock::new(|| {
    vec![
        (
            Matcher::Contains(&["permission denied", "operation not permitted", "eacces"]),
            IncidentClass::PermissionDenied,
        ),
        (
            Matcher::Contains(&[
                "modulenotfounderror",
                "no module named",
                "cannot find module",
                "unresolved import",
            ]),
            IncidentClass::ImportError,
        ),
        (
            Matcher::Pattern(Regex::new(r"\bimporterror\b").expect("import regex")),
            IncidentClass::ImportError,
        ),
        (
            Matcher::Contains(&["no such file", "not found", "enoent"]),
            IncidentClass::FileNotFound,
        ),
        (
            Matcher::Contains(&["syntaxerror", "syntax error", "parse error", "unexpected token"]),
            IncidentClass::SyntaxError,
        ),
        (
            Matcher::Contains(&["timeout", "timed out"]),
            IncidentClass::Timeout,
        ),
    ]
});

/// Markers in stderr/error text that indicate failure even with a zero exit.
const FATAL_MARKERS: &[&str] = &[
    "traceback",
    "exception",
    "syntaxerror",
    "permission denied",
    "no such file",
    "not found",
    "modulenotfounderror",
    "fatal",
];

static MISSING_MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:no module named|cannot find module)\s+['"]([^'"]+)['"]"#)
        .expect("missing module regex")
});

/// Package-like names: letters, digits, `_ . - / @`. Anything else in a
/// quoted module name is tool output, not a name.
static PACKAGE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@?[A-Za-z0-9_][A-Za-z0-9_.\-/]*$").expect("package name regex")
});

static PYTHON_MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_]\w*(\.[A-Za-z_]\w*)*$").expect("python module regex")
});

/// Decide whether an observed tool response is a failure.
///
/// Absent fields are unknown, never failure.
pub fn response_failed(response: &ToolResponse) -> bool {
    if response.success == Some(false) {
        return true;
    }
    if response.exit_code.is_some_and(|code| code != 0) {
        return true;
    }
    let combined = format!("{}\n{}", response.stderr, response.error).to_lowercase();
    FATAL_MARKERS.iter().any(|marker| combined.contains(marker))
}

/// Resolve the incident class for a failure's error text.
pub fn classify(error_text: &str) -> IncidentClass {
    let text = error_text.to_lowercase();
    RULES
        .iter()
        .find(|(matcher, _)| matcher.matches(&text))
        .map(|(_, class)| *class)
        .unwrap_or(IncidentClass::GenericFailure)
}

/// Module named by a missing-module error, if it looks like a package name.
pub fn missing_module(error_text: &str) -> Option<String> {
    MISSING_MODULE_RE
        .captures(error_text)
        .and_then(|caps| caps.get(1))
        .map(|module| module.as_str())
        .filter(|module| PACKAGE_NAME_RE.is_match(module))
        .map(str::to_string)
}

/// Missing module usable in an import check: a dotted Python identifier only.
pub fn python_module(error_text: &str) -> Option<String> {
    missing_module(error_text).filter(|module| PYTHON_MODULE_RE.is_match(module))
}

/// Most specific signature for an incident of `class`.
pub fn incident_signature(class: IncidentClass, error_text: &str) -> String {
    if class == IncidentClass::ImportError
        && let Some(module) = missing_module(error_text)
    {
        return format!("incident:import:{module}");
    }
    class.pattern_signature()
}
