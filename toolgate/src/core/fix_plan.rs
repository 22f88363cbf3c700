//! Deterministic fix plans (suggested fix + verify command) per incident class.
//!
//! Plans are minijinja templates rendered against the incident's target path,
//! working directory, missing module and tool name. Every rendered verify
//! command must be side-effect free.

use crate::core::classifier::IncidentClass;
use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unrendered plan for one incident class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixPlanTemplate {
    pub suggested_fix: String,
    pub verify_command: Vec<String>,
}

/// Rendered plan stored on a fix task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixPlan {
    pub suggested_fix: String,
    pub verify_command: Vec<String>,
}

/// Values available to plan templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanInputs {
    /// File the failing tool touched, if known.
    pub target: Option<String>,
    pub cwd: String,
    pub module: Option<String>,
    pub tool_name: String,
}

/// Compiles every `.py` file under `argv[1]` (or that file) in memory.
/// Hidden directories are skipped and nothing is written.
const PY_SYNTAX_CHECK: &str = "import pathlib, sys\n\
r = pathlib.Path(sys.argv[1])\n\
fs = [r] if r.is_file() else sorted(f for f in r.rglob('*.py') \
if not any(p.startswith('.') for p in f.relative_to(r).parts))\n\
for f in fs: compile(f.read_bytes(), str(f), 'exec')\n";

fn template(suggested_fix: &str, verify_command: &[&str]) -> FixPlanTemplate {
    FixPlanTemplate {
        suggested_fix: suggested_fix.to_string(),
        verify_command: verify_command.iter().map(|arg| arg.to_string()).collect(),
    }
}

/// Built-in plan for `class`.
pub fn default_template(class: IncidentClass) -> FixPlanTemplate {
    match class {
        IncidentClass::PermissionDenied => template(
            "Adjust file permissions for `{{ target or cwd }}`.",
            &["test", "-r", "{{ target or cwd }}"],
        ),
        IncidentClass::ImportError => template(
            "Install or vendor missing module `{{ module or 'unknown' }}` and verify the import.",
            &[
                "python3",
                "-B",
                "-c",
                &format!("{{% if module %}}import {{{{ module }}}}{{% else %}}{PY_SYNTAX_CHECK}{{% endif %}}"),
                "{% if not module %}{{ cwd }}{% endif %}",
            ],
        ),
        IncidentClass::FileNotFound => template(
            "Create or correct missing path `{{ target or cwd }}`.",
            &["test", "-e", "{{ target or cwd }}"],
        ),
        IncidentClass::SyntaxError => template(
            "Fix syntax errors in `{{ target or cwd }}`.",
            &["python3", "-B", "-c", PY_SYNTAX_CHECK, "{{ target or cwd }}"],
        ),
        IncidentClass::Timeout => template(
            "Investigate why `{{ tool_name }}` timed out and rerun it with a smaller scope.",
            &["test", "-d", "{{ cwd }}"],
        ),
        IncidentClass::GenericFailure => template(
            "Investigate incident details and apply a minimal deterministic fix.",
            &["python3", "-B", "-c", PY_SYNTAX_CHECK, "{{ cwd }}"],
        ),
    }
}

/// Render the plan for `class`, preferring a configured override.
///
/// Arguments that render to an empty string are dropped, so templates can
/// make arguments conditional.
pub fn render_plan(
    class: IncidentClass,
    overrides: &BTreeMap<IncidentClass, FixPlanTemplate>,
    inputs: &PlanInputs,
) -> Result<FixPlan> {
    let template = overrides
        .get(&class)
        .cloned()
        .unwrap_or_else(|| default_template(class));
    render_template(&template, inputs).with_context(|| format!("render fix plan for {class}"))
}

pub fn render_template(template: &FixPlanTemplate, inputs: &PlanInputs) -> Result<FixPlan> {
    let env = Environment::new();
    let ctx = context! {
        target => inputs.target.as_deref().unwrap_or_default(),
        cwd => inputs.cwd.as_str(),
        module => inputs.module.as_deref().unwrap_or_default(),
        tool_name => inputs.tool_name.as_str(),
    };
    let suggested_fix = env.render_str(&template.suggested_fix, &ctx)?;
    let mut verify_command = Vec::with_capacity(template.verify_command.len());
    for arg in &template.verify_command {
        let rendered = env.render_str(arg, &ctx)?;
        if !rendered.is_empty() {
            verify_command.push(rendered);
        }
    }
    anyhow::ensure!(
        !verify_command.is_empty(),
        "verify command rendered to nothing"
    );
    Ok(FixPlan {
        suggested_fix,
        verify_command,
    })
}
