//! Toolgate configuration stored under `<state_dir>/config.toml`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::store::write_atomic;
use crate::core::classifier::IncidentClass;
use crate::core::fix_plan::FixPlanTemplate;
use crate::core::lifecycle::AutoClosePolicy;
use crate::core::signature::DIFF_LIMIT_CHECK;

/// Toolgate configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolgateConfig {
    /// Fail the gate when added + deleted lines exceed this. `0` disables the check.
    pub diff_limit_lines: u64,

    /// Default per-check timeout.
    pub check_timeout_secs: u64,

    /// Tail of stdout/stderr kept per check run.
    pub output_limit_bytes: usize,

    /// Bounded wait for any state record lock.
    pub lock_timeout_ms: u64,

    /// Progress added to the active task per passing gate.
    pub progress_step: f64,

    /// Confidence removed from the active task per tool-failure incident.
    pub confidence_penalty: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_close: Option<AutoClosePolicy>,

    /// Ordered checks run after the diff limit. First failure stops the run.
    pub checks: Vec<CheckConfig>,

    /// Per-class overrides of the built-in fix plans.
    pub fix_plans: BTreeMap<IncidentClass, FixPlanTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckConfig {
    pub name: String,
    pub command: Vec<String>,
    /// Regex whose first capture group (or match) names the failure: `<name>:<code>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Verify command stored on fix tasks; defaults to `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    /// A required check whose program is missing fails the gate instead of
    /// being skipped.
    #[serde(default)]
    pub required: bool,
}

impl CheckConfig {
    pub fn timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(default_secs))
    }

    pub fn pattern(&self) -> Result<Option<Regex>> {
        self.signature_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("checks.{}.signature_pattern", self.name))
            })
            .transpose()
    }

    pub fn verify_argv(&self) -> &[String] {
        self.verify_command.as_deref().unwrap_or(&self.command)
    }

    pub fn guidance_text(&self) -> String {
        self.guidance.clone().unwrap_or_else(|| {
            format!(
                "Fix the `{}` failure and rerun `{}`.",
                self.name,
                self.command.join(" ")
            )
        })
    }
}

impl Default for ToolgateConfig {
    fn default() -> Self {
        Self {
            diff_limit_lines: 200,
            check_timeout_secs: 300,
            output_limit_bytes: 4000,
            lock_timeout_ms: 5000,
            progress_step: 0.1,
            confidence_penalty: 0.1,
            auto_close: None,
            checks: Vec::new(),
            fix_plans: BTreeMap::new(),
        }
    }
}

impl ToolgateConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_timeout_secs == 0 {
            return Err(anyhow!("check_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.lock_timeout_ms == 0 {
            return Err(anyhow!("lock_timeout_ms must be > 0"));
        }
        if !(self.progress_step > 0.0 && self.progress_step <= 1.0) {
            return Err(anyhow!("progress_step must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.confidence_penalty) {
            return Err(anyhow!("confidence_penalty must be in [0, 1]"));
        }
        if let Some(policy) = &self.auto_close
            && policy.min_passes == 0
        {
            return Err(anyhow!("auto_close.min_passes must be > 0"));
        }

        let mut names = BTreeSet::new();
        for check in &self.checks {
            let name = check.name.trim();
            if name.is_empty() {
                return Err(anyhow!("checks[].name must be non-empty"));
            }
            if name == DIFF_LIMIT_CHECK {
                return Err(anyhow!("check name `{DIFF_LIMIT_CHECK}` is reserved"));
            }
            if !names.insert(name) {
                return Err(anyhow!("duplicate check name `{name}`"));
            }
            if check.command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(anyhow!("checks.{name}.command must be a non-empty array"));
            }
            if check
                .verify_command
                .as_ref()
                .is_some_and(|argv| argv.first().is_none_or(|program| program.trim().is_empty()))
            {
                return Err(anyhow!("checks.{name}.verify_command must be a non-empty array"));
            }
            if check.timeout_secs == Some(0) {
                return Err(anyhow!("checks.{name}.timeout_secs must be > 0"));
            }
            check.pattern()?;
        }

        for (class, plan) in &self.fix_plans {
            if plan.verify_command.is_empty() {
                return Err(anyhow!("fix_plans.{class}.verify_command must be non-empty"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ToolgateConfig::default()`.
pub fn load_config(path: &Path) -> Result<ToolgateConfig> {
    if !path.exists() {
        let cfg = ToolgateConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ToolgateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk, prefixed with `header` comment lines.
pub fn write_config(path: &Path, cfg: &ToolgateConfig, header: &str) -> Result<()> {
    cfg.validate()?;
    let body = toml::to_string_pretty(cfg).context("serialize config toml")?;
    let mut buf = String::with_capacity(header.len() + body.len() + 1);
    buf.push_str(header);
    buf.push_str(&body);
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str) -> CheckConfig {
        CheckConfig {
            name: name.to_string(),
            command: vec!["ruff".to_string(), "check".to_string(), ".".to_string()],
            signature_pattern: Some(r"\b([A-Z]{1,4}\d{3,4})\b".to_string()),
            timeout_secs: None,
            verify_command: None,
            guidance: None,
            required: false,
        }
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ToolgateConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = ToolgateConfig {
            checks: vec![check("lint")],
            auto_close: Some(AutoClosePolicy::default()),
            ..ToolgateConfig::default()
        };
        cfg.fix_plans.insert(
            IncidentClass::ImportError,
            FixPlanTemplate {
                suggested_fix: "add {{ module }}".to_string(),
                verify_command: vec!["cargo".to_string(), "check".to_string()],
            },
        );
        write_config(&path, &cfg, "# toolgate\n").expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn parses_hand_written_checks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
diff_limit_lines = 50

[[checks]]
name = "lint"
command = ["ruff", "check", "."]
signature_pattern = '\b([A-Z]{1,4}\d{3,4})\b'
guidance = "Remove unused imports."

[[checks]]
name = "test"
command = ["pytest", "-q"]
timeout_secs = 900
required = true

[fix_plans.import_error]
suggested_fix = "pip install {{ module }}"
verify_command = ["python3", "-c", "import {{ module }}"]
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.diff_limit_lines, 50);
        assert_eq!(cfg.checks.len(), 2);
        assert_eq!(cfg.checks[1].timeout(300), Duration::from_secs(900));
        assert!(cfg.checks[1].required);
        assert_eq!(cfg.checks[0].verify_argv(), cfg.checks[0].command.as_slice());
        assert!(cfg.fix_plans.contains_key(&IncidentClass::ImportError));
        assert_eq!(cfg.check_timeout_secs, 300);
    }

    #[test]
    fn rejects_invalid_checks() {
        let mut cfg = ToolgateConfig {
            checks: vec![check("lint"), check("lint")],
            ..ToolgateConfig::default()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("duplicate"));

        cfg.checks = vec![check(DIFF_LIMIT_CHECK)];
        assert!(cfg.validate().unwrap_err().to_string().contains("reserved"));

        let mut bad = check("lint");
        bad.signature_pattern = Some("(".to_string());
        cfg.checks = vec![bad];
        assert!(cfg.validate().is_err());

        let mut empty = check("lint");
        empty.command.clear();
        cfg.checks = vec![empty];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_scalars() {
        let cfg = ToolgateConfig {
            progress_step: 0.0,
            ..ToolgateConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ToolgateConfig {
            confidence_penalty: 1.5,
            ..ToolgateConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
