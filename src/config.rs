//! CI settings and per-command execution info.
//!
//! [`CiSettings`] models the `ci:` section of the host tool's YAML
//! configuration. Every enablement flag is tri-state (`Option<bool>`) so the
//! engine can distinguish "explicitly disabled" from "unset":
//!
//! ```yaml
//! ci:
//!   summary:
//!     enabled: true
//!   output:
//!     include: [has_changes, plan_summary]
//!   checks:
//!     enabled: true
//!   templates:
//!     base_path: .atmos/ci/templates
//!     terraform:
//!       plan: custom-plan.md
//!   store:
//!     type: s3
//!     options:
//!       bucket: my-planfiles
//!       prefix: atmos
//! ```
//!
//! [`ExecutionInfo`] is what the host hands the engine for one stack/component
//! command execution: identity, the local planfile path, and whatever commit
//! context it already resolved.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CiError, Result};

/// The `ci:` configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CiSettings {
    pub summary: ToggleSection,
    pub output: OutputSection,
    pub checks: ToggleSection,
    pub templates: TemplateSettings,
    /// Default planfile store. When absent the engine falls back to
    /// environment detection, then to a local store.
    pub store: Option<StoreSettings>,
}

impl CiSettings {
    /// Parse from a YAML document containing the `ci:` section body.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CiError::InvalidConfig(format!("ci settings: {e}")))
    }

    /// Read and parse a settings file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Summary action: on unless explicitly disabled.
    pub fn summary_enabled(&self) -> bool {
        self.summary.enabled.unwrap_or(true)
    }

    /// Output action: on unless explicitly disabled.
    pub fn output_enabled(&self) -> bool {
        self.output.enabled.unwrap_or(true)
    }

    /// Check action: off unless explicitly enabled. Check runs need elevated
    /// token permissions on most platforms.
    pub fn checks_enabled(&self) -> bool {
        self.checks.enabled.unwrap_or(false)
    }

    /// Explicit template override for `(component_type, command)`, if any.
    pub fn template_override(&self, component_type: &str, command: &str) -> Option<&str> {
        self.templates
            .overrides
            .get(component_type)
            .and_then(|commands| commands.get(command))
            .map(String::as_str)
    }
}

/// A section whose only knob is an `enabled` flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToggleSection {
    pub enabled: Option<bool>,
}

/// Key/value output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub enabled: Option<bool>,
    /// Allow-list of variable names. Absent means "write everything".
    pub include: Option<Vec<String>>,
}

/// Template resolution configuration (see the template module for the
/// explicit > convention > embedded resolution order).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSettings {
    /// Directory that explicit and convention overrides resolve against.
    pub base_path: Option<PathBuf>,
    /// `<component_type> -> <command> -> file path` override table.
    #[serde(flatten)]
    pub overrides: BTreeMap<String, BTreeMap<String, String>>,
}

/// Raw store configuration: a type tag plus free-form options.
///
/// Scalar option values are normalized to strings so store factories stay
/// independent of the config serialization format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    #[serde(rename = "type")]
    pub store_type: String,
    pub options: BTreeMap<String, serde_yaml::Value>,
}

impl StoreSettings {
    /// Flatten YAML scalar options into a string map.
    pub fn string_options(&self) -> BTreeMap<String, String> {
        self.options
            .iter()
            .filter_map(|(k, v)| {
                let s = match v {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((k.clone(), s))
            })
            .collect()
    }
}

/// What the host tool knows about one command execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionInfo {
    pub stack: String,
    pub component: String,
    /// Filesystem path of the component's working directory, when resolved.
    pub component_path: String,
    /// Local planfile path produced or consumed by the command.
    pub planfile: String,
    pub sha: String,
    pub base_sha: String,
    pub branch: String,
    pub repository: String,
    pub pr_number: Option<u64>,
    pub run_id: Option<u64>,
    /// Exit code of the wrapped command; after-hooks can fire on failure.
    pub exit_code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_action_policy() {
        let settings = CiSettings::default();
        assert!(settings.summary_enabled());
        assert!(settings.output_enabled());
        assert!(!settings.checks_enabled());
        assert!(settings.store.is_none());
    }

    #[test]
    fn explicit_flags_override_defaults() {
        let settings = CiSettings::from_yaml(
            r#"
summary:
  enabled: false
checks:
  enabled: true
"#,
        )
        .unwrap();
        assert!(!settings.summary_enabled());
        assert!(settings.checks_enabled());
        // Untouched section keeps its default.
        assert!(settings.output_enabled());
    }

    #[test]
    fn template_overrides_parse() {
        let settings = CiSettings::from_yaml(
            r#"
templates:
  base_path: .atmos/ci
  terraform:
    plan: my-plan.md
    apply: my-apply.md
"#,
        )
        .unwrap();
        assert_eq!(
            settings.template_override("terraform", "plan"),
            Some("my-plan.md")
        );
        assert_eq!(settings.template_override("terraform", "destroy"), None);
        assert_eq!(settings.template_override("helmfile", "plan"), None);
        assert_eq!(
            settings.templates.base_path.as_deref(),
            Some(Path::new(".atmos/ci"))
        );
    }

    #[test]
    fn store_options_normalize_scalars() {
        let settings = CiSettings::from_yaml(
            r#"
store:
  type: github
  options:
    owner: cloudposse
    repo: infrastructure
    retention_days: 14
"#,
        )
        .unwrap();
        let store = settings.store.unwrap();
        assert_eq!(store.store_type, "github");
        let opts = store.string_options();
        assert_eq!(opts.get("owner").map(String::as_str), Some("cloudposse"));
        assert_eq!(opts.get("retention_days").map(String::as_str), Some("14"));
    }

    #[test]
    fn output_include_list() {
        let settings = CiSettings::from_yaml(
            r#"
output:
  include: [has_changes, plan_summary]
"#,
        )
        .unwrap();
        let include = settings.output.include.unwrap();
        assert_eq!(include, vec!["has_changes", "plan_summary"]);
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let err = CiSettings::from_yaml("summary: [not, a, map").unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }
}
