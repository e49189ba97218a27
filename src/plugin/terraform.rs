//! Terraform component plugin.
//!
//! Prefers the structured plan JSON (`terraform show -json`) when the output
//! looks like JSON; otherwise falls back to regex extraction over the human
//! console output. Three fallback matchers cover the plan summary banner, the
//! apply summary banner, and the no-changes message. Error and warning
//! extraction understands both bare diagnostics and the box-drawing framed
//! form newer CLI versions print.

use std::collections::BTreeMap;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{CiSettings, ExecutionInfo};
use crate::error::{CiError, Result};
use crate::plugin::{
    Action, ApplyData, ComponentPlugin, HookBinding, MovedResource, OutputData, OutputResult,
    PlanData, PlanPathResolver, PlannedOutput,
};
use crate::provider::CiContext;

pub const COMPONENT_TYPE: &str = "terraform";

/// Planfile extension used in artifact keys.
pub const PLANFILE_EXT: &str = "tfplan";

static BINDINGS: &[HookBinding] = &[
    HookBinding {
        event: "before.terraform.plan",
        actions: &[Action::Check],
        template: Some("plan"),
    },
    HookBinding {
        event: "after.terraform.plan",
        actions: &[Action::Summary, Action::Output, Action::Upload, Action::Check],
        template: Some("plan"),
    },
    HookBinding {
        event: "after.terraform.apply",
        actions: &[Action::Summary, Action::Output],
        template: Some("apply"),
    },
    HookBinding {
        event: "before.terraform.apply",
        actions: &[Action::Download],
        template: None,
    },
];

static PLAN_SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Plan:\s+(\d+)\s+to add,\s+(\d+)\s+to change,\s+(\d+)\s+to destroy")
        .expect("plan summary regex")
});

static APPLY_SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Apply complete!\s+Resources:\s+(\d+)\s+added,\s+(\d+)\s+changed,\s+(\d+)\s+destroyed")
        .expect("apply summary regex")
});

static NO_CHANGES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"No changes\.|Your infrastructure matches the configuration")
        .expect("no changes regex")
});

/// Matches bare `Error:` lines and lines framed with box-drawing characters.
static ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?:[│╷╵]\s*)?Error:\s*(.+?)\s*$").expect("error regex")
});

pub struct TerraformPlugin {
    resolver: TerraformPlanPathResolver,
}

impl Default for TerraformPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl TerraformPlugin {
    pub fn new() -> Self {
        Self {
            resolver: TerraformPlanPathResolver,
        }
    }
}

impl ComponentPlugin for TerraformPlugin {
    fn component_type(&self) -> &'static str {
        COMPONENT_TYPE
    }

    fn hook_bindings(&self) -> &'static [HookBinding] {
        BINDINGS
    }

    fn default_template(&self, name: &str) -> Option<&'static str> {
        match name {
            "plan" => Some(include_str!("../templates/plan.md")),
            "apply" => Some(include_str!("../templates/apply.md")),
            _ => None,
        }
    }

    fn build_template_context(
        &self,
        info: &ExecutionInfo,
        ci: Option<&CiContext>,
        result: &OutputResult,
        command: &str,
    ) -> Value {
        let mut ctx = json!({
            "stack": info.stack,
            "component": info.component,
            "command": command,
            "sha": pick(&info.sha, ci.map(|c| c.sha.as_str())),
            "branch": pick(&info.branch, ci.map(|c| c.branch.as_str())),
            "repository": pick(&info.repository, ci.map(|c| c.repository.as_str())),
            "exit_code": result.exit_code,
            "has_changes": result.has_changes,
            "has_errors": result.has_errors,
            "errors": result.errors,
            "warnings": result.warnings,
        });

        match &result.data {
            OutputData::Plan(plan) => {
                ctx["create"] = json!(plan.create);
                ctx["change"] = json!(plan.change);
                ctx["replace"] = json!(plan.replace);
                ctx["destroy"] = json!(plan.destroy);
                ctx["plan_summary"] = json!(plan.summary.clone().unwrap_or_default());
                ctx["created_resources"] = json!(plan.created_resources);
                ctx["changed_resources"] = json!(plan.changed_resources);
                ctx["replaced_resources"] = json!(plan.replaced_resources);
                ctx["destroyed_resources"] = json!(plan.destroyed_resources);
                ctx["imported_resources"] = json!(plan.imported_resources);
                // Sensitive output values never reach a rendered summary.
                let outputs: BTreeMap<&String, Value> = plan
                    .outputs
                    .iter()
                    .map(|(name, output)| {
                        let value = if output.sensitive {
                            json!("(sensitive)")
                        } else {
                            output.value.clone()
                        };
                        (name, value)
                    })
                    .collect();
                ctx["outputs"] = json!(outputs);
            }
            OutputData::Apply(apply) => {
                ctx["create"] = json!(apply.added);
                ctx["change"] = json!(apply.changed);
                ctx["destroy"] = json!(apply.destroyed);
                ctx["apply_summary"] = json!(apply.summary.clone().unwrap_or_default());
            }
            OutputData::NoOp => {}
        }

        ctx
    }

    fn parse_output(&self, output: &str, command: &str) -> OutputResult {
        let trimmed = output.trim_start();
        if trimmed.starts_with('{') {
            if let Ok(result) = parse_plan_json(trimmed) {
                return result;
            }
            // Fall through: JSON-looking output that is not a plan document.
        }

        match command {
            "apply" => parse_apply_text(output),
            _ => parse_plan_text(output),
        }
    }

    fn output_variables(
        &self,
        result: &OutputResult,
        _command: &str,
    ) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("has_changes".to_string(), result.has_changes.to_string());
        vars.insert("has_errors".to_string(), result.has_errors.to_string());
        vars.insert("exit_code".to_string(), result.exit_code.to_string());

        match &result.data {
            OutputData::Plan(plan) => {
                vars.insert("create".to_string(), plan.create.to_string());
                vars.insert("change".to_string(), plan.change.to_string());
                vars.insert("replace".to_string(), plan.replace.to_string());
                vars.insert("destroy".to_string(), plan.destroy.to_string());
                if let Some(summary) = &plan.summary {
                    vars.insert("plan_summary".to_string(), summary.clone());
                }
            }
            OutputData::Apply(apply) => {
                vars.insert("added".to_string(), apply.added.to_string());
                vars.insert("changed".to_string(), apply.changed.to_string());
                vars.insert("destroyed".to_string(), apply.destroyed.to_string());
                if let Some(summary) = &apply.summary {
                    vars.insert("apply_summary".to_string(), summary.clone());
                }
            }
            OutputData::NoOp => {}
        }

        vars
    }

    fn artifact_key(&self, info: &ExecutionInfo, _command: &str) -> String {
        // The key feeds debug logging even when upload/download later no-ops,
        // so substitute rather than fail.
        let stack = non_empty_or_unknown(&info.stack, "stack");
        let component = non_empty_or_unknown(&info.component, "component");
        format!("{stack}/{component}.{PLANFILE_EXT}")
    }

    fn plan_path_resolver(&self) -> Option<&dyn PlanPathResolver> {
        Some(&self.resolver)
    }
}

fn non_empty_or_unknown(value: &str, field: &str) -> String {
    if value.is_empty() {
        warn!(field, "artifact key field is empty; substituting 'unknown'");
        "unknown".to_string()
    } else {
        value.to_string()
    }
}

fn pick(primary: &str, fallback: Option<&str>) -> String {
    if !primary.is_empty() {
        primary.to_string()
    } else {
        fallback.unwrap_or("").to_string()
    }
}

/// Derives the conventional planfile location inside the component's working
/// directory: `<component_path>/<stack>-<component>.planfile`.
struct TerraformPlanPathResolver;

impl PlanPathResolver for TerraformPlanPathResolver {
    fn resolve_plan_path(&self, _settings: &CiSettings, info: &ExecutionInfo) -> Result<PathBuf> {
        if info.component_path.is_empty() || info.stack.is_empty() || info.component.is_empty() {
            return Err(CiError::InvalidConfig(
                "plan path resolution needs component_path, stack, and component".to_string(),
            ));
        }
        Ok(PathBuf::from(&info.component_path)
            .join(format!("{}-{}.planfile", info.stack, info.component)))
    }
}

// ---------------------------------------------------------------------------
// Structured plan JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TfPlanDoc {
    #[serde(default)]
    resource_changes: Vec<TfResourceChange>,
    #[serde(default)]
    planned_values: TfPlannedValues,
    #[serde(default)]
    output_changes: BTreeMap<String, TfChange>,
}

#[derive(Debug, Deserialize)]
struct TfResourceChange {
    address: String,
    previous_address: Option<String>,
    change: TfChange,
}

#[derive(Debug, Default, Deserialize)]
struct TfChange {
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    importing: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
    #[serde(default)]
    after_sensitive: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TfPlannedValues {
    #[serde(default)]
    outputs: BTreeMap<String, TfPlannedOutput>,
}

#[derive(Debug, Deserialize)]
struct TfPlannedOutput {
    #[serde(default)]
    value: Value,
    #[serde(default, rename = "type")]
    type_expr: Value,
    #[serde(default)]
    sensitive: bool,
}

/// Parse a `terraform show -json` plan document. Distinct entry point so
/// hosts holding the JSON can skip the text heuristics.
pub fn parse_plan_json(raw: &str) -> Result<OutputResult> {
    let doc: TfPlanDoc = serde_json::from_str(raw)
        .map_err(|e| CiError::InvalidConfig(format!("plan JSON: {e}")))?;

    let mut plan = PlanData::default();

    for rc in &doc.resource_changes {
        let actions: Vec<&str> = rc.change.actions.iter().map(String::as_str).collect();

        if rc.change.importing.is_some() {
            plan.imported_resources.push(rc.address.clone());
        }
        if let Some(previous) = &rc.previous_address {
            plan.moved_resources.push(MovedResource {
                from: previous.clone(),
                to: rc.address.clone(),
            });
        }

        match actions.as_slice() {
            ["create"] => {
                plan.create += 1;
                plan.created_resources.push(rc.address.clone());
            }
            ["update"] => {
                plan.change += 1;
                plan.changed_resources.push(rc.address.clone());
            }
            ["delete"] => {
                plan.destroy += 1;
                plan.destroyed_resources.push(rc.address.clone());
            }
            ["delete", "create"] | ["create", "delete"] => {
                plan.replace += 1;
                plan.replaced_resources.push(rc.address.clone());
            }
            _ => {} // no-op, read
        }
    }

    for (name, output) in doc.planned_values.outputs {
        plan.outputs.insert(
            name,
            PlannedOutput {
                value: output.value,
                type_expr: output.type_expr,
                sensitive: output.sensitive,
            },
        );
    }
    // Outputs only present as changes still show up, value pending.
    for (name, change) in &doc.output_changes {
        plan.outputs.entry(name.clone()).or_insert_with(|| PlannedOutput {
            value: change.after.clone().unwrap_or(Value::Null),
            type_expr: Value::Null,
            sensitive: matches!(change.after_sensitive, Some(Value::Bool(true))),
        });
    }

    let has_changes = plan.total_changes() > 0;
    // The banner counts a replacement once on each side.
    plan.summary = Some(format!(
        "Plan: {} to add, {} to change, {} to destroy",
        plan.create + plan.replace,
        plan.change,
        plan.destroy + plan.replace,
    ));

    Ok(OutputResult {
        has_changes,
        data: OutputData::Plan(plan),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Console-output fallbacks
// ---------------------------------------------------------------------------

fn parse_plan_text(output: &str) -> OutputResult {
    let errors = extract_errors(output);
    let warnings = extract_warnings(output);
    let has_errors = !errors.is_empty();

    let mut plan = PlanData::default();
    let has_changes = if let Some(caps) = PLAN_SUMMARY_RE.captures(output) {
        plan.create = parse_count(&caps[1]);
        plan.change = parse_count(&caps[2]);
        plan.destroy = parse_count(&caps[3]);
        plan.summary = Some(caps[0].to_string());
        plan.total_changes() > 0
    } else if NO_CHANGES_RE.is_match(output) {
        plan.summary = Some("No changes. Your infrastructure matches the configuration.".to_string());
        false
    } else {
        // Unparseable output is not an error by itself.
        false
    };

    OutputResult {
        has_changes,
        has_errors,
        errors,
        warnings,
        data: OutputData::Plan(plan),
        ..Default::default()
    }
}

fn parse_apply_text(output: &str) -> OutputResult {
    let errors = extract_errors(output);
    let warnings = extract_warnings(output);
    let has_errors = !errors.is_empty();

    let mut apply = ApplyData::default();
    let has_changes = if let Some(caps) = APPLY_SUMMARY_RE.captures(output) {
        apply.added = parse_count(&caps[1]);
        apply.changed = parse_count(&caps[2]);
        apply.destroyed = parse_count(&caps[3]);
        apply.summary = Some(caps[0].to_string());
        apply.added + apply.changed + apply.destroyed > 0
    } else {
        false
    };

    OutputResult {
        has_changes,
        has_errors,
        errors,
        warnings,
        data: OutputData::Apply(apply),
        ..Default::default()
    }
}

fn parse_count(raw: &str) -> u64 {
    raw.parse().unwrap_or(0)
}

fn extract_errors(output: &str) -> Vec<String> {
    ERROR_RE
        .captures_iter(output)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Accumulate lines between `Warning:` and a terminator (blank line or `╵`),
/// stripping box-drawing prefixes.
fn extract_warnings(output: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        let stripped = line
            .trim_start_matches(['│', '╷', '╵'])
            .trim();

        if let Some(rest) = stripped.strip_prefix("Warning:") {
            if let Some(done) = current.take() {
                warnings.push(done);
            }
            current = Some(rest.trim().to_string());
            continue;
        }

        if current.is_none() {
            continue;
        }
        let terminated = stripped.is_empty() && (line.trim().is_empty() || line.contains('╵'));
        if terminated {
            if let Some(done) = current.take() {
                warnings.push(done);
            }
        } else if !stripped.is_empty() {
            if let Some(block) = current.as_mut() {
                block.push('\n');
                block.push_str(stripped);
            }
        }
    }

    if let Some(block) = current {
        warnings.push(block);
    }
    warnings
}
