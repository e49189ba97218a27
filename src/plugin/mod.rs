//! Component-type plugins.
//!
//! A plugin teaches the engine how to handle one component type: which hook
//! events it cares about (bindings), how to parse the command's output, which
//! variables to export, and how to derive artifact keys. The terraform
//! plugin in [`terraform`] is the concrete implementation shipped here.
//!
//! Parsers must be total: never panic, always return a well-formed
//! [`OutputResult`] even for garbage input (fields default to zero and
//! `has_errors` stays false for merely-unparseable output).

pub mod terraform;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;

use crate::config::{CiSettings, ExecutionInfo};
use crate::error::{CiError, Result};
use crate::provider::CiContext;

/// Actions a hook binding can declare, executed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Summary,
    Output,
    Upload,
    Download,
    Check,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Summary => "summary",
            Action::Output => "output",
            Action::Upload => "upload",
            Action::Download => "download",
            Action::Check => "check",
        }
    }
}

/// One event a plugin responds to. Bindings are immutable for the plugin's
/// lifetime; for a given event the engine uses the first match.
#[derive(Debug, Clone)]
pub struct HookBinding {
    /// Full dotted event name, e.g. `after.terraform.plan`.
    pub event: &'static str,
    pub actions: &'static [Action],
    /// Summary template name, when the binding renders one.
    pub template: Option<&'static str>,
}

/// Parsed command output, shared by every action in a dispatch.
#[derive(Debug, Clone, Default)]
pub struct OutputResult {
    pub exit_code: i32,
    pub has_changes: bool,
    pub has_errors: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub data: OutputData,
}

/// Command-specific payload. Downstream code must handle a variant mismatch
/// rather than assuming the plan shape.
#[derive(Debug, Clone, Default)]
pub enum OutputData {
    #[default]
    NoOp,
    Plan(PlanData),
    Apply(ApplyData),
}

/// Resource deltas extracted from a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanData {
    pub create: u64,
    pub change: u64,
    pub replace: u64,
    pub destroy: u64,
    pub created_resources: Vec<String>,
    pub changed_resources: Vec<String>,
    pub replaced_resources: Vec<String>,
    pub destroyed_resources: Vec<String>,
    pub imported_resources: Vec<String>,
    pub moved_resources: Vec<MovedResource>,
    pub outputs: BTreeMap<String, PlannedOutput>,
    /// Terse human summary, e.g. `Plan: 1 to add, 0 to change, 0 to destroy`.
    pub summary: Option<String>,
}

impl PlanData {
    pub fn total_changes(&self) -> u64 {
        self.create + self.change + self.replace + self.destroy
    }
}

/// A resource moved to a new address without infrastructure change.
#[derive(Debug, Clone, Serialize)]
pub struct MovedResource {
    pub from: String,
    pub to: String,
}

/// A typed output value from the plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedOutput {
    pub value: Value,
    /// Type expression as reported by the tool; `null` when unknown.
    #[serde(rename = "type")]
    pub type_expr: Value,
    pub sensitive: bool,
}

/// Resource counts extracted from an apply.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyData {
    pub added: u64,
    pub changed: u64,
    pub destroyed: u64,
    pub summary: Option<String>,
}

/// Optional capability: derive the local planfile path from stack/component
/// metadata when the host did not pass one.
pub trait PlanPathResolver: Send + Sync {
    fn resolve_plan_path(&self, settings: &CiSettings, info: &ExecutionInfo) -> Result<PathBuf>;
}

/// The plugin contract.
pub trait ComponentPlugin: Send + Sync {
    /// Component-type tag, the middle segment of event names.
    fn component_type(&self) -> &'static str;

    /// Immutable binding list.
    fn hook_bindings(&self) -> &'static [HookBinding];

    /// Compiled-in default template content by name.
    fn default_template(&self, name: &str) -> Option<&'static str>;

    /// Rendering context for summary templates.
    fn build_template_context(
        &self,
        info: &ExecutionInfo,
        ci: Option<&CiContext>,
        result: &OutputResult,
        command: &str,
    ) -> Value;

    /// Total parser over raw command output.
    fn parse_output(&self, output: &str, command: &str) -> OutputResult;

    /// Variables to export through the platform's output writer.
    fn output_variables(
        &self,
        result: &OutputResult,
        command: &str,
    ) -> BTreeMap<String, String>;

    /// Store key for this execution's artifact. May substitute placeholders
    /// for missing fields rather than fail.
    fn artifact_key(&self, info: &ExecutionInfo, command: &str) -> String;

    /// Capability query for plan-path resolution. Default: not supported.
    fn plan_path_resolver(&self) -> Option<&dyn PlanPathResolver> {
        None
    }
}

/// First binding matching the event, if any.
pub fn find_binding<'a>(plugin: &'a dyn ComponentPlugin, event: &str) -> Option<&'a HookBinding> {
    plugin.hook_bindings().iter().find(|b| b.event == event)
}

// ---------------------------------------------------------------------------
// Plugin registry
// ---------------------------------------------------------------------------

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn ComponentPlugin>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a plugin under its component type. Duplicates fail.
pub fn register_plugin(plugin: Arc<dyn ComponentPlugin>) -> Result<()> {
    let name = plugin.component_type().to_string();
    let mut registry = REGISTRY.write().expect("plugin registry poisoned");
    if registry.contains_key(&name) {
        return Err(CiError::InvalidConfig(format!(
            "plugin for component type '{name}' is already registered"
        )));
    }
    registry.insert(name, plugin);
    Ok(())
}

/// Look up a plugin by component type.
pub fn get_plugin(component_type: &str) -> Option<Arc<dyn ComponentPlugin>> {
    REGISTRY
        .read()
        .expect("plugin registry poisoned")
        .get(component_type)
        .cloned()
}

/// Register the built-in plugins. Called from [`crate::register_builtins`].
pub(crate) fn register_builtin_plugins() {
    let _ = register_plugin(Arc::new(terraform::TerraformPlugin::new()));
}
