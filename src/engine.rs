//! Hook execution engine.
//!
//! [`execute`] is the single entry point the host tool calls around each
//! stack/component command. It never returns an error: hooks must not block
//! the primary command, so every internal failure is absorbed into
//! structured logs (`{event, action, error, stack, component}`) and the next
//! action proceeds.
//!
//! Dispatch order: platform detection, component-type resolution, plugin
//! lookup, binding selection, context build, then the binding's actions in
//! declaration order, each gated by the enablement policy:
//!
//! - `summary`, `output` — on unless explicitly disabled,
//! - `check` — off unless explicitly enabled,
//! - `upload`, `download` — always on; store configuration governs behavior.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, instrument, warn};

use crate::config::{CiSettings, ExecutionInfo};
use crate::correlator;
use crate::error::{CiError, Result};
use crate::event::{HookEvent, HookPhase};
use crate::plugin::{
    find_binding, get_plugin, Action, ComponentPlugin, HookBinding, OutputData, OutputResult,
};
use crate::provider::{
    resolve_provider, CheckRunOptions, CheckRunUpdate, CheckStatus, CiContext, CiPlatform,
};
use crate::store::{
    create_store, resolve_store_options, PlanfileMetadata, StoreOptions,
};
use crate::template;

/// The host tool's name, the first segment of canonical check-run names.
pub const TOOL_NAME: &str = "atmos";

/// Inputs for one hook dispatch.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Dotted event name, e.g. `after.terraform.plan`.
    pub event: String,
    pub settings: CiSettings,
    pub info: ExecutionInfo,
    /// Raw output of the wrapped command.
    pub output: String,
    /// Overrides the component type derived from the event.
    pub component_type_override: Option<String>,
    /// Use the generic provider when no platform detects itself.
    pub force_ci_mode: bool,
}

/// Everything one dispatch's actions share. Immutable once built; lives for
/// the duration of a single [`execute`] call.
struct ActionContext<'a> {
    opts: &'a ExecuteOptions,
    event: &'a HookEvent,
    plugin: Arc<dyn ComponentPlugin>,
    platform: Arc<dyn CiPlatform>,
    ci: Option<CiContext>,
    binding: &'a HookBinding,
    command: &'a str,
    result: OutputResult,
}

/// Run the hooks bound to `opts.event`. Infallible by contract.
#[instrument(skip(opts), fields(event = %opts.event, stack = %opts.info.stack, component = %opts.info.component))]
pub async fn execute(opts: &ExecuteOptions) {
    // 1. Platform detection.
    let Some(platform) = resolve_provider(opts.force_ci_mode) else {
        debug!("no CI platform detected; hooks are a no-op");
        return;
    };

    // 2. Component-type resolution: explicit override, else the event.
    let event = HookEvent::parse(&opts.event);
    let component_type = opts
        .component_type_override
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| event.component_type());
    if component_type.is_empty() {
        debug!("event has no component type; skipping");
        return;
    }

    // 3. Plugin lookup.
    let Some(plugin) = get_plugin(component_type) else {
        debug!(component_type, "no plugin for component type; skipping");
        return;
    };

    // 4. Binding selection: first exact event match.
    let Some(binding) = find_binding(plugin.as_ref(), event.as_str()) else {
        debug!("no hook binding for event; skipping");
        return;
    };

    // 5. Context build. A context failure degrades to no CI context.
    let ci = match platform.context() {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            warn!(error = %e, provider = platform.name(), "CI context build failed");
            None
        }
    };
    let command = event.command();
    let mut result = plugin.parse_output(&opts.output, command);
    result.exit_code = opts.info.exit_code;

    let ctx = ActionContext {
        opts,
        event: &event,
        plugin: plugin.clone(),
        platform,
        ci,
        binding,
        command,
        result,
    };

    // 6. Actions in binding order, best-effort.
    for action in ctx.binding.actions {
        if !action_enabled(&opts.settings, *action) {
            debug!(action = action.as_str(), "action disabled by configuration");
            continue;
        }
        let outcome = match action {
            Action::Summary => run_summary(&ctx).await,
            Action::Output => run_output(&ctx),
            Action::Upload => run_upload(&ctx).await,
            Action::Download => run_download(&ctx).await,
            Action::Check => run_check(&ctx).await,
        };
        if let Err(e) = outcome {
            warn!(
                event = %ctx.event,
                action = action.as_str(),
                error = %e,
                stack = %ctx.opts.info.stack,
                component = %ctx.opts.info.component,
                "hook action failed; continuing"
            );
        }
    }
}

/// Per-action enablement policy.
fn action_enabled(settings: &CiSettings, action: Action) -> bool {
    match action {
        Action::Summary => settings.summary_enabled(),
        Action::Output => settings.output_enabled(),
        Action::Check => settings.checks_enabled(),
        Action::Upload | Action::Download => true,
    }
}

// ---------------------------------------------------------------------------
// Summary and output actions
// ---------------------------------------------------------------------------

async fn run_summary(ctx: &ActionContext<'_>) -> Result<()> {
    let Some(name) = ctx.binding.template else {
        debug!("binding has no summary template");
        return Ok(());
    };
    let component_type = ctx.plugin.component_type();
    let Some(content) = template::resolve(
        &ctx.opts.settings,
        component_type,
        name,
        ctx.plugin.default_template(name),
    )?
    else {
        debug!(template = name, "no template content resolved");
        return Ok(());
    };

    let Some(writer) = ctx.platform.output_writer() else {
        debug!(provider = ctx.platform.name(), "platform has no output writer");
        return Ok(());
    };

    let template_ctx = ctx.plugin.build_template_context(
        &ctx.opts.info,
        ctx.ci.as_ref(),
        &ctx.result,
        ctx.command,
    );
    let rendered = template::render(name, &content, &template_ctx)?;
    writer.write_summary(&rendered)
}

fn run_output(ctx: &ActionContext<'_>) -> Result<()> {
    let Some(writer) = ctx.platform.output_writer() else {
        debug!(provider = ctx.platform.name(), "platform has no output writer");
        return Ok(());
    };

    let mut vars = ctx.plugin.output_variables(&ctx.result, ctx.command);
    vars.insert("stack".to_string(), ctx.opts.info.stack.clone());
    vars.insert("component".to_string(), ctx.opts.info.component.clone());
    vars.insert("command".to_string(), ctx.command.to_string());

    if let Some(include) = &ctx.opts.settings.output.include {
        vars.retain(|key, _| include.iter().any(|allowed| allowed == key));
    }

    for (key, value) in &vars {
        writer.write_output(key, value)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Upload and download actions
// ---------------------------------------------------------------------------

/// The info's planfile first; else the plugin's optional plan-path resolver.
fn resolve_local_path(ctx: &ActionContext<'_>) -> Option<PathBuf> {
    if !ctx.opts.info.planfile.is_empty() {
        return Some(PathBuf::from(&ctx.opts.info.planfile));
    }
    let resolver = ctx.plugin.plan_path_resolver()?;
    match resolver.resolve_plan_path(&ctx.opts.settings, &ctx.opts.info) {
        Ok(path) => Some(path),
        Err(e) => {
            debug!(error = %e, "plan path resolution declined");
            None
        }
    }
}

async fn run_upload(ctx: &ActionContext<'_>) -> Result<()> {
    let Some(path) = resolve_local_path(ctx) else {
        debug!("no local planfile path; skipping upload");
        return Ok(());
    };
    if !path.is_file() {
        debug!(path = %path.display(), "planfile does not exist; skipping upload");
        return Ok(());
    }

    let key = ctx.plugin.artifact_key(&ctx.opts.info, ctx.command);
    if key.is_empty() {
        debug!("empty artifact key; skipping upload");
        return Ok(());
    }

    let store_opts = resolve_store_options(&ctx.opts.settings);
    let metadata = build_metadata(ctx, &store_opts);
    // Stores are cheap and stateless; construct per action.
    let store = create_store(&store_opts).await?;

    let data = tokio::fs::read(&path)
        .await
        .map_err(|e| CiError::PlanfileUpload {
            key: key.clone(),
            source: anyhow::Error::new(e).context(format!("reading {}", path.display())),
        })?;
    store.upload(&key, &data, Some(&metadata)).await?;
    debug!(key, store = store.name(), size = data.len(), "planfile uploaded");
    Ok(())
}

async fn run_download(ctx: &ActionContext<'_>) -> Result<()> {
    let Some(path) = resolve_local_path(ctx) else {
        debug!("no local planfile path; skipping download");
        return Ok(());
    };

    let key = ctx.plugin.artifact_key(&ctx.opts.info, ctx.command);
    if key.is_empty() {
        debug!("empty artifact key; skipping download");
        return Ok(());
    }

    let store = create_store(&resolve_store_options(&ctx.opts.settings)).await?;
    let (data, _metadata) = match store.download(&key).await {
        Ok(found) => found,
        Err(e) if e.is_not_found() => {
            debug!(key, store = store.name(), "no stored planfile; skipping download");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CiError::PlanfileDownload {
                key: key.clone(),
                source: e.into(),
            })?;
    }
    tokio::fs::write(&path, &data)
        .await
        .map_err(|e| CiError::PlanfileDownload {
            key: key.clone(),
            source: anyhow::Error::new(e).context(format!("writing {}", path.display())),
        })?;
    debug!(key, path = %path.display(), size = data.len(), "planfile downloaded");
    Ok(())
}

/// Metadata persisted next to an uploaded planfile. `expires_at` honors the
/// store's retention window when one is configured.
fn build_metadata(ctx: &ActionContext<'_>, store_opts: &StoreOptions) -> PlanfileMetadata {
    let info = &ctx.opts.info;
    let ci = ctx.ci.as_ref();
    let created_at = Utc::now();

    let retention_days = store_opts
        .get_u32("retention_days")
        .ok()
        .flatten()
        .or_else(|| {
            (store_opts.store_type == crate::store::github_artifact::STORE_TYPE)
                .then_some(crate::store::DEFAULT_RETENTION_DAYS)
        });

    let mut metadata = PlanfileMetadata {
        stack: info.stack.clone(),
        component: info.component.clone(),
        component_path: info.component_path.clone(),
        sha: or_ci(&info.sha, ci.map(|c| c.sha.as_str())),
        base_sha: none_if_empty(&info.base_sha),
        branch: none_if_empty(&or_ci(&info.branch, ci.map(|c| c.branch.as_str()))),
        pr_number: info.pr_number.or(ci.and_then(|c| c.pr_number)),
        run_id: info.run_id.or(ci.and_then(|c| c.run_id)),
        repository: none_if_empty(&or_ci(
            &info.repository,
            ci.map(|c| c.repository.as_str()),
        )),
        created_at,
        expires_at: retention_days.map(|days| created_at + Duration::days(i64::from(days))),
        has_changes: ctx.result.has_changes,
        ..Default::default()
    };

    if let OutputData::Plan(plan) = &ctx.result.data {
        metadata.plan_summary = plan.summary.clone();
        metadata.additions = plan.create;
        metadata.changes = plan.change + plan.replace;
        metadata.destructions = plan.destroy;
    }

    metadata
}

fn or_ci(primary: &str, fallback: Option<&str>) -> String {
    if !primary.is_empty() {
        primary.to_string()
    } else {
        fallback.unwrap_or("").to_string()
    }
}

fn none_if_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Check action
// ---------------------------------------------------------------------------

/// Canonical check-run name consumed by required-check rules downstream.
pub fn check_run_name(command: &str, stack: &str, component: &str) -> String {
    format!("{TOOL_NAME}/{command}: {stack}/{component}")
}

/// After-phase status. After-hooks fire from a deferred call in the host, so
/// a failed command still reaches this point.
fn derive_check_status(result: &OutputResult) -> CheckStatus {
    if result.has_errors || result.exit_code != 0 {
        CheckStatus::Failure
    } else {
        CheckStatus::Success
    }
}

/// Title and summary for a completed check run.
fn check_run_text(command: &str, result: &OutputResult) -> (String, Option<String>) {
    let summary = match &result.data {
        OutputData::Plan(plan) => plan.summary.clone(),
        OutputData::Apply(apply) => apply.summary.clone(),
        OutputData::NoOp => None,
    };
    let title = match &summary {
        Some(text) => text.clone(),
        None if result.has_changes => format!("{command}: changes detected"),
        None => format!("{command}: no changes"),
    };
    (title, summary)
}

async fn run_check(ctx: &ActionContext<'_>) -> Result<()> {
    let info = &ctx.opts.info;
    let name = check_run_name(ctx.command, &info.stack, &info.component);
    let key = correlator::correlation_key(&info.stack, &info.component, ctx.command);
    let head_sha = or_ci(&info.sha, ctx.ci.as_ref().map(|c| c.sha.as_str()));

    match ctx.event.phase() {
        HookPhase::Before => {
            let run = ctx
                .platform
                .create_check_run(&CheckRunOptions {
                    name,
                    head_sha,
                    status: Some(CheckStatus::InProgress),
                    ..Default::default()
                })
                .await?;
            correlator::store(key, run.id);
            debug!(id = run.id, "check run opened");
            Ok(())
        }
        HookPhase::After => {
            let status = derive_check_status(&ctx.result);
            let (title, summary) = check_run_text(ctx.command, &ctx.result);
            let completed_at = Some(Utc::now());

            match correlator::load_and_delete(&key) {
                Some(id) => {
                    ctx.platform
                        .update_check_run(&CheckRunUpdate {
                            id,
                            name,
                            status: Some(status),
                            title: Some(title),
                            summary,
                            completed_at,
                            ..Default::default()
                        })
                        .await?;
                    debug!(id, "check run completed");
                }
                // The before-event never ran (or ran in another process):
                // fall back to a new, already-completed run.
                None => {
                    let run = ctx
                        .platform
                        .create_check_run(&CheckRunOptions {
                            name,
                            head_sha,
                            status: Some(status),
                            title: Some(title),
                            summary,
                            completed_at,
                            ..Default::default()
                        })
                        .await?;
                    debug!(id = run.id, "check run created already-completed");
                }
            }
            Ok(())
        }
        HookPhase::Other => {
            debug!("check action only runs on before/after phases");
            Ok(())
        }
    }
}
