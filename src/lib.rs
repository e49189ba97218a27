//! # atmos-ci
//!
//! CI/CD integration core for the atmos orchestrator.
//!
//! ## Overview
//!
//! This crate turns per-stack, per-component command executions into CI
//! platform artifacts: pull-request check runs, job-summary markdown,
//! key/value step outputs, and uploaded/downloaded planfiles. The host tool
//! wraps each command with two hook events and hands both to [`execute`]:
//!
//! ```text
//! before.terraform.plan ──▶ open check run
//!        (command runs)
//! after.terraform.plan ──▶ summary + outputs + planfile upload + close check
//! ```
//!
//! ## Architecture
//!
//! | Module | Responsibility |
//! |----------------|------------------------------------------------------|
//! | [`engine`] | event dispatch and the five hook actions |
//! | [`plugin`] | component-type plugins (terraform) |
//! | [`provider`] | CI platforms (github, generic fallback) |
//! | [`store`] | planfile stores (local, s3, github artifacts) |
//! | [`correlator`] | before/after check-run pairing |
//! | [`template`] | layered summary templates |
//! | [`config`] | the `ci:` settings section |
//! | [`event`] | `{phase}.{component_type}.{command}` parsing |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use atmos_ci::{execute, CiSettings, ExecuteOptions, ExecutionInfo};
//!
//! # async fn run(plan_output: String) {
//! atmos_ci::register_builtins();
//!
//! execute(&ExecuteOptions {
//!     event: "after.terraform.plan".to_string(),
//!     settings: CiSettings::default(),
//!     info: ExecutionInfo {
//!         stack: "plat-ue2-dev".to_string(),
//!         component: "vpc".to_string(),
//!         planfile: "/tmp/plat-ue2-dev-vpc.planfile".to_string(),
//!         ..Default::default()
//!     },
//!     output: plan_output,
//!     ..Default::default()
//! })
//! .await;
//! # }
//! ```
//!
//! `execute` never fails: hooks must not block the wrapped command, so every
//! internal error is logged and swallowed. Registries, store constructors,
//! and provider constructors fail loudly instead.

pub mod config;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod event;
pub mod logging;
pub mod plugin;
pub mod provider;
pub mod store;
pub mod template;

use std::sync::Once;

pub use config::{CiSettings, ExecutionInfo, StoreSettings};
pub use engine::{check_run_name, execute, ExecuteOptions, TOOL_NAME};
pub use error::{CiError, Result};
pub use event::{HookEvent, HookPhase};
pub use plugin::{
    register_plugin, Action, ComponentPlugin, HookBinding, OutputData, OutputResult, PlanData,
};
pub use provider::{
    register_provider, CheckRun, CheckRunOptions, CheckRunUpdate, CheckStatus, CiContext,
    CiPlatform, OutputWriter,
};
pub use store::{
    create_planfile_store, create_store, register_store, PlanfileInfo, PlanfileMetadata,
    PlanfileStore, StoreOptions,
};

static REGISTER: Once = Once::new();

/// Register the built-in stores, providers, and plugins.
///
/// Call once from the host's entry point before the first [`execute`]. Safe
/// to call repeatedly; later calls are no-ops.
pub fn register_builtins() {
    REGISTER.call_once(|| {
        store::register_builtin_stores();
        provider::register_builtin_providers();
        plugin::register_builtin_plugins();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_builtins_is_idempotent() {
        register_builtins();
        register_builtins();
        assert!(provider::get_provider("github").is_ok());
        assert!(provider::get_provider("generic").is_ok());
        assert!(plugin::get_plugin("terraform").is_some());
    }
}
