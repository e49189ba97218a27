//! Opt-in tracing initialization.
//!
//! The crate itself only emits `tracing` events; hosts that want them on
//! stderr without wiring their own subscriber can call [`init`] once at
//! startup. Respects `RUST_LOG`, defaulting to `info`.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a stderr subscriber. Safe to call more than once; only the first
/// call has any effect.
pub fn init() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    });
}
