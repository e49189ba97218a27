//! Hook event names.
//!
//! Events are dotted triples of the form `{phase}.{component_type}.{command}`,
//! e.g. `after.terraform.plan`. The engine enforces no fixed vocabulary; it
//! pattern-matches against whatever bindings the registered plugins declare.
//!
//! Parsing is total. An event with fewer than three dotted parts yields empty
//! segments, which the engine treats as a no-op rather than an error.

use std::fmt;

/// Which side of the command the hook fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Before,
    After,
    /// Anything other than `before`/`after`. Kept so parsing stays total.
    Other,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Before => "before",
            HookPhase::After => "after",
            HookPhase::Other => "",
        }
    }
}

/// A parsed hook event.
///
/// Keeps the raw form for binding matching (bindings match on the full
/// dotted string) alongside the split segments the engine dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    raw: String,
    phase: HookPhase,
    component_type: String,
    command: String,
}

impl HookEvent {
    /// Parse an event name. Never fails; missing segments come back empty.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(3, '.');
        let phase_str = parts.next().unwrap_or("");
        let component_type = parts.next().unwrap_or("").to_string();
        let command = parts.next().unwrap_or("").to_string();

        let phase = match phase_str {
            "before" => HookPhase::Before,
            "after" => HookPhase::After,
            _ => HookPhase::Other,
        };

        Self {
            raw: raw.to_string(),
            phase,
            component_type,
            command,
        }
    }

    /// The full dotted event name, exactly as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn phase(&self) -> HookPhase {
        self.phase
    }

    /// The middle dotted segment; empty when the event is malformed.
    pub fn component_type(&self) -> &str {
        &self.component_type
    }

    /// The third dotted segment; empty when the event is malformed.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the event carries enough structure to dispatch on.
    pub fn is_dispatchable(&self) -> bool {
        !self.component_type.is_empty() && !self.command.is_empty()
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
