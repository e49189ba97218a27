//! Template resolution and rendering for job summaries.
//!
//! Resolution for a `(component_type, template_name)` pair is layered:
//!
//! 1. explicit override — `ci.templates.<type>.<name>` names a file path,
//!    resolved against `ci.templates.base_path` when relative;
//! 2. convention override — `<base_path>/<type>/<name>.md`;
//! 3. embedded default — the plugin's compiled-in template.
//!
//! Rendering is a single-pass scan over `{{ ... }}` placeholders resolved
//! against a `serde_json::Value` context. Dotted paths walk objects and
//! numeric segments index arrays. One filter is supported:
//!
//! ```text
//! {{ plan_summary | replace "|" "\\|" }}
//! ```
//!
//! Unresolved placeholders render as empty strings; structural problems
//! (unterminated placeholder, malformed filter) fail with a typed
//! template-evaluation error carrying the template name.

use std::path::PathBuf;

use serde_json::Value;

use crate::config::CiSettings;
use crate::error::{CiError, Result};

/// Resolve template content for `(component_type, name)`.
///
/// `embedded` is the plugin's compiled-in default, consulted last. Returns
/// `Ok(None)` when no layer has the template, which callers treat as a
/// silent no-op.
pub fn resolve(
    settings: &CiSettings,
    component_type: &str,
    name: &str,
    embedded: Option<&str>,
) -> Result<Option<String>> {
    // Layer 1: explicit override from config.
    if let Some(path) = settings.template_override(component_type, name) {
        let resolved = resolve_path(settings, path);
        return match std::fs::read_to_string(&resolved) {
            Ok(content) => Ok(Some(content)),
            Err(e) => Err(CiError::TemplateEvaluation {
                name: name.to_string(),
                reason: format!("override '{}': {e}", resolved.display()),
            }),
        };
    }

    // Layer 2: convention path under base_path.
    if let Some(base) = &settings.templates.base_path {
        let conventional = base.join(component_type).join(format!("{name}.md"));
        if conventional.is_file() {
            return match std::fs::read_to_string(&conventional) {
                Ok(content) => Ok(Some(content)),
                Err(e) => Err(CiError::TemplateEvaluation {
                    name: name.to_string(),
                    reason: format!("'{}': {e}", conventional.display()),
                }),
            };
        }
    }

    // Layer 3: embedded default.
    Ok(embedded.map(str::to_string))
}

fn resolve_path(settings: &CiSettings, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        return p;
    }
    match &settings.templates.base_path {
        Some(base) => base.join(p),
        None => p,
    }
}

/// Render `template` against `context`.
pub fn render(name: &str, template: &str, context: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
            let Some(close) = template[i + 2..].find("}}") else {
                return Err(CiError::TemplateEvaluation {
                    name: name.to_string(),
                    reason: format!("unterminated placeholder at byte {i}"),
                });
            };
            let inner = &template[i + 2..i + 2 + close];
            out.push_str(&eval_placeholder(name, inner, context)?);
            i += 2 + close + 2;
        } else {
            // Advance one UTF-8 character, not one byte.
            let ch_len = template[i..].chars().next().map_or(1, char::len_utf8);
            out.push_str(&template[i..i + ch_len]);
            i += ch_len;
        }
    }

    Ok(out)
}

/// Evaluate `path` or `path | replace "from" "to"`.
fn eval_placeholder(name: &str, inner: &str, context: &Value) -> Result<String> {
    let mut parts = inner.splitn(2, '|');
    let path = parts.next().unwrap_or("").trim();
    let value = lookup(context, path).map_or_else(String::new, value_to_string);

    let Some(filter) = parts.next() else {
        return Ok(value);
    };

    let filter = filter.trim();
    let Some(args) = filter.strip_prefix("replace") else {
        return Err(CiError::TemplateEvaluation {
            name: name.to_string(),
            reason: format!("unknown filter in '{{{{ {inner} }}}}'"),
        });
    };

    let (from, to) = parse_replace_args(args).ok_or_else(|| CiError::TemplateEvaluation {
        name: name.to_string(),
        reason: format!("replace expects two quoted arguments, got '{}'", args.trim()),
    })?;

    Ok(value.replace(&from, &to))
}

/// Parse `"from" "to"`, honoring `\"` and `\\` escapes.
fn parse_replace_args(args: &str) -> Option<(String, String)> {
    let mut strings = Vec::new();
    let mut chars = args.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            ' ' | '\t' => continue,
            '"' => {
                let mut s = String::new();
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            '"' => s.push('"'),
                            '\\' => s.push('\\'),
                            other => {
                                s.push('\\');
                                s.push(other);
                            }
                        },
                        other => s.push(other),
                    }
                }
                strings.push(s);
            }
            _ => return None,
        }
    }

    if strings.len() == 2 {
        let to = strings.pop()?;
        let from = strings.pop()?;
        Some((from, to))
    } else {
        None
    }
}

/// Walk a dotted path through objects and array indices.
fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = context;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_simple_placeholders() {
        let ctx = json!({"stack": "plat-ue2-dev", "component": "vpc"});
        let out = render("plan", "## {{ stack }}/{{ component }}", &ctx).unwrap();
        assert_eq!(out, "## plat-ue2-dev/vpc");
    }

    #[test]
    fn dotted_paths_and_indices() {
        let ctx = json!({"plan": {"create": 3, "resources": ["a", "b"]}});
        let out = render("t", "{{ plan.create }} first={{ plan.resources.0 }}", &ctx).unwrap();
        assert_eq!(out, "3 first=a");
    }

    #[test]
    fn missing_paths_render_empty() {
        let ctx = json!({"stack": "dev"});
        let out = render("t", "[{{ nope }}][{{ stack.too.deep }}]", &ctx).unwrap();
        assert_eq!(out, "[][]");
    }

    #[test]
    fn replace_filter() {
        let ctx = json!({"summary": "1 to add | 0 to destroy"});
        let out = render("t", r#"{{ summary | replace "|" "-" }}"#, &ctx).unwrap();
        assert_eq!(out, "1 to add - 0 to destroy");
    }

    #[test]
    fn replace_with_escaped_quote() {
        let ctx = json!({"v": "say \"hi\""});
        let out = render("t", r#"{{ v | replace "\"" "'" }}"#, &ctx).unwrap();
        assert_eq!(out, "say 'hi'");
    }

    #[test]
    fn unterminated_placeholder_is_typed_error() {
        let err = render("plan", "before {{ stack", &json!({})).unwrap_err();
        match err {
            CiError::TemplateEvaluation { name, .. } => assert_eq!(name, "plan"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_filter_is_typed_error() {
        let err = render("t", "{{ v | upper }}", &json!({"v": "x"})).unwrap_err();
        assert!(err.to_string().contains("unknown filter"));
    }

    #[test]
    fn bad_replace_args_is_typed_error() {
        let err = render("t", r#"{{ v | replace "only-one" }}"#, &json!({})).unwrap_err();
        assert!(err.to_string().contains("two quoted arguments"));
    }

    #[test]
    fn non_ascii_literals_survive() {
        let out = render("t", "╷ boxes ╵ {{ v }}", &json!({"v": "ok"})).unwrap();
        assert_eq!(out, "╷ boxes ╵ ok");
    }

    #[test]
    fn resolution_prefers_explicit_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("custom.md"), "override {{ stack }}").unwrap();

        let settings = CiSettings::from_yaml(&format!(
            "templates:\n  base_path: {}\n  terraform:\n    plan: custom.md\n",
            dir.path().display()
        ))
        .unwrap();

        let content = resolve(&settings, "terraform", "plan", Some("embedded"))
            .unwrap()
            .unwrap();
        assert_eq!(content, "override {{ stack }}");
    }

    #[test]
    fn resolution_falls_back_to_convention_then_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let tf_dir = dir.path().join("terraform");
        std::fs::create_dir_all(&tf_dir).unwrap();
        std::fs::write(tf_dir.join("plan.md"), "conventional").unwrap();

        let settings = CiSettings::from_yaml(&format!(
            "templates:\n  base_path: {}\n",
            dir.path().display()
        ))
        .unwrap();

        let content = resolve(&settings, "terraform", "plan", Some("embedded"))
            .unwrap()
            .unwrap();
        assert_eq!(content, "conventional");

        // No convention file for apply: the embedded default wins.
        let content = resolve(&settings, "terraform", "apply", Some("embedded"))
            .unwrap()
            .unwrap();
        assert_eq!(content, "embedded");

        // Nothing anywhere: None.
        assert!(resolve(&settings, "terraform", "destroy", None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_override_file_is_typed_error() {
        let settings = CiSettings::from_yaml(
            "templates:\n  terraform:\n    plan: /definitely/not/here.md\n",
        )
        .unwrap();
        let err = resolve(&settings, "terraform", "plan", None).unwrap_err();
        match err {
            CiError::TemplateEvaluation { name, .. } => assert_eq!(name, "plan"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
