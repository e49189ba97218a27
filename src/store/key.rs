//! Planfile key generation and validation.
//!
//! Keys are slash-separated relative paths. Every backend that materializes
//! keys as filesystem paths funnels them through [`clean_key`] first, which
//! rejects traversal in any form, so a hostile key can never escape the
//! configured base path.
//!
//! [`generate_key`] expands a pattern like the default
//! `{stack}/{component}/{sha}.{ext}` against a [`KeyContext`]. Required
//! placeholders with empty values fail with a typed error; optional ones
//! substitute empty strings; unknown ones stay literal.

use crate::error::{CiError, Result};

/// Default key pattern.
pub const DEFAULT_KEY_PATTERN: &str = "{stack}/{component}/{sha}.{ext}";

/// Placeholders that must be non-empty for generation to succeed.
const REQUIRED: &[&str] = &["stack", "component", "sha"];

/// Values available to key-pattern expansion.
#[derive(Debug, Clone, Default)]
pub struct KeyContext {
    pub stack: String,
    pub component: String,
    pub component_path: String,
    pub sha: String,
    pub base_sha: String,
    pub branch: String,
    pub pr_number: Option<u64>,
    pub run_id: Option<u64>,
    /// File extension without the dot, e.g. `tfplan`.
    pub ext: String,
}

impl KeyContext {
    fn get(&self, name: &str) -> Option<String> {
        match name {
            "stack" => Some(self.stack.clone()),
            "component" => Some(self.component.clone()),
            "component_path" => Some(self.component_path.clone()),
            "sha" => Some(self.sha.clone()),
            "base_sha" => Some(self.base_sha.clone()),
            "branch" => Some(self.branch.clone()),
            "pr_number" => Some(self.pr_number.map(|n| n.to_string()).unwrap_or_default()),
            "run_id" => Some(self.run_id.map(|n| n.to_string()).unwrap_or_default()),
            "ext" => Some(self.ext.clone()),
            _ => None,
        }
    }
}

/// Expand `pattern` against `ctx` and validate the result.
pub fn generate_key(pattern: &str, ctx: &KeyContext) -> Result<String> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            // No closing brace: the remainder is literal.
            out.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let name = &after[..close];
        match ctx.get(name) {
            Some(value) => {
                if value.is_empty() && REQUIRED.contains(&name) {
                    return Err(CiError::KeyInvalid {
                        key: pattern.to_string(),
                        reason: format!("required placeholder '{{{name}}}' is empty"),
                    });
                }
                out.push_str(&value);
            }
            // Unknown placeholder stays literal.
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);

    clean_key(&out)
}

/// Normalize a key and reject traversal.
///
/// Splits on both separators, drops empty and `.` segments, and fails on any
/// `..` segment or on a key that cleans to nothing. The returned key always
/// uses forward slashes and is safe to join under a base path.
pub fn clean_key(key: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in key.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(CiError::KeyInvalid {
                    key: key.to_string(),
                    reason: "path traversal ('..' segment)".to_string(),
                })
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(CiError::KeyInvalid {
            key: key.to_string(),
            reason: "key is empty".to_string(),
        });
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> KeyContext {
        KeyContext {
            stack: "plat-ue2-dev".into(),
            component: "vpc".into(),
            sha: "abc123".into(),
            ext: "tfplan".into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_pattern_expands() {
        let key = generate_key(DEFAULT_KEY_PATTERN, &ctx()).unwrap();
        assert_eq!(key, "plat-ue2-dev/vpc/abc123.tfplan");
    }

    #[test]
    fn empty_required_placeholder_fails() {
        let mut c = ctx();
        c.sha.clear();
        let err = generate_key(DEFAULT_KEY_PATTERN, &c).unwrap_err();
        match err {
            CiError::KeyInvalid { reason, .. } => assert!(reason.contains("sha")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn optional_placeholders_substitute_empty() {
        let key = generate_key("{stack}/{branch}/{component}.{ext}", &ctx()).unwrap();
        // Empty branch collapses into a single separator during cleaning.
        assert_eq!(key, "plat-ue2-dev/vpc.tfplan");
    }

    #[test]
    fn pr_number_expands_when_present() {
        let mut c = ctx();
        c.pr_number = Some(128);
        let key = generate_key("pr-{pr_number}/{component}.{ext}", &c).unwrap();
        assert_eq!(key, "pr-128/vpc.tfplan");
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let key = generate_key("{stack}/{flavor}/{component}", &ctx()).unwrap();
        assert_eq!(key, "plat-ue2-dev/{flavor}/vpc");
    }

    #[test]
    fn unterminated_brace_is_literal() {
        let key = generate_key("{stack}/x{oops", &ctx()).unwrap();
        assert_eq!(key, "plat-ue2-dev/x{oops");
    }

    #[test]
    fn clean_key_rejects_traversal() {
        for key in [
            "../../etc/passwd",
            "a/../../b",
            "..\\windows\\system32",
            "a/..",
            "..",
        ] {
            let err = clean_key(key).unwrap_err();
            assert!(
                matches!(err, CiError::KeyInvalid { .. }),
                "expected KeyInvalid for {key}"
            );
        }
    }

    #[test]
    fn clean_key_normalizes() {
        assert_eq!(clean_key("a//b/./c").unwrap(), "a/b/c");
        assert_eq!(clean_key("/leading/slash").unwrap(), "leading/slash");
        assert_eq!(clean_key("back\\slash\\key").unwrap(), "back/slash/key");
    }

    #[test]
    fn clean_key_rejects_empty() {
        for key in ["", "/", "./.", "//"] {
            assert!(clean_key(key).is_err(), "expected error for {key:?}");
        }
    }
}
