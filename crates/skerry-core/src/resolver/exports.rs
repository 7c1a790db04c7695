//! package.json `exports` map evaluation.
//!
//! Supports string shorthand, the `.` root key, subpath keys, single-`*`
//! pattern keys with longest-prefix specificity, and conditional objects
//! (`browser` / `import` / `require` / `default`). Targets must be
//! package-relative (`./...`) and must not escape the package directory.

use serde_json::Value;

/// Resolution context: how the importer consumes the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionKind {
    /// ESM `import` (also used for HTML script entries).
    #[default]
    Import,
    /// CJS `require`.
    Require,
    /// Unknown context (scan fallback).
    Unknown,
}

impl ResolutionKind {
    /// Condition names tried in order for this kind. `browser` always wins
    /// because the serve target is a browser.
    #[must_use]
    pub fn conditions(self) -> &'static [&'static str] {
        match self {
            Self::Import => &["browser", "import", "default"],
            Self::Require => &["browser", "require", "default"],
            Self::Unknown => &["browser", "default", "import", "require"],
        }
    }
}

/// Resolve a subpath (`"."` or `"./sub/path"`) against an `exports` value.
///
/// Returns the package-relative target (`"./lib/x.js"`), or `None` when the
/// subpath is not declared or every matching target is invalid.
#[must_use]
pub fn resolve_exports(exports: &Value, subpath: &str, kind: ResolutionKind) -> Option<String> {
    if subpath == "." {
        return resolve_root(exports, kind);
    }

    let map = exports.as_object()?;
    // A map with no "./" keys is a root-only conditions object
    if !map.keys().any(|k| k.starts_with('.')) {
        return None;
    }

    if let Some(target) = map.get(subpath) {
        return resolve_target(target, kind, None);
    }

    resolve_pattern(map, subpath, kind)
}

/// Resolve the package root (`"."`).
fn resolve_root(exports: &Value, kind: ResolutionKind) -> Option<String> {
    match exports {
        // "exports": "./index.js"
        Value::String(_) => resolve_target(exports, kind, None),
        Value::Object(map) => {
            if let Some(dot) = map.get(".") {
                return resolve_target(dot, kind, None);
            }
            // Root conditions object: { "import": "./a.mjs", ... }
            if !map.keys().any(|k| k.starts_with('.')) {
                return resolve_target(exports, kind, None);
            }
            None
        }
        _ => None,
    }
}

/// Match `subpath` against `*` pattern keys, most specific (longest key
/// prefix, then longest key) first.
fn resolve_pattern(
    map: &serde_json::Map<String, Value>,
    subpath: &str,
    kind: ResolutionKind,
) -> Option<String> {
    let mut keys: Vec<&String> = map
        .keys()
        .filter(|k| k.starts_with("./") && k.matches('*').count() == 1)
        .collect();
    keys.sort_by(|a, b| {
        let a_prefix = a.split('*').next().unwrap_or("").len();
        let b_prefix = b.split('*').next().unwrap_or("").len();
        b_prefix.cmp(&a_prefix).then(b.len().cmp(&a.len()))
    });

    for key in keys {
        let star = key.find('*')?;
        let (prefix, suffix) = (&key[..star], &key[star + 1..]);
        if subpath.len() >= prefix.len() + suffix.len()
            && subpath.starts_with(prefix)
            && subpath.ends_with(suffix)
        {
            let matched = &subpath[prefix.len()..subpath.len() - suffix.len()];
            return resolve_target(map.get(key)?, kind, Some(matched));
        }
    }
    None
}

/// Resolve a target value: a string, a conditions object, or an array of
/// fallbacks. `star` substitutes into `*` occurrences in string targets.
fn resolve_target(target: &Value, kind: ResolutionKind, star: Option<&str>) -> Option<String> {
    match target {
        Value::String(s) => {
            let substituted = match star {
                Some(m) => s.replace('*', m),
                None => s.clone(),
            };
            validate_target(&substituted)
        }
        Value::Object(map) => {
            for condition in kind.conditions() {
                if let Some(nested) = map.get(*condition) {
                    if let Some(resolved) = resolve_target(nested, kind, star) {
                        return Some(resolved);
                    }
                }
            }
            None
        }
        Value::Array(targets) => targets
            .iter()
            .find_map(|t| resolve_target(t, kind, star)),
        // null disables the subpath
        _ => None,
    }
}

/// Targets must stay inside the package: start with `./`, no `..` segments.
fn validate_target(target: &str) -> Option<String> {
    if !target.starts_with("./") {
        return None;
    }
    if target.split('/').any(|seg| seg == "..") {
        return None;
    }
    Some(target.to_string())
}
