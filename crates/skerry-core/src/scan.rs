//! Lightweight import/export scanner.
//!
//! Finds import/require specifiers and summarizes export shape without full
//! parsing: comments are skipped, keywords are matched on word boundaries.
//! This is deliberately not an ECMAScript parser; it is good enough for
//! dependency discovery, graph edges and interop detection.

use std::collections::HashSet;

/// How a specifier was imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import ... from "x"` or `import "x"`.
    EsmImport,
    /// `export ... from "x"`.
    EsmExport,
    /// `require("x")`.
    CjsRequire,
    /// `import("x")`.
    DynamicImport,
}

/// Import specifier found in source code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    /// Specifier exactly as written.
    pub raw: String,
    /// Kind of import.
    pub kind: ImportKind,
    /// 1-indexed line number, best-effort.
    pub line: u32,
}

/// Export shape summary for one module, used for interop detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportsData {
    /// Whether any ESM import syntax was found.
    pub has_imports: bool,
    /// Named exports (includes `"default"` when a default export exists).
    pub exports: Vec<String>,
    /// Whether any `export ... from` re-export was found.
    pub has_re_exports: bool,
    /// Whether the module is a pure re-export facade.
    pub facade: bool,
}

/// Scan source for import/require specifiers.
///
/// Results are in first-appearance order, deduplicated by `raw`.
#[must_use]
pub fn scan_imports(source: &str) -> Vec<ImportSpec> {
    let mut results = Vec::new();
    let mut seen = HashSet::new();
    let mut line: u32 = 1;
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut i = 0;

    while i < len {
        if chars[i] == '\n' {
            line += 1;
            i += 1;
            continue;
        }

        if let Some(next) = skip_comment(&chars, i, &mut line) {
            i = next;
            continue;
        }

        if matches_keyword(&chars, i, "import") {
            let start = i;
            i += 6;
            if let Some((spec, kind, end)) = scan_import_clause(&chars, i, &mut line) {
                if !spec.is_empty() && seen.insert(spec.clone()) {
                    results.push(ImportSpec {
                        raw: spec,
                        kind,
                        line,
                    });
                }
                i = end;
                continue;
            }
            i = start + 1;
            continue;
        }

        if matches_keyword(&chars, i, "export") {
            let start = i;
            i += 6;
            if let Some((spec, end)) = scan_from_clause(&chars, i, &mut line) {
                if !spec.is_empty() && seen.insert(spec.clone()) {
                    results.push(ImportSpec {
                        raw: spec,
                        kind: ImportKind::EsmExport,
                        line,
                    });
                }
                i = end;
                continue;
            }
            i = start + 1;
            continue;
        }

        if matches_keyword(&chars, i, "require") {
            let start = i;
            i += 7;
            if let Some((spec, end)) = scan_call_argument(&chars, i) {
                if !spec.is_empty() && seen.insert(spec.clone()) {
                    results.push(ImportSpec {
                        raw: spec,
                        kind: ImportKind::CjsRequire,
                        line,
                    });
                }
                i = end;
                continue;
            }
            i = start + 1;
            continue;
        }

        i += 1;
    }

    results
}

/// Summarize the export shape of a module.
///
/// A dependency exposing no ESM import/export syntax at all is CJS/UMD and
/// needs interop shimming when consumed through `import`.
#[must_use]
pub fn scan_exports(source: &str) -> ExportsData {
    let mut data = ExportsData::default();
    let mut line: u32 = 1;
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut i = 0;
    let mut non_reexport_code = false;

    while i < len {
        if chars[i] == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if let Some(next) = skip_comment(&chars, i, &mut line) {
            i = next;
            continue;
        }

        if matches_keyword(&chars, i, "import") {
            // import( is still ESM syntax for this purpose
            data.has_imports = true;
            i += 6;
            continue;
        }

        if matches_keyword(&chars, i, "export") {
            i += 6;
            let mut j = i;
            while j < len && chars[j].is_whitespace() {
                j += 1;
            }
            if j >= len {
                break;
            }
            match chars[j] {
                '*' => {
                    data.has_re_exports = true;
                    i = end_of_statement(&chars, j + 1, &mut line);
                }
                '{' => {
                    let (names, end) = scan_brace_names(&chars, j);
                    let mut k = end;
                    while k < len && chars[k].is_whitespace() {
                        k += 1;
                    }
                    if matches_keyword(&chars, k, "from") {
                        data.has_re_exports = true;
                        i = end_of_statement(&chars, k, &mut line);
                    } else {
                        i = end;
                    }
                    for name in names {
                        push_unique(&mut data.exports, name);
                    }
                }
                _ => {
                    if matches_keyword(&chars, j, "default") {
                        push_unique(&mut data.exports, "default".to_string());
                        i = j + 7;
                    } else if let Some((name, end)) = scan_declaration_name(&chars, j) {
                        push_unique(&mut data.exports, name);
                        i = end;
                    } else {
                        i = j + 1;
                    }
                }
            }
            continue;
        }

        if !chars[i].is_whitespace() && chars[i] != ';' {
            non_reexport_code = true;
        }
        i += 1;
    }

    data.facade = data.has_re_exports && data.exports.is_empty() && !non_reexport_code;
    data
}

/// Scan a CommonJS module for statically visible export names
/// (`exports.NAME = ...` / `module.exports.NAME = ...`).
#[must_use]
pub fn scan_cjs_exports(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for rest in source.split("exports.") {
        let name: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
            .collect();
        if name.is_empty() || name == "default" {
            continue;
        }
        // Only assignments count as export definitions.
        let after = &rest[name.len()..];
        if after.trim_start().starts_with('=') && !after.trim_start().starts_with("==") {
            push_unique(&mut names, name);
        }
    }
    names
}

/// Advance past the next `;` or to the end of the line.
fn end_of_statement(chars: &[char], start: usize, line: &mut u32) -> usize {
    let len = chars.len();
    let mut i = start;
    while i < len {
        if chars[i] == ';' {
            return i + 1;
        }
        if chars[i] == '\n' {
            *line += 1;
            return i + 1;
        }
        i += 1;
    }
    len
}

fn push_unique(list: &mut Vec<String>, name: String) {
    if !list.contains(&name) {
        list.push(name);
    }
}

/// If position `i` starts a comment, skip it and return the new position.
pub(crate) fn skip_comment(chars: &[char], i: usize, line: &mut u32) -> Option<usize> {
    let len = chars.len();
    if i + 1 < len && chars[i] == '/' && chars[i + 1] == '/' {
        let mut j = i;
        while j < len && chars[j] != '\n' {
            j += 1;
        }
        return Some(j);
    }
    if i + 1 < len && chars[i] == '/' && chars[i + 1] == '*' {
        let mut j = i + 2;
        while j + 1 < len && !(chars[j] == '*' && chars[j + 1] == '/') {
            if chars[j] == '\n' {
                *line += 1;
            }
            j += 1;
        }
        return Some((j + 2).min(len));
    }
    None
}

/// Check whether `chars[pos..]` matches a keyword on word boundaries.
pub(crate) fn matches_keyword(chars: &[char], pos: usize, keyword: &str) -> bool {
    let kw: Vec<char> = keyword.chars().collect();
    let len = kw.len();

    if pos + len > chars.len() {
        return false;
    }
    if pos > 0 && (chars[pos - 1].is_alphanumeric() || chars[pos - 1] == '_' || chars[pos - 1] == '.')
    {
        return false;
    }
    for (j, &c) in kw.iter().enumerate() {
        if chars[pos + j] != c {
            return false;
        }
    }
    if pos + len < chars.len() && (chars[pos + len].is_alphanumeric() || chars[pos + len] == '_') {
        return false;
    }
    true
}

pub(crate) fn read_string(chars: &[char], start: usize) -> Option<(String, usize)> {
    let len = chars.len();
    if start >= len {
        return None;
    }
    let quote = chars[start];
    if quote != '"' && quote != '\'' && quote != '`' {
        return None;
    }
    let mut i = start + 1;
    let spec_start = i;
    while i < len && chars[i] != quote {
        if chars[i] == '\\' && i + 1 < len {
            i += 2;
            continue;
        }
        i += 1;
    }
    let spec: String = chars[spec_start..i].iter().collect();
    Some((spec, (i + 1).min(len)))
}

/// Scan the remainder of an `import` statement.
fn scan_import_clause(
    chars: &[char],
    start: usize,
    line: &mut u32,
) -> Option<(String, ImportKind, usize)> {
    let len = chars.len();
    let mut i = start;

    while i < len && chars[i].is_whitespace() {
        if chars[i] == '\n' {
            *line += 1;
        }
        i += 1;
    }

    // Dynamic import: import("...")
    if i < len && chars[i] == '(' {
        i += 1;
        while i < len && chars[i].is_whitespace() {
            if chars[i] == '\n' {
                *line += 1;
            }
            i += 1;
        }
        let (spec, end) = read_string(chars, i)?;
        return Some((spec, ImportKind::DynamicImport, end));
    }

    // Side-effect import: import "x"
    if let Some((spec, end)) = read_string(chars, i) {
        return Some((spec, ImportKind::EsmImport, end));
    }

    // import ... from "x"
    let limit = (start + 1000).min(len);
    while i < limit {
        if chars[i] == '\n' {
            *line += 1;
        }
        if matches_keyword(chars, i, "from") {
            let mut j = i + 4;
            while j < len && chars[j].is_whitespace() {
                if chars[j] == '\n' {
                    *line += 1;
                }
                j += 1;
            }
            if let Some((spec, end)) = read_string(chars, j) {
                return Some((spec, ImportKind::EsmImport, end));
            }
        }
        if chars[i] == ';' {
            break;
        }
        i += 1;
    }
    None
}

/// Scan for a `... from "x"` tail after `export`.
fn scan_from_clause(chars: &[char], start: usize, line: &mut u32) -> Option<(String, usize)> {
    let len = chars.len();
    let limit = (start + 500).min(len);
    let mut i = start;
    while i < limit {
        if chars[i] == '\n' {
            *line += 1;
        }
        if matches_keyword(chars, i, "from") {
            let mut j = i + 4;
            while j < len && chars[j].is_whitespace() {
                if chars[j] == '\n' {
                    *line += 1;
                }
                j += 1;
            }
            if let Some((spec, end)) = read_string(chars, j) {
                return Some((spec, end));
            }
        }
        if chars[i] == ';' {
            break;
        }
        i += 1;
    }
    None
}

/// Scan a `("...")` call argument.
fn scan_call_argument(chars: &[char], start: usize) -> Option<(String, usize)> {
    let len = chars.len();
    let mut i = start;
    while i < len && chars[i].is_whitespace() && chars[i] != '\n' {
        i += 1;
    }
    if i >= len || chars[i] != '(' {
        return None;
    }
    i += 1;
    while i < len && chars[i].is_whitespace() && chars[i] != '\n' {
        i += 1;
    }
    let (spec, mut end) = read_string(chars, i)?;
    while end < len && chars[end].is_whitespace() && chars[end] != '\n' {
        end += 1;
    }
    if end < len && chars[end] == ')' {
        end += 1;
    }
    Some((spec, end))
}

/// Collect identifiers inside `{ a, b as c }`. Returns exported names.
fn scan_brace_names(chars: &[char], start: usize) -> (Vec<String>, usize) {
    let len = chars.len();
    let mut i = start + 1;
    let mut names = Vec::new();
    let mut current = String::new();
    let mut renamed: Option<String> = None;

    while i < len && chars[i] != '}' {
        let c = chars[i];
        if c.is_alphanumeric() || c == '_' || c == '$' {
            current.push(c);
            i += 1;
            continue;
        }
        if current == "as" {
            renamed = Some(String::new());
            current.clear();
            i += 1;
            continue;
        }
        if !current.is_empty() {
            match renamed.take() {
                // `a as b` exports `b`; the collected ident after `as` wins
                Some(_) => names.push(std::mem::take(&mut current)),
                None if c == ',' => names.push(std::mem::take(&mut current)),
                None => {
                    // Peek: might be `a as b`
                    let mut j = i;
                    while j < len && chars[j].is_whitespace() {
                        j += 1;
                    }
                    if matches_keyword(chars, j, "as") {
                        // Skip `as`, the next ident replaces this one
                        i = j + 2;
                        current.clear();
                        renamed = Some(String::new());
                        continue;
                    }
                    names.push(std::mem::take(&mut current));
                }
            }
        }
        i += 1;
    }
    if !current.is_empty() {
        names.push(current);
    }
    (names, (i + 1).min(len))
}

/// Read the identifier after `const`/`let`/`var`/`function`/`class`/`async`.
fn scan_declaration_name(chars: &[char], start: usize) -> Option<(String, usize)> {
    let len = chars.len();
    let mut i = start;

    for kw in ["async", "const", "let", "var", "function", "class"] {
        if matches_keyword(chars, i, kw) {
            i += kw.chars().count();
            while i < len && (chars[i].is_whitespace() || chars[i] == '*') {
                i += 1;
            }
            // `async function`
            if kw == "async" && matches_keyword(chars, i, "function") {
                i += 8;
                while i < len && (chars[i].is_whitespace() || chars[i] == '*') {
                    i += 1;
                }
            }
            let mut name = String::new();
            while i < len && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                name.push(chars[i]);
                i += 1;
            }
            if name.is_empty() {
                return None;
            }
            return Some((name, i));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esm_import_from() {
        let imports = scan_imports(r#"import { foo } from "./dep";"#);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].raw, "./dep");
        assert_eq!(imports[0].kind, ImportKind::EsmImport);
    }

    #[test]
    fn side_effect_import() {
        let imports = scan_imports(r#"import "./polyfill";"#);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].raw, "./polyfill");
    }

    #[test]
    fn dynamic_import_kind() {
        let imports = scan_imports(r#"const m = await import("./lazy");"#);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].raw, "./lazy");
        assert_eq!(imports[0].kind, ImportKind::DynamicImport);
    }

    #[test]
    fn cjs_require() {
        let imports = scan_imports(r#"const dep = require("left-pad");"#);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].raw, "left-pad");
        assert_eq!(imports[0].kind, ImportKind::CjsRequire);
    }

    #[test]
    fn export_star_from() {
        let imports = scan_imports(r#"export * from "./dep";"#);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].kind, ImportKind::EsmExport);
    }

    #[test]
    fn comments_skipped() {
        let source = r#"
// import a from "commented"
/* import b from "also" */
import c from "./real";
"#;
        let imports = scan_imports(source);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].raw, "./real");
    }

    #[test]
    fn dedup_and_order() {
        let source = r#"
import a from "./a";
import b from "./b";
import c from "./a";
"#;
        let imports = scan_imports(source);
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].raw, "./a");
        assert_eq!(imports[1].raw, "./b");
    }

    #[test]
    fn scoped_specifier() {
        let imports = scan_imports(r#"import x from "@scope/pkg/deep";"#);
        assert_eq!(imports[0].raw, "@scope/pkg/deep");
    }

    #[test]
    fn exports_of_esm_module() {
        let source = r#"
import dep from "./dep";
export const foo = 1;
export default foo;
export { bar, baz as qux } from "./other";
"#;
        let data = scan_exports(source);
        assert!(data.has_imports);
        assert!(data.has_re_exports);
        assert!(data.exports.contains(&"foo".to_string()));
        assert!(data.exports.contains(&"default".to_string()));
        assert!(data.exports.contains(&"qux".to_string()));
    }

    #[test]
    fn exports_of_cjs_module() {
        let source = r#"
"use strict";
module.exports = function leftPad(str, len, ch) { return str; };
"#;
        let data = scan_exports(source);
        assert!(!data.has_imports);
        assert!(data.exports.is_empty());
        assert!(!data.has_re_exports);
    }

    #[test]
    fn facade_detection() {
        let data = scan_exports("export * from \"./impl\";\n");
        assert!(data.facade);
        let data = scan_exports("export * from \"./impl\";\nconsole.log(1);\n");
        assert!(!data.facade);
    }

    #[test]
    fn export_function_and_class() {
        let data = scan_exports("export function init() {}\nexport class App {}\n");
        assert_eq!(data.exports, vec!["init".to_string(), "App".to_string()]);
    }

    #[test]
    fn cjs_named_exports() {
        let source = r#"
exports.parse = function () {};
module.exports.stringify = stringify;
if (exports.parse === undefined) {}
"#;
        let names = scan_cjs_exports(source);
        assert_eq!(names, vec!["parse".to_string(), "stringify".to_string()]);
    }
}
