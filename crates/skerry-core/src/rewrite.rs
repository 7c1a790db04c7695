//! Import specifier rewriting.
//!
//! Turns the import graph of a served module into URLs the browser can fetch
//! back from the server: bare specifiers point into the pre-bundled dep
//! cache, project files become root-relative paths, files outside the root
//! are served through `/@fs`, and static assets gain an `?import` suffix so
//! they come back as JS modules. Also extracts `import.meta.hot.accept`
//! declarations so the graph knows each module's HMR acceptance.

use crate::config::is_asset_path;
use crate::optimizer::DepsOptimizer;
use crate::resolver::{is_bare_specifier, ResolutionKind, Resolved, ResolveOpts, Resolver};
use crate::scan::{matches_keyword, read_string, skip_comment, ImportKind};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// URL prefix for pre-bundled dependency artifacts.
pub const DEPS_URL_PREFIX: &str = "/@deps/";

/// URL prefix for files outside the project root.
pub const FS_URL_PREFIX: &str = "/@fs";

/// Result of rewriting one module's source.
#[derive(Debug, Default)]
pub struct RewriteOutput {
    /// Code with specifiers replaced by server URLs.
    pub code: String,
    /// URLs this module imports, for the module graph.
    pub imported_urls: HashSet<String>,
    /// URLs of dependencies this module accepts HMR updates from.
    pub accepted_urls: HashSet<String>,
    /// Whether the module declared a self-accepting HMR handler.
    pub is_self_accepting: bool,
}

/// One specifier occurrence with enough span information to splice a
/// replacement in place.
#[derive(Debug)]
struct SpecSpan {
    /// Char index of the statement keyword (`import`, `export`, `require`).
    stmt_start: usize,
    /// First char of the specifier, inside the quotes.
    spec_start: usize,
    /// Char index of the closing quote.
    spec_end: usize,
    raw: String,
    kind: ImportKind,
    /// Import clause between `import` and `from`, when present.
    clause: Option<String>,
}

/// Per-server import rewriter.
#[derive(Debug)]
pub struct ImportRewriter {
    root: PathBuf,
}

impl ImportRewriter {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Rewrite every import in `code`, resolving against `importer`.
    ///
    /// Specifiers that cannot be resolved are left untouched so the browser
    /// surfaces the failure where it happened.
    pub fn rewrite(
        &self,
        code: &str,
        importer: &Path,
        resolver: &Resolver,
        optimizer: Option<&Arc<DepsOptimizer>>,
    ) -> RewriteOutput {
        let chars: Vec<char> = code.chars().collect();
        let spans = collect_spec_spans(&chars);
        let accepts = scan_hot_accepts(&chars);

        // Import rewrites and accept-argument rewrites splice the same
        // buffer; merge them into one ordered edit list. Accept arguments
        // are plain strings to the import scanner, so the two never overlap.
        let mut edits: Vec<Edit<'_>> = spans.iter().map(Edit::Import).collect();
        edits.extend(accepts.deps.iter().map(Edit::Accept));
        edits.sort_by_key(Edit::position);

        let mut out = String::with_capacity(code.len());
        let mut imported_urls = HashSet::new();
        let mut accepted_urls = HashSet::new();
        let mut cursor = 0usize;
        let mut interop_counter = 0usize;

        for edit in edits {
            match edit {
                Edit::Import(span) => {
                    let Some(target) =
                        self.map_specifier(&span.raw, span.kind, importer, resolver, optimizer)
                    else {
                        continue;
                    };
                    imported_urls.insert(target.graph_url.clone());

                    let interop_clause = if target.needs_interop && span.kind == ImportKind::EsmImport
                    {
                        span.clause
                            .as_deref()
                            .and_then(parse_import_clause)
                            .filter(|c| !c.named.is_empty() || c.namespace.is_some())
                    } else {
                        None
                    };

                    if let Some(clause) = interop_clause {
                        // Named/namespace imports from a CJS dep go through
                        // the artifact's default binding.
                        let text: String = chars[cursor..span.stmt_start].iter().collect();
                        out.push_str(&text);
                        out.push_str(&interop_import(&clause, &target.serve_url, interop_counter));
                        interop_counter += 1;
                        cursor = (span.spec_end + 1).min(chars.len());
                    } else {
                        let text: String = chars[cursor..span.spec_start].iter().collect();
                        out.push_str(&text);
                        out.push_str(&target.serve_url);
                        cursor = span.spec_end;
                    }
                }
                Edit::Accept(dep) => {
                    // Accepted dep specifiers must match the URLs the server
                    // sends in update payloads.
                    let Some(target) = self.map_specifier(
                        &dep.raw,
                        ImportKind::EsmImport,
                        importer,
                        resolver,
                        optimizer,
                    ) else {
                        continue;
                    };
                    let text: String = chars[cursor..dep.spec_start].iter().collect();
                    out.push_str(&text);
                    out.push_str(&target.graph_url);
                    cursor = dep.spec_end;
                    accepted_urls.insert(target.graph_url);
                }
            }
        }
        let tail: String = chars[cursor..].iter().collect();
        out.push_str(&tail);

        RewriteOutput {
            code: out,
            imported_urls,
            accepted_urls,
            is_self_accepting: accepts.self_accepting,
        }
    }

    /// Map one specifier to server URLs. `None` means leave it alone
    /// (external scheme or unresolvable).
    fn map_specifier(
        &self,
        raw: &str,
        kind: ImportKind,
        importer: &Path,
        resolver: &Resolver,
        optimizer: Option<&Arc<DepsOptimizer>>,
    ) -> Option<RewriteTarget> {
        let resolution_kind = match kind {
            ImportKind::CjsRequire => ResolutionKind::Require,
            _ => ResolutionKind::Import,
        };

        if is_bare_specifier(raw) {
            if let Some(optimizer) = optimizer {
                let resolved =
                    resolver.resolve_for_serve(raw, Some(importer), resolution_kind, optimizer);
                let path = match resolved {
                    Resolved::Id(path) => path,
                    Resolved::External | Resolved::NotFound => return None,
                };
                if optimizer.is_optimized_file(&path) {
                    let info = optimizer.dep_info(raw);
                    let file_name = path.file_name()?.to_str()?.to_string();
                    let graph_url = format!("{DEPS_URL_PREFIX}{file_name}");
                    let serve_url = match info.as_ref().and_then(|i| i.file_hash.as_deref()) {
                        Some(hash) => format!("{graph_url}?v={hash}"),
                        None => graph_url.clone(),
                    };
                    return Some(RewriteTarget {
                        serve_url,
                        graph_url,
                        needs_interop: info
                            .and_then(|i| i.needs_interop)
                            .unwrap_or(false),
                    });
                }
                let url = self.to_url(&path);
                return Some(RewriteTarget {
                    serve_url: url.clone(),
                    graph_url: url,
                    needs_interop: false,
                });
            }
        }

        let resolved = resolver.resolve(
            raw,
            Some(importer),
            ResolveOpts {
                kind: resolution_kind,
            },
        );
        let path = match resolved {
            Resolved::Id(path) => path,
            Resolved::External | Resolved::NotFound => return None,
        };
        let mut url = self.to_url(&path);
        if is_asset_path(&path) {
            url.push_str("?import");
        }
        Some(RewriteTarget {
            serve_url: url.clone(),
            graph_url: url,
            needs_interop: false,
        })
    }

    /// Server URL for an absolute file path.
    fn to_url(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) => format!("/{}", rel.display()).replace('\\', "/"),
            Err(_) => format!("{FS_URL_PREFIX}{}", path.display()),
        }
    }
}

#[derive(Debug)]
struct RewriteTarget {
    serve_url: String,
    graph_url: String,
    needs_interop: bool,
}

/// Parsed `import` clause: `default, { a as b }`, `* as ns`, etc.
#[derive(Debug, Default)]
struct ImportClause {
    default: Option<String>,
    /// Destructure bindings, already in object-pattern form (`a` or `a: b`).
    named: Vec<String>,
    namespace: Option<String>,
}

/// Rewritten statement for named/namespace imports of a CJS dep.
fn interop_import(clause: &ImportClause, url: &str, counter: usize) -> String {
    let var = format!("__skerry_cjs_{counter}");
    let mut parts = vec![format!("import {var} from \"{url}\"")];
    if let Some(default) = &clause.default {
        parts.push(format!("const {default} = {var}"));
    }
    if let Some(ns) = &clause.namespace {
        parts.push(format!("const {ns} = {var}"));
    }
    if !clause.named.is_empty() {
        parts.push(format!("const {{ {} }} = {var}", clause.named.join(", ")));
    }
    parts.join("; ")
}

fn parse_import_clause(clause: &str) -> Option<ImportClause> {
    let mut out = ImportClause::default();
    let mut rest = clause.trim();

    if !rest.starts_with(['{', '*']) {
        // Leading default binding
        let end = rest.find([',', '{']).unwrap_or(rest.len());
        let default = rest[..end].trim().trim_end_matches(',').trim();
        if !default.is_empty() {
            out.default = Some(default.to_string());
        }
        rest = rest[end..].trim_start_matches(',').trim();
    }

    if let Some(ns) = rest.strip_prefix('*') {
        let ns = ns.trim().strip_prefix("as")?.trim();
        if ns.is_empty() {
            return None;
        }
        out.namespace = Some(ns.to_string());
        return Some(out);
    }

    if let Some(body) = rest.strip_prefix('{') {
        let body = body.strip_suffix('}').unwrap_or(body);
        for binding in body.split(',') {
            let binding = binding.trim();
            if binding.is_empty() {
                continue;
            }
            match binding.split_once(" as ") {
                Some((name, local)) => {
                    out.named.push(format!("{}: {}", name.trim(), local.trim()));
                }
                None => out.named.push(binding.to_string()),
            }
        }
    }
    Some(out)
}

/// Locate every rewritable specifier with its span.
fn collect_spec_spans(chars: &[char]) -> Vec<SpecSpan> {
    let len = chars.len();
    let mut spans = Vec::new();
    let mut line: u32 = 1;
    let mut i = 0;

    while i < len {
        if chars[i] == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if let Some(next) = skip_comment(chars, i, &mut line) {
            i = next;
            continue;
        }
        // Skip string literals so their contents are never rewritten;
        // specifier strings are consumed by the span scanners below before
        // this branch ever sees them.
        if matches!(chars[i], '"' | '\'' | '`') {
            if let Some((_, end)) = read_string(chars, i) {
                i = end;
                continue;
            }
        }

        if matches_keyword(chars, i, "import") {
            if let Some(span) = scan_import_span(chars, i) {
                i = span.spec_end + 1;
                spans.push(span);
                continue;
            }
            i += 6;
            continue;
        }
        if matches_keyword(chars, i, "export") {
            if let Some(span) = scan_export_span(chars, i) {
                i = span.spec_end + 1;
                spans.push(span);
                continue;
            }
            i += 6;
            continue;
        }
        if matches_keyword(chars, i, "require") {
            if let Some(span) = scan_require_span(chars, i) {
                i = span.spec_end + 1;
                spans.push(span);
                continue;
            }
            i += 7;
            continue;
        }
        i += 1;
    }
    spans
}

fn string_span(chars: &[char], quote_pos: usize) -> Option<(String, usize, usize)> {
    let (raw, end) = read_string(chars, quote_pos)?;
    // end is one past the closing quote
    Some((raw, quote_pos + 1, end - 1))
}

fn scan_import_span(chars: &[char], start: usize) -> Option<SpecSpan> {
    let len = chars.len();
    let mut i = start + 6;
    while i < len && chars[i].is_whitespace() {
        i += 1;
    }
    if i >= len {
        return None;
    }

    // Dynamic import: import("x")
    if chars[i] == '(' {
        i += 1;
        while i < len && chars[i].is_whitespace() {
            i += 1;
        }
        let (raw, spec_start, spec_end) = string_span(chars, i)?;
        return Some(SpecSpan {
            stmt_start: start,
            spec_start,
            spec_end,
            raw,
            kind: ImportKind::DynamicImport,
            clause: None,
        });
    }

    // Side-effect import: import "x"
    if let Some((raw, spec_start, spec_end)) = string_span(chars, i) {
        return Some(SpecSpan {
            stmt_start: start,
            spec_start,
            spec_end,
            raw,
            kind: ImportKind::EsmImport,
            clause: None,
        });
    }

    // import <clause> from "x"
    let clause_start = i;
    let limit = (start + 1000).min(len);
    while i < limit {
        if matches_keyword(chars, i, "from") {
            let clause: String = chars[clause_start..i].iter().collect();
            let mut j = i + 4;
            while j < len && chars[j].is_whitespace() {
                j += 1;
            }
            let (raw, spec_start, spec_end) = string_span(chars, j)?;
            return Some(SpecSpan {
                stmt_start: start,
                spec_start,
                spec_end,
                raw,
                kind: ImportKind::EsmImport,
                clause: Some(clause),
            });
        }
        if chars[i] == ';' {
            return None;
        }
        i += 1;
    }
    None
}

fn scan_export_span(chars: &[char], start: usize) -> Option<SpecSpan> {
    let len = chars.len();
    let limit = (start + 500).min(len);
    let mut i = start + 6;
    while i < limit {
        if matches_keyword(chars, i, "from") {
            let mut j = i + 4;
            while j < len && chars[j].is_whitespace() {
                j += 1;
            }
            let (raw, spec_start, spec_end) = string_span(chars, j)?;
            return Some(SpecSpan {
                stmt_start: start,
                spec_start,
                spec_end,
                raw,
                kind: ImportKind::EsmExport,
                clause: None,
            });
        }
        if chars[i] == ';' || chars[i] == '\n' {
            return None;
        }
        i += 1;
    }
    None
}

fn scan_require_span(chars: &[char], start: usize) -> Option<SpecSpan> {
    let len = chars.len();
    let mut i = start + 7;
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
    let (raw, spec_start, spec_end) = string_span(chars, i)?;
    Some(SpecSpan {
        stmt_start: start,
        spec_start,
        spec_end,
        raw,
        kind: ImportKind::CjsRequire,
        clause: None,
    })
}

/// One edit to splice into the output buffer.
enum Edit<'a> {
    Import(&'a SpecSpan),
    Accept(&'a AcceptRef),
}

impl Edit<'_> {
    fn position(&self) -> usize {
        match self {
            Edit::Import(span) => span.spec_start,
            Edit::Accept(dep) => dep.spec_start,
        }
    }
}

/// A string argument of `import.meta.hot.accept`, with its span.
#[derive(Debug)]
struct AcceptRef {
    raw: String,
    spec_start: usize,
    spec_end: usize,
}

#[derive(Debug, Default)]
struct HotAccepts {
    self_accepting: bool,
    deps: Vec<AcceptRef>,
}

/// Extract `import.meta.hot.accept(...)` declarations.
///
/// A call with no argument or a callback first argument marks the module
/// self-accepting; a string or array first argument lists accepted deps.
fn scan_hot_accepts(chars: &[char]) -> HotAccepts {
    const NEEDLE: &str = "import.meta.hot.accept";
    let needle: Vec<char> = NEEDLE.chars().collect();
    let len = chars.len();
    let mut out = HotAccepts::default();
    let mut line: u32 = 1;
    let mut i = 0;

    'outer: while i + needle.len() <= len {
        if let Some(next) = skip_comment(chars, i, &mut line) {
            i = next;
            continue;
        }
        for (j, &c) in needle.iter().enumerate() {
            if chars[i + j] != c {
                i += 1;
                continue 'outer;
            }
        }
        let mut j = i + needle.len();
        while j < len && chars[j].is_whitespace() {
            j += 1;
        }
        if j >= len || chars[j] != '(' {
            i += needle.len();
            continue;
        }
        j += 1;
        while j < len && chars[j].is_whitespace() {
            j += 1;
        }
        if j >= len {
            break;
        }
        match chars[j] {
            ')' => out.self_accepting = true,
            '"' | '\'' | '`' => {
                if let Some((raw, end)) = read_string(chars, j) {
                    out.deps.push(AcceptRef {
                        raw,
                        spec_start: j + 1,
                        spec_end: end - 1,
                    });
                }
            }
            '[' => {
                let mut k = j + 1;
                while k < len && chars[k] != ']' {
                    if matches!(chars[k], '"' | '\'' | '`') {
                        if let Some((raw, end)) = read_string(chars, k) {
                            out.deps.push(AcceptRef {
                                raw,
                                spec_start: k + 1,
                                spec_end: end - 1,
                            });
                            k = end;
                            continue;
                        }
                    }
                    k += 1;
                }
            }
            _ => out.self_accepting = true,
        }
        i = j + 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevConfig;
    use crate::optimizer::{DepsOptimizer, ProxyBundler};
    use crate::packages::PackageCache;
    use serde_json::json;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        resolver: Arc<Resolver>,
        optimizer: Arc<DepsOptimizer>,
        rewriter: ImportRewriter,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(tmp.path()).unwrap();

        write(
            &root.join("index.html"),
            r#"<script type="module" src="/src/main.ts"></script>"#,
        );
        write(&root.join("src/main.ts"), "import pad from \"left-pad\";\n");
        write(&root.join("src/util.ts"), "export const helper = 1;\n");
        write(&root.join("src/style.css"), "body { margin: 0 }\n");
        write(&root.join("src/logo.svg"), "<svg/>");

        let pad = root.join("node_modules/left-pad");
        write(
            &pad.join("package.json"),
            &json!({"name": "left-pad", "main": "index.js"}).to_string(),
        );
        write(
            &pad.join("index.js"),
            "module.exports = function () {};\nexports.pad = function () {};\n",
        );

        let config = DevConfig::new(root.clone()).with_crawl_debounce_ms(10);
        let resolver = Arc::new(Resolver::new(&config, Arc::new(PackageCache::new())));
        let optimizer = DepsOptimizer::new(
            config.clone(),
            Arc::clone(&resolver),
            Box::new(ProxyBundler::new()),
            None,
        );
        optimizer.init().unwrap();

        Fixture {
            rewriter: ImportRewriter::new(root.clone()),
            root,
            resolver,
            optimizer,
            _tmp: tmp,
        }
    }

    #[test]
    fn bare_import_points_into_dep_cache() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let out = f.rewriter.rewrite(
            "import pad from \"left-pad\";\npad();\n",
            &importer,
            &f.resolver,
            Some(&f.optimizer),
        );
        assert!(out.code.contains("/@deps/left-pad.js?v="), "{}", out.code);
        assert!(out.imported_urls.contains("/@deps/left-pad.js"));
    }

    #[test]
    fn named_cjs_import_gets_interop_shim() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let out = f.rewriter.rewrite(
            "import { pad } from \"left-pad\";\n",
            &importer,
            &f.resolver,
            Some(&f.optimizer),
        );
        assert!(out.code.contains("import __skerry_cjs_0 from \"/@deps/left-pad.js"));
        assert!(out.code.contains("const { pad } = __skerry_cjs_0"));
    }

    #[test]
    fn renamed_cjs_import_destructures_with_rename() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let out = f.rewriter.rewrite(
            "import def, { pad as p } from \"left-pad\";\n",
            &importer,
            &f.resolver,
            Some(&f.optimizer),
        );
        assert!(out.code.contains("const def = __skerry_cjs_0"));
        assert!(out.code.contains("const { pad: p } = __skerry_cjs_0"));
    }

    #[test]
    fn relative_import_becomes_root_relative_url() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let out = f.rewriter.rewrite(
            "import { helper } from \"./util\";\n",
            &importer,
            &f.resolver,
            Some(&f.optimizer),
        );
        assert!(out.code.contains("from \"/src/util.ts\""), "{}", out.code);
        assert!(out.imported_urls.contains("/src/util.ts"));
    }

    #[test]
    fn asset_import_gets_import_query() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let out = f.rewriter.rewrite(
            "import logo from \"./logo.svg\";\n",
            &importer,
            &f.resolver,
            Some(&f.optimizer),
        );
        assert!(out.code.contains("\"/src/logo.svg?import\""), "{}", out.code);
    }

    #[test]
    fn externals_and_unresolved_left_alone() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let code = "import \"https://cdn.example.com/x.js\";\nimport fs from \"node:fs\";\nimport g from \"ghost-pkg\";\n";
        let out = f
            .rewriter
            .rewrite(code, &importer, &f.resolver, Some(&f.optimizer));
        assert!(out.code.contains("https://cdn.example.com/x.js"));
        assert!(out.code.contains("node:fs"));
        assert!(out.code.contains("\"ghost-pkg\""));
    }

    #[test]
    fn strings_in_plain_code_untouched() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let out = f.rewriter.rewrite(
            "const label = \"./util\";\nconsole.log(label);\n",
            &importer,
            &f.resolver,
            Some(&f.optimizer),
        );
        assert!(out.code.contains("\"./util\""));
        assert!(out.imported_urls.is_empty());
    }

    #[test]
    fn hot_accept_callback_is_self_accepting() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let out = f.rewriter.rewrite(
            "export const x = 1;\nif (import.meta.hot) {\n  import.meta.hot.accept(() => {});\n}\n",
            &importer,
            &f.resolver,
            Some(&f.optimizer),
        );
        assert!(out.is_self_accepting);
        assert!(out.accepted_urls.is_empty());
    }

    #[test]
    fn hot_accept_deps_are_resolved() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let out = f.rewriter.rewrite(
            "import.meta.hot.accept([\"./util\", \"./style.css\"], () => {});\n",
            &importer,
            &f.resolver,
            Some(&f.optimizer),
        );
        assert!(!out.is_self_accepting);
        assert!(out.accepted_urls.contains("/src/util.ts"));
        assert!(out.accepted_urls.contains("/src/style.css"));
        // The argument strings are rewritten so the client's accept list
        // matches the acceptedPath the server sends
        assert!(out.code.contains("[\"/src/util.ts\", \"/src/style.css\"]"), "{}", out.code);
    }

    #[test]
    fn dynamic_import_rewritten() {
        let f = fixture();
        let importer = f.root.join("src/main.ts");
        let out = f.rewriter.rewrite(
            "const mod = await import(\"./util\");\n",
            &importer,
            &f.resolver,
            Some(&f.optimizer),
        );
        assert!(out.code.contains("import(\"/src/util.ts\")"), "{}", out.code);
    }

    #[test]
    fn file_outside_root_uses_fs_prefix() {
        let f = fixture();
        write(&f.root.join("shared.ts"), "export const shared = 1;\n");

        // A server rooted at src/ sees ../shared.ts as outside its root
        let root = f.root.join("src");
        let config = DevConfig::new(root.clone());
        let resolver = Resolver::new(&config, Arc::new(PackageCache::new()));
        let rewriter = ImportRewriter::new(root.clone());
        let out = rewriter.rewrite(
            "import { shared } from \"../shared\";\n",
            &root.join("main.ts"),
            &resolver,
            None,
        );
        let expected = format!("\"{FS_URL_PREFIX}{}\"", f.root.join("shared.ts").display());
        assert!(out.code.contains(&expected), "{}", out.code);
    }
}
