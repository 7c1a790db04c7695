//! Static dependency discovery.
//!
//! Crawls the configured entry points (HTML entries or explicit files)
//! through the same import/resolve machinery used for live requests, in scan
//! mode, collecting every bare specifier whose resolved target lives in a
//! package root.

use crate::config::{is_js_path, DevConfig};
use crate::resolver::{is_bare_specifier, ResolutionKind, Resolved, ResolveOpts, Resolver};
use crate::scan::{scan_imports, ImportKind};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Discover bare dependencies reachable from the configured entries.
///
/// Returns `specifier -> resolved source entry`.
#[must_use]
pub fn scan_entries(config: &DevConfig, resolver: &Resolver) -> HashMap<String, PathBuf> {
    let mut discovered = HashMap::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    let mut visited: HashSet<PathBuf> = HashSet::new();

    for entry in entry_files(config) {
        if entry.extension().and_then(|e| e.to_str()) == Some("html") {
            if let Ok(html) = std::fs::read_to_string(&entry) {
                for src in extract_module_scripts(&html) {
                    let resolved = resolver.resolve(
                        &src,
                        Some(&entry),
                        ResolveOpts {
                            kind: ResolutionKind::Import,
                        },
                    );
                    if let Resolved::Id(path) = resolved {
                        queue.push_back(path);
                    }
                }
            }
        } else {
            queue.push_back(entry);
        }
    }

    while let Some(file) = queue.pop_front() {
        if !visited.insert(file.clone()) {
            continue;
        }
        let Ok(source) = std::fs::read_to_string(&file) else {
            continue;
        };
        for import in scan_imports(&source) {
            let kind = match import.kind {
                ImportKind::CjsRequire => ResolutionKind::Require,
                _ => ResolutionKind::Import,
            };
            let opts = ResolveOpts { kind };
            if is_bare_specifier(&import.raw) {
                match resolver.resolve(&import.raw, Some(&file), opts) {
                    Resolved::Id(path) => {
                        if in_node_modules(&path) {
                            discovered.entry(import.raw.clone()).or_insert(path);
                        } else if is_js_path(&path) {
                            // Workspace-linked source; keep crawling
                            queue.push_back(path);
                        }
                    }
                    Resolved::External | Resolved::NotFound => {}
                }
            } else if let Resolved::Id(path) = resolver.resolve(&import.raw, Some(&file), opts) {
                if is_js_path(&path) && !in_node_modules(&path) {
                    queue.push_back(path);
                }
            }
        }
    }

    discovered
}

/// Entry files for the scan: the configured entries, falling back to any
/// top-level HTML file.
fn entry_files(config: &DevConfig) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = config
        .entries
        .iter()
        .map(|e| config.root.join(e))
        .filter(|p| p.is_file())
        .collect();

    if entries.is_empty() {
        for item in WalkDir::new(&config.root)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) == Some("html") {
                entries.push(path.to_path_buf());
            }
        }
    }
    entries
}

fn in_node_modules(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == "node_modules")
}

/// Extract `src` attributes of `<script type="module">` tags.
#[must_use]
pub fn extract_module_scripts(html: &str) -> Vec<String> {
    let mut sources = Vec::new();
    let mut rest = html;
    while let Some(start) = rest.find("<script") {
        let tag_rest = &rest[start..];
        let Some(end) = tag_rest.find('>') else {
            break;
        };
        let tag = &tag_rest[..end];
        if tag_attr(tag, "type").as_deref() == Some("module") {
            if let Some(src) = tag_attr(tag, "src") {
                sources.push(src);
            }
        }
        rest = &tag_rest[end..];
    }
    sources
}

/// Pull one attribute value out of a tag snippet.
fn tag_attr(tag: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=");
    let mut search = tag;
    loop {
        let idx = search.find(&needle)?;
        // Attribute names must not be a suffix of a longer name
        let at_boundary = idx == 0
            || search[..idx]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace);
        let after = &search[idx + needle.len()..];
        if !at_boundary {
            search = after;
            continue;
        }
        let quote = after.chars().next()?;
        if quote != '"' && quote != '\'' {
            search = after;
            continue;
        }
        let value = &after[1..];
        let close = value.find(quote)?;
        return Some(value[..close].to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageCache;
    use serde_json::json;
    use std::sync::Arc;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn extracts_module_scripts() {
        let html = r#"
<!doctype html>
<html>
  <body>
    <script type="module" src="/src/main.ts"></script>
    <script src="/legacy.js"></script>
    <script type="module" src='./other.js'></script>
  </body>
</html>
"#;
        let scripts = extract_module_scripts(html);
        assert_eq!(scripts, vec!["/src/main.ts".to_string(), "./other.js".to_string()]);
    }

    #[test]
    fn crawl_discovers_bare_deps() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        write(
            &root.join("index.html"),
            r#"<script type="module" src="/src/main.ts"></script>"#,
        );
        write(
            &root.join("src/main.ts"),
            "import pad from \"left-pad\";\nimport { helper } from \"./util\";\n",
        );
        write(&root.join("src/util.ts"), "import \"modpkg\";\nexport const helper = 1;\n");

        let pad = root.join("node_modules/left-pad");
        write(
            &pad.join("package.json"),
            &json!({"name": "left-pad", "main": "index.js"}).to_string(),
        );
        write(&pad.join("index.js"), "module.exports = function () {};\n");

        let modpkg = root.join("node_modules/modpkg");
        write(
            &modpkg.join("package.json"),
            &json!({"name": "modpkg", "exports": {".": "./index.mjs"}}).to_string(),
        );
        write(&modpkg.join("index.mjs"), "export default 1;\n");

        let config = crate::config::DevConfig::new(root.to_path_buf());
        let resolver = Resolver::new(&config, Arc::new(PackageCache::new()));
        let discovered = scan_entries(&config, &resolver);

        assert_eq!(discovered.len(), 2);
        assert!(discovered.contains_key("left-pad"));
        assert!(discovered.contains_key("modpkg"));
        assert!(discovered["left-pad"].ends_with("left-pad/index.js"));
    }

    #[test]
    fn missing_deps_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write(&root.join("main.ts"), "import \"ghost-pkg\";\n");

        let config =
            crate::config::DevConfig::new(root.to_path_buf()).with_entries(vec!["main.ts".into()]);
        let resolver = Resolver::new(&config, Arc::new(PackageCache::new()));
        let discovered = scan_entries(&config, &resolver);
        assert!(discovered.is_empty());
    }
}
