//! Live module dependency graph.
//!
//! One node per server-visible URL, built incrementally as requests are
//! transformed. Edges are kept symmetric: `b ∈ a.imported_modules` iff
//! `a ∈ b.importers`, restored on every update including stale-edge removal.
//! Nodes are never deleted, only invalidated.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Module flavor, which decides the HMR update kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleKind {
    #[default]
    Js,
    Css,
}

/// Cached transform output for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult {
    /// Code ready to serve.
    pub code: String,
    /// Content-Type to serve with.
    pub content_type: &'static str,
}

/// One module in the graph.
#[derive(Debug, Clone, Default)]
pub struct ModuleNode {
    /// Server-visible URL path.
    pub url: String,
    /// Absolute resolved file id, when known.
    pub id: Option<PathBuf>,
    /// Module flavor.
    pub kind: ModuleKind,
    /// URLs of modules importing this one.
    pub importers: HashSet<String>,
    /// URLs of modules this one imports.
    pub imported_modules: HashSet<String>,
    /// URLs of dependencies this module explicitly accepts updates from.
    pub accepted_hmr_deps: HashSet<String>,
    /// Whether the module declared it handles updates to itself.
    pub is_self_accepting: bool,
    /// Cached transform output.
    pub transform_result: Option<TransformResult>,
    /// Timestamp of the last invalidation, for cache-busting fetches.
    pub last_hmr_timestamp: u64,
}

/// Bidirectional module graph for one server instance.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: RwLock<HashMap<String, ModuleNode>>,
    file_to_urls: RwLock<HashMap<PathBuf, HashSet<String>>>,
}

impl ModuleGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent get-or-create for a URL, registering the file mapping when
    /// the id is known.
    pub fn ensure_entry_from_url(&self, url: &str, id: Option<&Path>, kind: ModuleKind) {
        let mut modules = self.modules.write().unwrap();
        let node = modules.entry(url.to_string()).or_insert_with(|| ModuleNode {
            url: url.to_string(),
            kind,
            ..ModuleNode::default()
        });
        if node.id.is_none() {
            if let Some(id) = id {
                node.id = Some(id.to_path_buf());
            }
        }
        drop(modules);

        if let Some(id) = id {
            let mut files = self
                .file_to_urls
                .write()
            .unwrap();
            files.entry(id.to_path_buf()).or_default().insert(url.to_string());
        }
    }

    /// Snapshot of a node.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<ModuleNode> {
        self.modules
            .read()
            .unwrap()
            .get(url)
            .cloned()
    }

    /// URLs backed by a file.
    #[must_use]
    pub fn urls_for_file(&self, file: &Path) -> Vec<String> {
        self.file_to_urls
            .read()
            .unwrap()
            .get(file)
            .map(|urls| urls.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rebuild a module's edges after a transform.
    ///
    /// The previous imported set is diffed against the fresh one: dropped
    /// imports lose their reverse edge, new imports gain both directions.
    pub fn update_module_info(
        &self,
        url: &str,
        imported_urls: &HashSet<String>,
        accepted_urls: &HashSet<String>,
        is_self_accepting: bool,
    ) {
        let mut modules = self.modules.write().unwrap();

        let prev_imports = modules
            .get(url)
            .map(|node| node.imported_modules.clone())
            .unwrap_or_default();

        for stale in prev_imports.difference(imported_urls) {
            if let Some(dep) = modules.get_mut(stale) {
                dep.importers.remove(url);
            }
        }
        for fresh in imported_urls.difference(&prev_imports) {
            let dep = modules.entry(fresh.clone()).or_insert_with(|| ModuleNode {
                url: fresh.clone(),
                ..ModuleNode::default()
            });
            dep.importers.insert(url.to_string());
        }

        let node = modules.entry(url.to_string()).or_insert_with(|| ModuleNode {
            url: url.to_string(),
            ..ModuleNode::default()
        });
        node.imported_modules = imported_urls.clone();
        node.accepted_hmr_deps = accepted_urls.clone();
        node.is_self_accepting = is_self_accepting;
    }

    /// Store a transform result for a URL.
    pub fn set_transform_result(&self, url: &str, result: TransformResult) {
        let mut modules = self.modules.write().unwrap();
        if let Some(node) = modules.get_mut(url) {
            node.transform_result = Some(result);
        }
    }

    /// Cached transform result for a URL, if still valid.
    #[must_use]
    pub fn get_transform_result(&self, url: &str) -> Option<TransformResult> {
        self.modules
            .read()
            .unwrap()
            .get(url)
            .and_then(|node| node.transform_result.clone())
    }

    /// Mark a node's kind and self-acceptance (used for CSS modules, which
    /// are self-accepting by type).
    pub fn set_module_kind(&self, url: &str, kind: ModuleKind, self_accepting: bool) {
        let mut modules = self.modules.write().unwrap();
        if let Some(node) = modules.get_mut(url) {
            node.kind = kind;
            if self_accepting {
                node.is_self_accepting = true;
            }
        }
    }

    /// Invalidate a module: clear its transform cache, bump its timestamp,
    /// and propagate to importers that do not accept the change. Carries a
    /// visited set so cyclic graphs terminate.
    ///
    /// Returns every URL invalidated.
    pub fn invalidate(&self, url: &str) -> Vec<String> {
        let mut modules = self.modules.write().unwrap();
        let mut visited = HashSet::new();
        let mut invalidated = Vec::new();
        let timestamp = now_ms();
        Self::invalidate_inner(&mut modules, url, timestamp, &mut visited, &mut invalidated);
        invalidated
    }

    fn invalidate_inner(
        modules: &mut HashMap<String, ModuleNode>,
        url: &str,
        timestamp: u64,
        visited: &mut HashSet<String>,
        invalidated: &mut Vec<String>,
    ) {
        if !visited.insert(url.to_string()) {
            return;
        }
        let importers = match modules.get_mut(url) {
            Some(node) => {
                node.transform_result = None;
                node.last_hmr_timestamp = timestamp;
                invalidated.push(url.to_string());
                node.importers.clone()
            }
            None => return,
        };
        for importer in importers {
            let accepts = modules
                .get(&importer)
                .is_some_and(|node| node.accepted_hmr_deps.contains(url));
            if !accepts {
                Self::invalidate_inner(modules, &importer, timestamp, visited, invalidated);
            }
        }
    }

    /// Total node count (diagnostics).
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules
            .read()
            .unwrap()
            .len()
    }

    /// Whether the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
