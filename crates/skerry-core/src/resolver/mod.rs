//! Node-style module resolution.
//!
//! Turns an import specifier plus importer into an absolute file id.
//! Relative and absolute specifiers are probed on disk with extension and
//! index fallbacks; bare specifiers walk `node_modules` upward and follow
//! package.json `exports` maps with a legacy `main`/`module` fallback.

pub mod exports;

pub use exports::{resolve_exports, ResolutionKind};

use crate::config::{is_js_path, DevConfig, DEFAULT_EXTENSIONS};
use crate::optimizer::DepsOptimizer;
use crate::packages::PackageCache;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Absolute file id.
    Id(PathBuf),
    /// Externalized specifier (schemes the browser handles itself).
    External,
    /// Nothing found; non-fatal, surfaces as a request-level error.
    NotFound,
}

impl Resolved {
    /// The resolved path, if any.
    #[must_use]
    pub fn id(&self) -> Option<&Path> {
        match self {
            Self::Id(path) => Some(path),
            _ => None,
        }
    }
}

/// Per-call resolution options.
///
/// Scan-mode resolution has no optimizer side effects because the scan goes
/// through [`Resolver::resolve`] directly; only [`Resolver::resolve_for_serve`]
/// registers dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOpts {
    /// Importer context (ESM vs CJS) for conditional exports.
    pub kind: ResolutionKind,
}

/// Per-server resolver. Holds no global state; everything is threaded in.
#[derive(Debug)]
pub struct Resolver {
    root: PathBuf,
    preserve_symlinks: bool,
    extensions: Vec<String>,
    packages: Arc<PackageCache>,
}

impl Resolver {
    /// Create a resolver for the given server config.
    #[must_use]
    pub fn new(config: &DevConfig, packages: Arc<PackageCache>) -> Self {
        Self {
            root: config.root.clone(),
            preserve_symlinks: config.preserve_symlinks,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| (*e).to_string()).collect(),
            packages,
        }
    }

    /// The project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a specifier from an importer file.
    #[must_use]
    pub fn resolve(&self, specifier: &str, importer: Option<&Path>, opts: ResolveOpts) -> Resolved {
        if specifier.is_empty() {
            return Resolved::NotFound;
        }

        if specifier.contains("://") || specifier.starts_with("node:") || specifier.starts_with("data:")
        {
            return Resolved::External;
        }

        let result = if let Some(rest) = specifier.strip_prefix('/') {
            // Root-relative URL path
            self.resolve_path(&self.root.join(rest))
                .map_or(Resolved::NotFound, Resolved::Id)
        } else if specifier.starts_with("./") || specifier.starts_with("../") {
            match importer.and_then(Path::parent) {
                Some(dir) => self
                    .resolve_path(&dir.join(specifier))
                    .map_or(Resolved::NotFound, Resolved::Id),
                None => Resolved::NotFound,
            }
        } else if Path::new(specifier).is_absolute() {
            self.resolve_path(Path::new(specifier))
                .map_or(Resolved::NotFound, Resolved::Id)
        } else {
            self.resolve_bare(specifier, importer, opts)
        };

        if result == Resolved::NotFound {
            tracing::warn!(
                specifier,
                importer = %importer.map_or_else(|| "<none>".to_string(), |p| p.display().to_string()),
                "failed to resolve"
            );
        }
        result
    }

    /// Resolve during live serving: consults the optimizer first, and
    /// registers newly discovered bare dependencies with it, returning the
    /// rewritten artifact path. This is how every third-party import ends up
    /// served from the pre-bundled cache.
    #[must_use]
    pub fn resolve_for_serve(
        &self,
        specifier: &str,
        importer: Option<&Path>,
        kind: ResolutionKind,
        optimizer: &Arc<DepsOptimizer>,
    ) -> Resolved {
        if is_bare_specifier(specifier) {
            if let Some(info) = optimizer.dep_info(specifier) {
                return Resolved::Id(info.file);
            }
        }

        let resolved = self.resolve(specifier, importer, ResolveOpts { kind });

        if is_bare_specifier(specifier) {
            if let Resolved::Id(path) = &resolved {
                let importer_in_cache =
                    importer.is_some_and(|imp| optimizer.is_optimized_file(imp));
                if is_js_path(path) && !optimizer.is_optimized_file(path) && !importer_in_cache {
                    let info = optimizer.register_missing_import(specifier, path.clone());
                    return Resolved::Id(info.file);
                }
            }
        }
        resolved
    }

    /// Collapse symlinks unless configured otherwise.
    fn finalize(&self, path: PathBuf) -> PathBuf {
        if self.preserve_symlinks {
            path
        } else {
            dunce::canonicalize(&path).unwrap_or(path)
        }
    }

    /// Probe a path on disk: exact, with each extension, then as a directory.
    fn resolve_path(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Some(self.finalize(path.to_path_buf()));
        }
        for ext in &self.extensions {
            let with_ext = PathBuf::from(format!("{}.{ext}", path.display()));
            if with_ext.is_file() {
                return Some(self.finalize(with_ext));
            }
        }
        if path.is_dir() {
            return self.resolve_directory(path);
        }
        None
    }

    /// Resolve a directory: package entry fields first, then index files.
    fn resolve_directory(&self, dir: &Path) -> Option<PathBuf> {
        if let Some(pkg) = self.packages.get(dir) {
            if let Some(exports) = pkg.exports() {
                let target = resolve_exports(exports, ".", ResolutionKind::Import)?;
                let path = dir.join(target.trim_start_matches("./"));
                if path.is_file() {
                    return Some(self.finalize(path));
                }
                return None;
            }
            for entry in [pkg.module(), pkg.main()].into_iter().flatten() {
                if let Some(resolved) = self.resolve_path(&dir.join(entry)) {
                    return Some(resolved);
                }
            }
        }
        for ext in &self.extensions {
            let index = dir.join(format!("index.{ext}"));
            if index.is_file() {
                return Some(self.finalize(index));
            }
        }
        None
    }

    /// Bare specifier: walk `node_modules` upward from the importer.
    fn resolve_bare(&self, specifier: &str, importer: Option<&Path>, opts: ResolveOpts) -> Resolved {
        let candidates = candidate_package_ids(specifier);
        if candidates.is_empty() {
            return Resolved::NotFound;
        }

        let start = importer
            .and_then(Path::parent)
            .unwrap_or(self.root.as_path());
        let mut dir = Some(start);
        while let Some(current) = dir {
            let nm = current.join("node_modules");
            if nm.is_dir() {
                if let Some(result) = self.resolve_in_node_modules(&nm, specifier, &candidates, opts)
                {
                    return result;
                }
            }
            dir = current.parent();
        }
        Resolved::NotFound
    }

    /// Resolve within one `node_modules` directory, or `None` to keep
    /// walking upward.
    fn resolve_in_node_modules(
        &self,
        nm: &Path,
        specifier: &str,
        candidates: &[String],
        opts: ResolveOpts,
    ) -> Option<Resolved> {
        // Nearest package: innermost candidate with a package.json on disk.
        let nearest_id = candidates
            .iter()
            .rev()
            .find(|id| nm.join(id).join("package.json").is_file());

        let Some(nearest_id) = nearest_id else {
            // No package.json anywhere along the specifier; raw file probe.
            return self
                .resolve_path(&nm.join(specifier))
                .map(Resolved::Id);
        };

        let root_id = &candidates[0];
        let root_pkg = self.packages.get(&nm.join(root_id));

        // Modern path: the root package's exports map governs resolution.
        if let Some(root_pkg) = root_pkg.as_ref().filter(|p| p.has_exports()) {
            let subpath = if specifier == root_id {
                ".".to_string()
            } else {
                format!("./{}", &specifier[root_id.len() + 1..])
            };
            let cache_key = format!("{:?}:{subpath}", opts.kind);
            if let Some(hit) = root_pkg.cached_subpath(&cache_key) {
                return Some(hit.map_or(Resolved::NotFound, Resolved::Id));
            }
            let resolved = root_pkg
                .exports()
                .and_then(|exports| resolve_exports(exports, &subpath, opts.kind))
                .map(|target| root_pkg.dir.join(target.trim_start_matches("./")))
                .filter(|path| path.is_file())
                .map(|path| self.finalize(path));
            root_pkg.cache_subpath(&cache_key, resolved.clone());
            // Undeclared subpaths are rejected; no fallback to main.
            return Some(resolved.map_or(Resolved::NotFound, Resolved::Id));
        }

        // Legacy path: nearest package's main/module, so deep sub-path
        // imports bypass the (absent) root exports restrictions.
        let nearest_pkg = self.packages.get(&nm.join(nearest_id))?;
        let rest = specifier[nearest_id.len()..].trim_start_matches('/');
        let cache_key = format!("{:?}:./{rest}", opts.kind);
        if let Some(hit) = nearest_pkg.cached_subpath(&cache_key) {
            return Some(hit.map_or(Resolved::NotFound, Resolved::Id));
        }
        let resolved = if rest.is_empty() {
            self.resolve_directory(&nearest_pkg.dir)
        } else {
            self.resolve_path(&nearest_pkg.dir.join(rest))
        };
        nearest_pkg.cache_subpath(&cache_key, resolved.clone());
        Some(resolved.map_or(Resolved::NotFound, Resolved::Id))
    }
}

/// Whether a specifier is bare (not relative, absolute, or a scheme).
#[must_use]
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.is_empty()
        && !specifier.starts_with('.')
        && !specifier.starts_with('/')
        && !Path::new(specifier).is_absolute()
        && !specifier.contains("://")
        && !specifier.starts_with("node:")
        && !specifier.starts_with("data:")
}

/// Decompose a bare specifier into candidate package ids, shortest first.
///
/// A `@scope` segment is non-terminal; segments containing a dot after the
/// first candidate terminate the id (package names may contain dots,
/// sub-paths conventionally do not).
#[must_use]
pub fn candidate_package_ids(specifier: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut first_segment = true;

    loop {
        if start > specifier.len() {
            break;
        }
        let slash = specifier[start..]
            .find('/')
            .map_or(specifier.len(), |i| i + start);
        let part = &specifier[start..slash];
        if part.is_empty() {
            break;
        }
        if !out.is_empty() && part.contains('.') {
            break;
        }
        if first_segment && part.starts_with('@') {
            // Scope segment needs its package segment.
        } else {
            out.push(specifier[..slash].to_string());
        }
        first_segment = false;
        if slash == specifier.len() {
            break;
        }
        start = slash + 1;
    }
    out
}
