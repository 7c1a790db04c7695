//! package.json loading and memoization.
//!
//! `PackageData` holds the raw parsed JSON for one package directory plus a
//! per-instance resolved-subpath cache. `PackageCache` memoizes `PackageData`
//! per directory, validated by a file stamp so edits to a package.json are
//! picked up without restarting the server.

use crate::error::Error;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::UNIX_EPOCH;

/// Validation stamp for a package.json file: mtime + size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PkgStamp {
    mtime_ms: u128,
    size: u64,
}

impl PkgStamp {
    /// Read the stamp for a file. Returns `None` if the file is missing.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        let mtime_ms = meta
            .modified()
            .ok()?
            .duration_since(UNIX_EPOCH)
            .ok()?
            .as_millis();
        Some(Self {
            mtime_ms,
            size: meta.len(),
        })
    }

    /// Whether the stamp still matches the file on disk.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        PkgStamp::from_path(path) == Some(*self)
    }
}

/// Parsed package.json for one package directory.
#[derive(Debug)]
pub struct PackageData {
    /// Directory containing the package.json.
    pub dir: PathBuf,
    /// Raw parsed JSON.
    pub data: Value,
    /// Resolved-subpath cache, keyed per requested subpath (not global).
    subpath_cache: RwLock<HashMap<String, Option<PathBuf>>>,
}

impl PackageData {
    fn new(dir: PathBuf, data: Value) -> Self {
        Self {
            dir,
            data,
            subpath_cache: RwLock::new(HashMap::new()),
        }
    }

    /// The `name` field, if present.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.data.get("name").and_then(Value::as_str)
    }

    /// The `main` field, if present.
    #[must_use]
    pub fn main(&self) -> Option<&str> {
        self.data.get("main").and_then(Value::as_str)
    }

    /// The `module` field, if present.
    #[must_use]
    pub fn module(&self) -> Option<&str> {
        self.data.get("module").and_then(Value::as_str)
    }

    /// The `exports` field, if present.
    #[must_use]
    pub fn exports(&self) -> Option<&Value> {
        self.data.get("exports")
    }

    /// Whether the package declares an exports map.
    #[must_use]
    pub fn has_exports(&self) -> bool {
        self.exports().is_some()
    }

    /// Look up a previously resolved subpath.
    ///
    /// The outer `Option` is a cache miss; the inner one is a memoized
    /// negative result.
    #[must_use]
    pub fn cached_subpath(&self, key: &str) -> Option<Option<PathBuf>> {
        match self.subpath_cache.read() {
            Ok(cache) => cache.get(key).cloned(),
            Err(_) => None,
        }
    }

    /// Memoize a resolved subpath (including negative results).
    pub fn cache_subpath(&self, key: &str, resolved: Option<PathBuf>) {
        if let Ok(mut cache) = self.subpath_cache.write() {
            cache.insert(key.to_string(), resolved);
        }
    }
}

/// Per-server memoizing cache of `PackageData`, keyed by package directory.
#[derive(Debug, Default)]
pub struct PackageCache {
    packages: RwLock<HashMap<PathBuf, (PkgStamp, Arc<PackageData>)>>,
}

impl PackageCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the package data for a directory, loading and memoizing it.
    ///
    /// Returns `None` when the directory has no package.json or the file is
    /// malformed (logged, non-fatal).
    #[must_use]
    pub fn get(&self, dir: &Path) -> Option<Arc<PackageData>> {
        let pkg_json = dir.join("package.json");

        if let Ok(packages) = self.packages.read() {
            if let Some((stamp, data)) = packages.get(dir) {
                if stamp.matches(&pkg_json) {
                    return Some(Arc::clone(data));
                }
            }
        }

        let stamp = PkgStamp::from_path(&pkg_json)?;
        match self.load(dir, &pkg_json, stamp) {
            Ok(data) => Some(data),
            Err(err) => {
                tracing::warn!(%err, "ignoring unreadable package.json");
                None
            }
        }
    }

    /// Load and memoize a package.json, with typed read/parse errors.
    fn load(
        &self,
        dir: &Path,
        pkg_json: &Path,
        stamp: PkgStamp,
    ) -> crate::error::Result<Arc<PackageData>> {
        let raw = std::fs::read_to_string(pkg_json).map_err(|source| Error::PackageJsonRead {
            path: pkg_json.to_path_buf(),
            source,
        })?;
        let parsed: Value =
            serde_json::from_str(&raw).map_err(|source| Error::PackageJsonParse {
                path: pkg_json.to_path_buf(),
                source,
            })?;

        let data = Arc::new(PackageData::new(dir.to_path_buf(), parsed));
        if let Ok(mut packages) = self.packages.write() {
            packages.insert(dir.to_path_buf(), (stamp, Arc::clone(&data)));
        }
        Ok(data)
    }

    /// Find the nearest package.json walking upward from `start`, stopping
    /// at `stop_at` (inclusive) if given.
    #[must_use]
    pub fn find_nearest(&self, start: &Path, stop_at: Option<&Path>) -> Option<Arc<PackageData>> {
        let mut dir = if start.is_dir() {
            Some(start)
        } else {
            start.parent()
        };
        while let Some(current) = dir {
            if let Some(data) = self.get(current) {
                return Some(data);
            }
            if stop_at == Some(current) {
                break;
            }
            dir = current.parent();
        }
        None
    }
}
