//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Extensions probed during resolution, in priority order (without the dot).
pub const DEFAULT_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "json"];

/// Extensions treated as static assets and rewritten with an `?import` suffix.
pub const ASSET_EXTENSIONS: &[&str] = &[
    "svg", "png", "jpg", "jpeg", "gif", "webp", "ico", "woff", "woff2", "ttf", "eot", "mp4",
    "webm", "mp3", "wav", "txt",
];

/// Configuration for one dev server instance.
///
/// There is no global config registry; a `DevConfig` is constructed once and
/// threaded explicitly through the resolver, optimizer and server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevConfig {
    /// Project root (absolute).
    pub root: PathBuf,

    /// Entry points crawled by the dependency scanner, relative to the root.
    pub entries: Vec<String>,

    /// Dependency cache directory, relative to the root unless absolute.
    pub cache_dir: PathBuf,

    /// Port to listen on.
    pub port: u16,

    /// Host to bind to.
    pub host: String,

    /// Keep symlinked paths as-is instead of realpath-resolving them.
    pub preserve_symlinks: bool,

    /// Idle delay before newly discovered dependencies trigger a re-bundling
    /// pass. Tunable; coalesces near-simultaneous discoveries into one pass.
    pub crawl_debounce_ms: u64,
}

impl DevConfig {
    /// Create a config for the given project root with defaults.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            entries: vec!["index.html".to_string()],
            cache_dir: PathBuf::from("node_modules/.skerry"),
            port: 3000,
            host: "127.0.0.1".to_string(),
            preserve_symlinks: false,
            crawl_debounce_ms: 100,
        }
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the scan entry points.
    #[must_use]
    pub fn with_entries(mut self, entries: Vec<String>) -> Self {
        self.entries = entries;
        self
    }

    /// Set the cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set symlink preservation.
    #[must_use]
    pub fn with_preserve_symlinks(mut self, preserve: bool) -> Self {
        self.preserve_symlinks = preserve;
        self
    }

    /// Set the crawl-end debounce delay.
    #[must_use]
    pub fn with_crawl_debounce_ms(mut self, ms: u64) -> Self {
        self.crawl_debounce_ms = ms;
        self
    }

    /// Absolute cache directory.
    #[must_use]
    pub fn cache_dir_abs(&self) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            self.root.join(&self.cache_dir)
        }
    }

    /// Committed dependency artifact directory.
    #[must_use]
    pub fn deps_dir(&self) -> PathBuf {
        self.cache_dir_abs().join("deps")
    }

    /// Staging directory for the atomic cache swap.
    #[must_use]
    pub fn deps_temp_dir(&self) -> PathBuf {
        self.cache_dir_abs().join("deps_temp")
    }
}

/// Whether a path has one of the asset extensions.
#[must_use]
pub fn is_asset_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ASSET_EXTENSIONS.contains(&ext))
}

/// Whether a path looks like JavaScript or TypeScript source.
#[must_use]
pub fn is_js_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| matches!(ext, "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs"))
}
