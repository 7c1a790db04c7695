//! Dependency pre-bundling optimizer.
//!
//! Discovers bare-specifier dependencies (statically via the entry scan,
//! dynamically via resolver registration while serving), bundles each exactly
//! once, and commits the artifacts with an atomic directory swap so a
//! half-written cache is never visible. Metadata persists to a sidecar file
//! so a warm restart can skip re-bundling.
//!
//! One optimizer exists per server instance; there is no process-wide
//! registry. Metadata mutation is serialized through a single mutex with
//! snapshot reads.

pub mod bundle;
pub mod scan;

pub use bundle::{flatten_id, needs_interop, BundledArtifact, DepBundler, DepEntry, ProxyBundler};

use crate::config::DevConfig;
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::scan::{scan_exports, ExportsData};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Metadata sidecar file name inside the deps directory.
pub const METADATA_FILE: &str = "_metadata.json";

/// State of a one-shot readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Pending,
    Ready,
    Cancelled,
}

/// One-shot readiness gate backing `processing` on a discovered dependency.
///
/// Fires exactly once, from `Pending` to `Ready` or `Cancelled`; later fires
/// are ignored.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<SignalState>>,
}

impl ReadySignal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(SignalState::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SignalState {
        *self.tx.borrow()
    }

    /// Obtain an awaitable waiter.
    #[must_use]
    pub fn waiter(&self) -> ReadyWaiter {
        ReadyWaiter {
            rx: self.tx.subscribe(),
        }
    }

    fn fire(&self, state: SignalState) {
        self.tx.send_modify(|current| {
            if *current == SignalState::Pending {
                *current = state;
            }
        });
    }
}

/// Awaitable side of a [`ReadySignal`].
#[derive(Debug)]
pub struct ReadyWaiter {
    rx: watch::Receiver<SignalState>,
}

impl ReadyWaiter {
    /// Wait until the signal leaves `Pending`.
    pub async fn wait(mut self) -> SignalState {
        loop {
            let state = *self.rx.borrow();
            if state != SignalState::Pending {
                return state;
            }
            if self.rx.changed().await.is_err() {
                return SignalState::Cancelled;
            }
        }
    }
}

/// One pre-bundled (or pending) dependency.
#[derive(Debug, Clone)]
pub struct OptimizedDepInfo {
    /// Original bare specifier.
    pub id: String,
    /// Artifact path inside the deps directory.
    pub file: PathBuf,
    /// Resolved source entry.
    pub src: PathBuf,
    /// Interop flag; `None` until a bundling pass inspected the entry.
    pub needs_interop: Option<bool>,
    /// Content hash of the committed artifact.
    pub file_hash: Option<String>,
    /// Pending until the bundling run producing this artifact commits.
    pub processing: Option<ReadySignal>,
    /// Lazily computed export shape of the source entry.
    pub exports_data: Option<ExportsData>,
}

/// Optimizer lifecycle per server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerState {
    Cold,
    Scanning,
    Bundling,
    Committed,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    optimized: BTreeMap<String, MetadataEntry>,
    chunks: BTreeMap<String, ChunkEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataEntry {
    src: String,
    file: String,
    #[serde(rename = "fileHash")]
    file_hash: String,
    #[serde(rename = "needsInterop")]
    needs_interop: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkEntry {
    file: String,
}

#[derive(Default)]
struct OptimizerInner {
    state: OptimizerState,
    optimized: HashMap<String, OptimizedDepInfo>,
    discovered: HashMap<String, OptimizedDepInfo>,
    debounce: Option<tokio::task::JoinHandle<()>>,
}

impl Default for OptimizerState {
    fn default() -> Self {
        Self::Cold
    }
}

/// Per-server dependency optimizer.
pub struct DepsOptimizer {
    config: DevConfig,
    resolver: Arc<Resolver>,
    bundler: Box<dyn DepBundler>,
    inner: Mutex<OptimizerInner>,
    /// Bumped on every discovery; a bundling pass observing a newer
    /// generation at commit time has been superseded and cancels itself.
    generation: AtomicU64,
    /// Interop mismatches after a pass force a full reload through here.
    reload_tx: Option<tokio::sync::mpsc::UnboundedSender<String>>,
}

impl DepsOptimizer {
    /// Create an optimizer for one server instance.
    #[must_use]
    pub fn new(
        config: DevConfig,
        resolver: Arc<Resolver>,
        bundler: Box<dyn DepBundler>,
        reload_tx: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resolver,
            bundler,
            inner: Mutex::new(OptimizerInner::default()),
            generation: AtomicU64::new(0),
            reload_tx,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OptimizerState {
        self.inner.lock().unwrap().state
    }

    /// Cold/warm start: load committed metadata if fresh, otherwise scan the
    /// entries and run the initial bundling pass.
    pub fn init(&self) -> Result<()> {
        if let Some(optimized) = self.load_committed_metadata() {
            let mut inner = self.inner.lock().unwrap();
            tracing::info!(deps = optimized.len(), "warm start from committed dep metadata");
            inner.optimized = optimized;
            inner.state = OptimizerState::Committed;
            return Ok(());
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = OptimizerState::Scanning;
        }
        let found = scan::scan_entries(&self.config, &self.resolver);
        tracing::info!(deps = found.len(), "dependency scan complete");
        {
            let mut inner = self.inner.lock().unwrap();
            for (id, src) in found {
                let info = self.new_dep_info(&id, src);
                inner.discovered.insert(id, info);
            }
        }
        self.run_bundle_pass()
    }

    /// Known info for a specifier, committed or pending.
    #[must_use]
    pub fn dep_info(&self, specifier: &str) -> Option<OptimizedDepInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .optimized
            .get(specifier)
            .or_else(|| inner.discovered.get(specifier))
            .cloned()
    }

    /// Reverse lookup by artifact file.
    #[must_use]
    pub fn dep_info_by_file(&self, file: &Path) -> Option<OptimizedDepInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .optimized
            .values()
            .chain(inner.discovered.values())
            .find(|info| info.file == file)
            .cloned()
    }

    /// Whether a path lives inside the dependency cache.
    #[must_use]
    pub fn is_optimized_file(&self, path: &Path) -> bool {
        path.starts_with(self.config.cache_dir_abs())
    }

    /// Register a dependency discovered at serve time.
    ///
    /// Idempotent; the returned info's `processing` signal resolves once the
    /// bundling run producing the artifact commits.
    pub fn register_missing_import(
        self: &Arc<Self>,
        specifier: &str,
        src: PathBuf,
    ) -> OptimizedDepInfo {
        let info = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(existing) = inner
                .optimized
                .get(specifier)
                .or_else(|| inner.discovered.get(specifier))
            {
                return existing.clone();
            }
            tracing::info!(specifier, "new dependency found, scheduling re-bundle");
            let info = self.new_dep_info(specifier, src);
            inner.discovered.insert(specifier.to_string(), info.clone());
            info
        };
        self.schedule_rebundle();
        info
    }

    /// Read an artifact's bytes.
    ///
    /// Takes the metadata lock so a read never interleaves with the commit
    /// swap: the caller sees the previous committed artifact or the new one,
    /// never a missing file mid-swap.
    pub fn read_artifact(&self, file: &Path) -> std::io::Result<Vec<u8>> {
        let _inner = self.inner.lock().unwrap();
        std::fs::read(file)
    }

    /// Await the artifact behind a dependency file, per the atomic-commit
    /// contract: the caller sees the previous committed artifact or, after
    /// `Ready`, the new one; never a partial write.
    pub async fn wait_for_file(&self, file: &Path) -> SignalState {
        let processing = self
            .dep_info_by_file(file)
            .and_then(|info| info.processing.map(|signal| signal.waiter()));
        match processing {
            Some(waiter) => waiter.wait().await,
            None => SignalState::Ready,
        }
    }

    /// Cancel pending work (server shutdown).
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.debounce.take() {
            handle.abort();
        }
        for info in inner.discovered.values() {
            if let Some(signal) = &info.processing {
                signal.fire(SignalState::Cancelled);
            }
        }
    }

    fn new_dep_info(&self, specifier: &str, src: PathBuf) -> OptimizedDepInfo {
        OptimizedDepInfo {
            id: specifier.to_string(),
            file: self.config.deps_dir().join(format!("{}.js", flatten_id(specifier))),
            src,
            needs_interop: None,
            file_hash: None,
            processing: Some(ReadySignal::new()),
            exports_data: None,
        }
    }

    /// Restart the crawl-end debounce timer. Cancel-and-reschedule safe:
    /// each discovery bumps the generation and aborts the previous timer.
    fn schedule_rebundle(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.debounce.take() {
            handle.abort();
        }
        let this = Arc::clone(self);
        let delay = self.config.crawl_debounce_ms;
        inner.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if this.generation.load(Ordering::SeqCst) != generation {
                // A newer discovery rescheduled; let its timer run the pass.
                return;
            }
            if let Err(err) = this.run_bundle_pass() {
                tracing::warn!(%err, "bundling pass failed; previous committed cache stays authoritative");
            }
        }));
    }

    /// Bundle every known dependency into the staging directory and commit
    /// it with a directory swap. A pass superseded by a newer discovery
    /// discards its staging directory instead of committing. A failed pass
    /// aborts only itself: its waiters are released with `Cancelled` and the
    /// previous committed cache stays authoritative.
    pub fn run_bundle_pass(&self) -> Result<()> {
        let result = self.try_bundle_pass();
        if result.is_err() {
            self.abort_pass();
        }
        result
    }

    /// Release the waiters of a failed pass and roll the state back so the
    /// previous committed metadata stays authoritative. Dropped deps
    /// re-register with a fresh signal on their next request.
    fn abort_pass(&self) {
        let _ = std::fs::remove_dir_all(self.config.deps_temp_dir());
        let mut inner = self.inner.lock().unwrap();
        for info in inner.discovered.values() {
            if let Some(signal) = &info.processing {
                signal.fire(SignalState::Cancelled);
            }
        }
        inner.discovered.clear();
        inner.state = if inner.optimized.is_empty() {
            OptimizerState::Cold
        } else {
            OptimizerState::Committed
        };
    }

    fn try_bundle_pass(&self) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let snapshot: Vec<OptimizedDepInfo> = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = OptimizerState::Bundling;
            inner
                .optimized
                .values()
                .chain(inner.discovered.values())
                .cloned()
                .collect()
        };

        let staging = self.config.deps_temp_dir();
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;
        // The staging dir serves ES modules once committed
        std::fs::write(staging.join("package.json"), "{\n  \"type\": \"module\"\n}\n")?;

        let mut entries = Vec::with_capacity(snapshot.len());
        let mut mismatches = Vec::new();
        let mut dropped = Vec::new();
        for info in &snapshot {
            let source = match std::fs::read_to_string(&info.src) {
                Ok(source) => source,
                // A discovered dep whose entry vanished before the pass ran
                // is dropped from it; its waiters are released. An unreadable
                // already-committed dep aborts the whole pass instead.
                Err(err) if info.processing.is_some() => {
                    tracing::warn!(dep = %info.id, %err, "dropping dependency with unreadable entry");
                    if let Some(signal) = &info.processing {
                        signal.fire(SignalState::Cancelled);
                    }
                    dropped.push(info.id.clone());
                    continue;
                }
                Err(err) => {
                    return Err(Error::Bundle(format!(
                        "read dep entry {}: {err}",
                        info.src.display()
                    )));
                }
            };
            let exports_data = scan_exports(&source);
            let interop_now = needs_interop(&exports_data);
            if let Some(prev) = info.needs_interop {
                if prev != interop_now {
                    mismatches.push(info.id.clone());
                }
            }
            entries.push(DepEntry {
                id: info.id.clone(),
                flat_id: flatten_id(&info.id),
                src: info.src.clone(),
                exports_data,
                needs_interop: interop_now,
            });
        }

        if !dropped.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            for id in &dropped {
                inner.discovered.remove(id);
            }
        }

        let artifacts = self.bundler.bundle(&entries, &staging)?;

        let deps_dir = self.config.deps_dir();
        let mut metadata = MetadataFile {
            optimized: BTreeMap::new(),
            chunks: BTreeMap::new(),
        };
        let mut committed: HashMap<String, OptimizedDepInfo> = HashMap::new();
        for artifact in &artifacts {
            let entry = entries
                .iter()
                .find(|e| e.id == artifact.id)
                .ok_or_else(|| Error::Bundle(format!("unknown artifact {}", artifact.id)))?;
            let contents = std::fs::read(staging.join(&artifact.file_name))?;
            let file_hash = blake3::hash(&contents).to_hex().to_string()[..16].to_string();
            metadata.optimized.insert(
                artifact.id.clone(),
                MetadataEntry {
                    src: relative_to(&deps_dir, &entry.src).display().to_string(),
                    file: artifact.file_name.clone(),
                    file_hash: file_hash.clone(),
                    needs_interop: entry.needs_interop,
                },
            );
            committed.insert(
                artifact.id.clone(),
                OptimizedDepInfo {
                    id: artifact.id.clone(),
                    file: deps_dir.join(&artifact.file_name),
                    src: entry.src.clone(),
                    needs_interop: Some(entry.needs_interop),
                    file_hash: Some(file_hash),
                    processing: None,
                    exports_data: Some(entry.exports_data.clone()),
                },
            );
        }
        std::fs::write(
            staging.join(METADATA_FILE),
            serde_json::to_string_pretty(&metadata).map_err(|err| Error::Bundle(err.to_string()))?,
        )?;

        // Commit, unless a newer discovery superseded this pass. The swap
        // runs under the metadata lock, and artifact reads take the same
        // lock, so a reader sees the old directory or the new one in full.
        let retired = self.config.cache_dir_abs().join("deps_old");
        {
            let mut inner = self.inner.lock().unwrap();
            if self.generation.load(Ordering::SeqCst) != generation {
                drop(inner);
                std::fs::remove_dir_all(&staging)?;
                tracing::debug!("bundling pass superseded, staging discarded");
                return Ok(());
            }
            if retired.exists() {
                // Leftover from an interrupted earlier commit
                std::fs::remove_dir_all(&retired)?;
            }
            if deps_dir.exists() {
                std::fs::rename(&deps_dir, &retired)?;
            }
            if let Err(err) = std::fs::rename(&staging, &deps_dir) {
                // Put the previous committed cache back before surfacing
                if retired.exists() {
                    let _ = std::fs::rename(&retired, &deps_dir);
                }
                return Err(err.into());
            }

            let pending: Vec<ReadySignal> = inner
                .discovered
                .values()
                .filter_map(|info| info.processing.clone())
                .collect();
            inner.discovered.clear();
            inner.optimized = committed;
            inner.state = OptimizerState::Committed;
            for signal in pending {
                signal.fire(SignalState::Ready);
            }
        }
        // The retired directory is unreachable once the swap lands
        let _ = std::fs::remove_dir_all(&retired);
        tracing::info!(deps = artifacts.len(), "dependency bundle committed");

        if !mismatches.is_empty() {
            let reason = format!("interop changed for {}", mismatches.join(", "));
            tracing::warn!(%reason, "forcing full reload after interop mismatch");
            if let Some(tx) = &self.reload_tx {
                let _ = tx.send(reason);
            }
        }
        Ok(())
    }

    /// Load the committed metadata sidecar; malformed or stale metadata is a
    /// cold start, not an error.
    fn load_committed_metadata(&self) -> Option<HashMap<String, OptimizedDepInfo>> {
        let deps_dir = self.config.deps_dir();
        let raw = std::fs::read_to_string(deps_dir.join(METADATA_FILE)).ok()?;
        let parsed: MetadataFile = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(%err, "malformed dep metadata, treating as cold start");
                return None;
            }
        };

        let mut optimized = HashMap::new();
        for (id, entry) in parsed.optimized {
            let file = deps_dir.join(&entry.file);
            if !file.is_file() {
                tracing::warn!(dep = %id, "committed artifact missing, treating as cold start");
                return None;
            }
            let src = normalize(&deps_dir.join(&entry.src));
            optimized.insert(
                id.clone(),
                OptimizedDepInfo {
                    id,
                    file,
                    src,
                    needs_interop: Some(entry.needs_interop),
                    file_hash: Some(entry.file_hash),
                    processing: None,
                    exports_data: None,
                },
            );
        }
        Some(optimized)
    }
}

/// Relative path from `base` (a directory) to `target`.
fn relative_to(base: &Path, target: &Path) -> PathBuf {
    let base_comps: Vec<_> = base.components().collect();
    let target_comps: Vec<_> = target.components().collect();
    let common = base_comps
        .iter()
        .zip(&target_comps)
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..base_comps.len() {
        out.push("..");
    }
    for comp in &target_comps[common..] {
        out.push(comp);
    }
    out
}

/// Collapse `..` and `.` segments without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push(comp);
                }
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageCache;
    use serde_json::json;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn project_with_left_pad(root: &Path) {
        write(
            &root.join("index.html"),
            r#"<script type="module" src="/src/main.ts"></script>"#,
        );
        write(&root.join("src/main.ts"), "import pad from \"left-pad\";\npad(\"x\", 3);\n");
        let pkg = root.join("node_modules/left-pad");
        write(
            &pkg.join("package.json"),
            &json!({"name": "left-pad", "main": "index.js"}).to_string(),
        );
        write(
            &pkg.join("index.js"),
            "module.exports = function leftPad(str, len) { return str; };\n",
        );
    }

    fn make_optimizer(
        root: &Path,
        reload_tx: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    ) -> (Arc<DepsOptimizer>, DevConfig) {
        let config = DevConfig::new(root.to_path_buf()).with_crawl_debounce_ms(10);
        let resolver = Arc::new(Resolver::new(&config, Arc::new(PackageCache::new())));
        let optimizer = DepsOptimizer::new(
            config.clone(),
            resolver,
            Box::new(ProxyBundler::new()),
            reload_tx,
        );
        (optimizer, config)
    }

    #[test]
    fn cold_scan_bundle_commit() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (optimizer, config) = make_optimizer(tmp.path(), None);

        assert_eq!(optimizer.state(), OptimizerState::Cold);
        optimizer.init().unwrap();
        assert_eq!(optimizer.state(), OptimizerState::Committed);

        assert!(config.deps_dir().join("left-pad.js").is_file());
        assert!(!config.deps_temp_dir().exists());

        let raw = std::fs::read_to_string(config.deps_dir().join(METADATA_FILE)).unwrap();
        let metadata: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(metadata["optimized"]["left-pad"]["file"], "left-pad.js");
        assert_eq!(metadata["optimized"]["left-pad"]["needsInterop"], true);

        let info = optimizer.dep_info("left-pad").unwrap();
        assert_eq!(info.needs_interop, Some(true));
        assert!(info.processing.is_none());
    }

    #[test]
    fn warm_start_skips_rebundle() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (first, _) = make_optimizer(tmp.path(), None);
        first.init().unwrap();

        let (second, _) = make_optimizer(tmp.path(), None);
        second.init().unwrap();
        assert_eq!(second.state(), OptimizerState::Committed);
        let info = second.dep_info("left-pad").unwrap();
        assert_eq!(info.needs_interop, Some(true));
        assert!(info.file.ends_with("left-pad.js"));
    }

    #[test]
    fn malformed_metadata_is_cold_start() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (optimizer, config) = make_optimizer(tmp.path(), None);
        std::fs::create_dir_all(config.deps_dir()).unwrap();
        std::fs::write(config.deps_dir().join(METADATA_FILE), "{broken").unwrap();

        optimizer.init().unwrap();
        assert_eq!(optimizer.state(), OptimizerState::Committed);
        assert!(optimizer.dep_info("left-pad").is_some());
    }

    #[tokio::test]
    async fn runtime_discovery_debounces_and_commits() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let modpkg = tmp.path().join("node_modules/modpkg");
        write(
            &modpkg.join("package.json"),
            &json!({"name": "modpkg", "exports": {".": "./index.mjs"}}).to_string(),
        );
        write(&modpkg.join("index.mjs"), "export default 1;\n");

        let (optimizer, config) = make_optimizer(tmp.path(), None);
        optimizer.init().unwrap();

        let info = optimizer
            .register_missing_import("modpkg", modpkg.join("index.mjs"));
        let signal = info.processing.clone().unwrap();
        assert_eq!(signal.state(), SignalState::Pending);

        // Re-registration is idempotent while pending
        let again = optimizer.register_missing_import("modpkg", modpkg.join("index.mjs"));
        assert!(again.processing.is_some());

        let state = signal.waiter().wait().await;
        assert_eq!(state, SignalState::Ready);
        assert!(config.deps_dir().join("modpkg.js").is_file());
        // The previously committed dep survived the re-bundle
        assert!(config.deps_dir().join("left-pad.js").is_file());
        assert_eq!(optimizer.state(), OptimizerState::Committed);
    }

    #[tokio::test]
    async fn wait_for_committed_file_is_ready() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (optimizer, config) = make_optimizer(tmp.path(), None);
        optimizer.init().unwrap();

        let state = optimizer
            .wait_for_file(&config.deps_dir().join("left-pad.js"))
            .await;
        assert_eq!(state, SignalState::Ready);
    }

    #[tokio::test]
    async fn close_cancels_pending_signals() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (optimizer, _) = make_optimizer(tmp.path(), None);
        optimizer.init().unwrap();

        let info = optimizer.register_missing_import(
            "ghost",
            tmp.path().join("node_modules/left-pad/index.js"),
        );
        let signal = info.processing.clone().unwrap();
        optimizer.close();
        assert_eq!(signal.waiter().wait().await, SignalState::Cancelled);
    }

    #[test]
    fn interop_mismatch_forces_reload() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (optimizer, _) = make_optimizer(tmp.path(), Some(tx));
        optimizer.init().unwrap();

        // The dependency flips from CJS to ESM in place
        write(
            &tmp.path().join("node_modules/left-pad/index.js"),
            "export default function leftPad(str) { return str; }\n",
        );
        optimizer.run_bundle_pass().unwrap();

        let reason = rx.try_recv().unwrap();
        assert!(reason.contains("left-pad"));
    }

    #[test]
    fn failed_pass_keeps_previous_cache() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (optimizer, config) = make_optimizer(tmp.path(), None);
        optimizer.init().unwrap();

        // Make the next pass fail by removing the dep source
        std::fs::remove_file(tmp.path().join("node_modules/left-pad/index.js")).unwrap();
        assert!(optimizer.run_bundle_pass().is_err());

        // The previously committed artifact is still servable
        assert!(config.deps_dir().join("left-pad.js").is_file());
        assert!(optimizer.dep_info("left-pad").is_some());
        assert_eq!(optimizer.state(), OptimizerState::Committed);
    }

    #[test]
    fn commit_swap_never_hides_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (optimizer, config) = make_optimizer(tmp.path(), None);
        optimizer.init().unwrap();

        let artifact = config.deps_dir().join("left-pad.js");
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let optimizer = Arc::clone(&optimizer);
            let artifact = artifact.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut misses = 0u32;
                while !stop.load(Ordering::SeqCst) {
                    if optimizer.read_artifact(&artifact).is_err() {
                        misses += 1;
                    }
                }
                misses
            })
        };

        for _ in 0..50 {
            optimizer.run_bundle_pass().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[tokio::test]
    async fn unreadable_discovered_dep_is_dropped_not_stuck() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (optimizer, config) = make_optimizer(tmp.path(), None);
        optimizer.init().unwrap();

        let info = optimizer.register_missing_import(
            "ghost",
            tmp.path().join("node_modules/ghost/missing.js"),
        );
        let signal = info.processing.clone().unwrap();

        // The debounced pass drops the dep instead of leaving the waiter
        // pending forever
        let state = tokio::time::timeout(Duration::from_secs(2), signal.waiter().wait())
            .await
            .expect("waiter resolved");
        assert_eq!(state, SignalState::Cancelled);
        assert_eq!(optimizer.state(), OptimizerState::Committed);
        assert!(config.deps_dir().join("left-pad.js").is_file());
        assert!(optimizer.dep_info("ghost").is_none());
    }

    #[tokio::test]
    async fn aborted_pass_releases_waiters_and_restores_state() {
        let tmp = tempfile::tempdir().unwrap();
        project_with_left_pad(tmp.path());
        let (optimizer, config) = make_optimizer(tmp.path(), None);
        optimizer.init().unwrap();

        // Break the committed dep so the next pass aborts as a whole
        std::fs::remove_file(tmp.path().join("node_modules/left-pad/index.js")).unwrap();
        let modpkg = tmp.path().join("node_modules/modpkg");
        write(
            &modpkg.join("package.json"),
            &json!({"name": "modpkg", "main": "index.js"}).to_string(),
        );
        write(&modpkg.join("index.js"), "module.exports = 2;\n");
        let info = optimizer.register_missing_import("modpkg", modpkg.join("index.js"));
        let signal = info.processing.clone().unwrap();

        assert!(optimizer.run_bundle_pass().is_err());
        assert_eq!(signal.waiter().wait().await, SignalState::Cancelled);
        assert_eq!(optimizer.state(), OptimizerState::Committed);
        assert!(config.deps_dir().join("left-pad.js").is_file());
        // A cleared dep re-registers with a fresh signal on its next request
        assert!(optimizer.dep_info("modpkg").is_none());
    }

    #[test]
    fn relative_path_helper() {
        assert_eq!(
            relative_to(Path::new("/p/node_modules/.skerry/deps"), Path::new("/p/node_modules/x/i.js")),
            PathBuf::from("../../x/i.js")
        );
    }
}
