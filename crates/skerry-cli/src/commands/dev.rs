//! `skerry dev` command implementation.
//!
//! Unbundled development server: the browser fetches individual ES modules
//! on demand and each request runs the transform pipeline (resolve → load →
//! plugin transform → import rewrite). Third-party dependencies are
//! pre-bundled into `node_modules/.skerry/deps` at startup and served from
//! `/@deps/`; file changes flow through the module graph into HMR updates
//! pushed over the `/__hmr` WebSocket.

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as AxumPath, RawQuery, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use miette::{IntoDiagnostic, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use skerry_core::hmr;
use skerry_core::optimizer::{DepsOptimizer, ProxyBundler, SignalState};
use skerry_core::{
    DevConfig, Error, HmrDecision, HmrPayload, ModuleGraph, ModuleTransformer, PackageCache,
    PluginContainer, Resolver,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const JS_CONTENT_TYPE: &str = "application/javascript";
const NO_CACHE: &str = "no-cache";

/// Dev server action.
#[derive(Debug, Clone)]
pub struct DevAction {
    /// Project root.
    pub root: PathBuf,
    /// Port to listen on.
    pub port: u16,
    /// Host to bind to.
    pub host: String,
    /// Scan entry points (empty for the default).
    pub entries: Vec<String>,
    /// Open browser automatically.
    pub open: bool,
}

/// Shared server state. One instance per server; nothing global.
struct DevState {
    config: DevConfig,
    graph: ModuleGraph,
    resolver: Arc<Resolver>,
    optimizer: Arc<DepsOptimizer>,
    transformer: ModuleTransformer,
    plugins: PluginContainer,
    hmr_tx: broadcast::Sender<HmrPayload>,
}

/// Run the dev server.
pub async fn run(action: DevAction) -> Result<()> {
    let root = dunce::canonicalize(&action.root).into_diagnostic()?;

    let mut config = DevConfig::new(root.clone())
        .with_port(action.port)
        .with_host(action.host.clone());
    if !action.entries.is_empty() {
        config = config.with_entries(action.entries.clone());
    }

    let packages = Arc::new(PackageCache::new());
    let resolver = Arc::new(Resolver::new(&config, packages));

    // Late bundling passes report interop mismatches through this channel
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel::<String>();
    let optimizer = DepsOptimizer::new(
        config.clone(),
        Arc::clone(&resolver),
        Box::new(ProxyBundler::new()),
        Some(reload_tx),
    );

    println!("  Scanning dependencies...");
    optimizer.init().into_diagnostic()?;

    let (hmr_tx, _) = broadcast::channel::<HmrPayload>(16);

    let reload_hmr_tx = hmr_tx.clone();
    tokio::spawn(async move {
        while let Some(reason) = reload_rx.recv().await {
            tracing::warn!(%reason, "forcing full reload");
            let _ = reload_hmr_tx.send(HmrPayload::FullReload);
        }
    });

    let state = Arc::new(DevState {
        transformer: ModuleTransformer::new(root.clone()),
        graph: ModuleGraph::new(),
        resolver,
        optimizer,
        plugins: PluginContainer::new(),
        hmr_tx: hmr_tx.clone(),
        config: config.clone(),
    });

    // File watcher runs on its own thread and bridges into the async world
    let (change_tx, mut change_rx) = mpsc::channel::<Vec<PathBuf>>(16);
    let watch_root = root.clone();
    std::thread::spawn(move || {
        if let Err(err) = watch_files(&watch_root, &change_tx) {
            tracing::error!(%err, "file watcher stopped");
        }
    });

    let change_state = Arc::clone(&state);
    tokio::spawn(async move {
        while let Some(changed) = change_rx.recv().await {
            handle_changes(&change_state, &changed);
        }
    });

    let app = Router::new()
        .route("/", get(serve_index))
        .route("/__hmr", get(hmr_websocket))
        .route(hmr::CLIENT_PATH, get(serve_hmr_client))
        .route("/@deps/*file", get(serve_dep))
        .route("/*path", get(serve_module))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .into_diagnostic()?;

    println!();
    println!("  Dev server running at http://{}:{}", config.host, config.port);
    println!("  Press Ctrl+C to stop");
    println!();

    if action.open {
        let _ = open_browser(&format!("http://{}:{}", config.host, config.port));
    }

    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    tracing::info!(%addr, "dev server listening");
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

type AppState = Arc<DevState>;

/// Serve the project's index.html with the HMR client injected.
async fn serve_index(State(state): State<AppState>) -> Html<String> {
    Html(index_html(&state.config))
}

/// Serve the HMR client runtime.
async fn serve_hmr_client() -> Response {
    respond(
        StatusCode::OK,
        JS_CONTENT_TYPE,
        NO_CACHE,
        hmr::client_runtime().into(),
    )
}

/// Serve a pre-bundled dependency artifact from the committed cache,
/// waiting for a pending bundling pass to commit first.
async fn serve_dep(State(state): State<AppState>, AxumPath(file): AxumPath<String>) -> Response {
    if file.split('/').any(|seg| seg == "..") {
        return respond(
            StatusCode::BAD_REQUEST,
            JS_CONTENT_TYPE,
            NO_CACHE,
            format!("// invalid dependency path: {file}").into(),
        );
    }

    let full = state.config.deps_dir().join(&file);
    if state.optimizer.wait_for_file(&full).await == SignalState::Cancelled {
        return respond(
            StatusCode::SERVICE_UNAVAILABLE,
            JS_CONTENT_TYPE,
            NO_CACHE,
            "// dependency bundling cancelled".into(),
        );
    }

    // Reads go through the optimizer so they serialize against the commit
    // swap of a concurrent re-bundle
    match state.optimizer.read_artifact(&full) {
        // Artifact URLs carry a content hash, so they cache forever
        Ok(bytes) => respond(
            StatusCode::OK,
            JS_CONTENT_TYPE,
            "max-age=31536000, immutable",
            bytes,
        ),
        Err(_) => respond(
            StatusCode::NOT_FOUND,
            JS_CONTENT_TYPE,
            NO_CACHE,
            format!("// dependency not found: {file}").into(),
        ),
    }
}

/// Serve an individual module on demand.
///
/// Transformable requests run the full pipeline; asset requests are served
/// raw; extensionless non-file routes fall back to index.html so client-side
/// routing survives a refresh.
async fn serve_module(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let mut url = format!("/{path}");
    if let Some(q) = &query {
        url.push('?');
        url.push_str(q);
    }

    if is_transformable(&path, query.as_deref()) {
        return match state.transformer.transform(
            &url,
            &state.resolver,
            Some(&state.optimizer),
            &state.graph,
            &state.plugins,
        ) {
            Ok(result) => respond(
                StatusCode::OK,
                result.content_type,
                NO_CACHE,
                result.code.into(),
            ),
            Err(Error::Resolve { .. }) if Path::new(&path).extension().is_none() => {
                // SPA fallback: /about, /users/123 and friends get the shell
                respond(
                    StatusCode::OK,
                    "text/html",
                    NO_CACHE,
                    index_html(&state.config).into(),
                )
            }
            Err(err @ (Error::Resolve { .. } | Error::Load { .. })) => respond(
                StatusCode::NOT_FOUND,
                JS_CONTENT_TYPE,
                NO_CACHE,
                transform_error_body(&err),
            ),
            Err(err) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                JS_CONTENT_TYPE,
                NO_CACHE,
                transform_error_body(&err),
            ),
        };
    }

    // Static file serving
    let file_path = state.config.root.join(&path);
    match std::fs::read(&file_path) {
        Ok(bytes) => respond(
            StatusCode::OK,
            static_content_type(&path),
            NO_CACHE,
            bytes,
        ),
        Err(_) => respond(
            StatusCode::NOT_FOUND,
            "text/plain",
            NO_CACHE,
            format!("Not found: {path}").into(),
        ),
    }
}

fn transform_error_body(err: &Error) -> Vec<u8> {
    let message = err.to_string().replace('\'', "\\'");
    format!("console.error('Transform error: {message}');").into()
}

/// Whether a request goes through the transform pipeline.
fn is_transformable(path: &str, query: Option<&str>) -> bool {
    if path.starts_with("@fs/") {
        return true;
    }
    if query.is_some_and(|q| q.split('&').any(|part| part == "import")) {
        return true;
    }
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" | "json" | "css") => true,
        Some(_) => false,
        // Extensionless URLs probe extensions, falling back to the SPA shell
        None => true,
    }
}

fn static_content_type(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    cache: &'static str,
    body: Vec<u8>,
) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("Cache-Control", cache)
        .body(Body::from(body))
        .unwrap()
}

/// Read the project index.html (or generate a shell) and inject the HMR
/// client script.
fn index_html(config: &DevConfig) -> String {
    let path = config.root.join("index.html");
    let html = std::fs::read_to_string(path).unwrap_or_else(|_| generate_index_html(config));
    inject_hmr_client(html)
}

fn inject_hmr_client(mut html: String) -> String {
    if html.contains(hmr::CLIENT_PATH) {
        return html;
    }
    let tag = format!(
        r#"<script type="module" src="{}"></script>"#,
        hmr::CLIENT_PATH
    );
    if let Some(pos) = html.find("</head>") {
        html.insert_str(pos, &format!("  {tag}\n  "));
    } else if let Some(pos) = html.find("</body>") {
        html.insert_str(pos, &format!("  {tag}\n  "));
    } else {
        html.push_str(&format!("\n{tag}"));
    }
    html
}

/// Fallback shell when the project has no index.html.
fn generate_index_html(config: &DevConfig) -> String {
    let entry = config
        .entries
        .iter()
        .find(|e| !e.ends_with(".html"))
        .cloned()
        .unwrap_or_else(|| "src/main.ts".to_string());
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>skerry dev</title>
</head>
<body>
  <div id="root"></div>
  <script type="module" src="/{entry}"></script>
</body>
</html>"#
    )
}

// ============================================================================
// WebSocket HMR
// ============================================================================

async fn hmr_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_hmr_socket(socket, state))
}

async fn handle_hmr_socket(mut socket: WebSocket, state: Arc<DevState>) {
    let mut rx = state.hmr_tx.subscribe();

    if let Ok(connected) = serde_json::to_string(&HmrPayload::Connected) {
        let _ = socket.send(Message::Text(connected)).await;
    }

    loop {
        tokio::select! {
            payload = rx.recv() => {
                let Ok(payload) = payload else { break };
                let Ok(json) = serde_json::to_string(&payload) else { continue };
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                // Client messages are informational only
                if !matches!(msg, Some(Ok(_))) {
                    break;
                }
            }
        }
    }
}

// ============================================================================
// File Watching
// ============================================================================

/// Handle a batch of changed files: compute HMR decisions and broadcast.
fn handle_changes(state: &DevState, changed: &[PathBuf]) {
    let mut updates = Vec::new();
    let mut full_reload: Option<String> = None;

    for path in changed {
        let rel = path.strip_prefix(&state.config.root).unwrap_or(path);
        tracing::info!(file = %rel.display(), "file changed");

        match hmr::handle_file_change(&state.graph, path) {
            HmrDecision::NoOp => {}
            HmrDecision::Update(mut batch) => updates.append(&mut batch),
            HmrDecision::FullReload { reason } => full_reload = Some(reason),
        }
    }

    if let Some(reason) = full_reload {
        tracing::debug!(%reason, "full reload");
        let _ = state.hmr_tx.send(HmrPayload::FullReload);
    } else if !updates.is_empty() {
        let _ = state.hmr_tx.send(HmrPayload::Update { updates });
    }
}

/// Whether a path should be ignored by the file watcher.
fn should_ignore(path: &Path) -> bool {
    if path.components().any(|c| {
        matches!(
            c.as_os_str().to_str(),
            Some("node_modules" | ".git" | "target" | "dist" | "build")
        )
    }) {
        return true;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn is_watched_source(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" | "css" | "json" | "html")
    )
}

/// Watch the project for changes, coalescing event bursts.
fn watch_files(root: &Path, change_tx: &mpsc::Sender<Vec<PathBuf>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(tx, NotifyConfig::default())?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    let mut pending: HashSet<PathBuf> = HashSet::new();
    let mut last_flush = std::time::Instant::now();

    for event in rx {
        match event {
            Ok(event) => {
                for path in event.paths {
                    if !should_ignore(&path) && is_watched_source(&path) {
                        pending.insert(path);
                    }
                }
                if pending.is_empty() {
                    continue;
                }
                let now = std::time::Instant::now();
                if now.duration_since(last_flush).as_millis() < 50 {
                    continue;
                }
                last_flush = now;
                let changed: Vec<PathBuf> = pending.drain().collect();
                if change_tx.blocking_send(changed).is_err() {
                    break;
                }
            }
            Err(err) => tracing::warn!(%err, "watch error"),
        }
    }
    Ok(())
}

// ============================================================================
// Utilities
// ============================================================================

/// Open a URL in the default browser.
fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", url])
            .spawn()?;
    }
    Ok(())
}
