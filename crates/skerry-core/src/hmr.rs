//! Hot-module-reload engine.
//!
//! Computes, for a changed file, the minimal client notification: a bounded
//! set of update boundaries, or a full page reload when no boundary exists.
//! Also owns the WebSocket message contract and the embedded client runtime.

use crate::graph::{ModuleGraph, ModuleKind, now_ms};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

/// Kind of a bounded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    JsUpdate,
    CssUpdate,
}

/// One bounded update entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HmrUpdate {
    /// Update kind, decided by the boundary module's kind.
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Milliseconds timestamp for cache busting.
    pub timestamp: u64,
    /// URL of the boundary module that applies the update.
    pub path: String,
    /// URL of the changed module the boundary accepted.
    #[serde(rename = "acceptedPath")]
    pub accepted_path: String,
}

/// Server → client WebSocket payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HmrPayload {
    Connected,
    Update { updates: Vec<HmrUpdate> },
    FullReload,
}

/// Decision for one file-change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HmrDecision {
    /// No graph node for the file; nothing to send.
    NoOp,
    /// Bounded updates to broadcast.
    Update(Vec<HmrUpdate>),
    /// Escalate to a full page reload.
    FullReload { reason: String },
}

/// Handle a watcher event for one file: invalidate affected modules and
/// compute the client notification.
#[must_use]
pub fn handle_file_change(graph: &ModuleGraph, file: &Path) -> HmrDecision {
    let urls = graph.urls_for_file(file);
    if urls.is_empty() {
        tracing::debug!(file = %file.display(), "no update happened");
        return HmrDecision::NoOp;
    }

    let timestamp = now_ms();
    let mut updates = Vec::new();
    for url in urls {
        graph.invalidate(&url);
        match propagate_update(graph, &url) {
            Propagation::DeadEnd(reason) => {
                tracing::debug!(%url, %reason, "update escalated to full reload");
                return HmrDecision::FullReload { reason };
            }
            Propagation::Boundaries(boundaries) => {
                for (boundary, accepted) in boundaries {
                    let kind = match graph.get(&boundary).map(|n| n.kind) {
                        Some(ModuleKind::Css) => UpdateKind::CssUpdate,
                        _ => UpdateKind::JsUpdate,
                    };
                    updates.push(HmrUpdate {
                        kind,
                        timestamp,
                        path: boundary,
                        accepted_path: accepted.clone(),
                    });
                }
            }
        }
    }
    HmrDecision::Update(updates)
}

/// Result of walking importers from a changed module.
#[derive(Debug)]
enum Propagation {
    /// `(boundary url, accepted url)` pairs.
    Boundaries(Vec<(String, String)>),
    /// Some branch reached a module with no accepting ancestor.
    DeadEnd(String),
}

/// Find the update boundaries for a changed module.
///
/// Self-accepting modules are their own boundary. A module with no importers
/// is a root: dead end. Otherwise each importer either accepts the changed
/// module (boundary) or the walk recurses upward. Any dead-ended branch
/// escalates the whole update; correctness over granularity.
fn propagate_update(graph: &ModuleGraph, url: &str) -> Propagation {
    let Some(node) = graph.get(url) else {
        return Propagation::DeadEnd(format!("unknown module {url}"));
    };

    if node.is_self_accepting {
        return Propagation::Boundaries(vec![(url.to_string(), url.to_string())]);
    }

    let mut boundaries = Vec::new();
    let mut visited = HashSet::new();
    if walk(graph, url, &mut visited, &mut boundaries) {
        return Propagation::DeadEnd(format!("no accepting boundary above {url}"));
    }
    if boundaries.is_empty() {
        // Only reachable through an import cycle with no accepting member
        return Propagation::DeadEnd(format!("no accepting boundary in cycle around {url}"));
    }
    Propagation::Boundaries(boundaries)
}

/// Walk importers upward. Returns true when a branch dead-ends.
///
/// The visited set makes cyclic import graphs terminate; already-visited
/// nodes are skipped rather than re-walked.
fn walk(
    graph: &ModuleGraph,
    url: &str,
    visited: &mut HashSet<String>,
    boundaries: &mut Vec<(String, String)>,
) -> bool {
    let Some(node) = graph.get(url) else {
        return true;
    };

    if node.importers.is_empty() {
        return true;
    }

    for importer in &node.importers {
        let Some(importer_node) = graph.get(importer) else {
            return true;
        };
        if importer_node.accepted_hmr_deps.contains(url) {
            boundaries.push((importer.clone(), url.to_string()));
            continue;
        }
        if importer_node.is_self_accepting {
            boundaries.push((importer.clone(), importer.clone()));
            continue;
        }
        if !visited.insert(importer.clone()) {
            continue;
        }
        if walk(graph, importer, visited, boundaries) {
            return true;
        }
    }
    false
}

/// URL the client runtime is served from.
pub const CLIENT_PATH: &str = "/@hmr/client";

/// Preamble injected into every served JS module to wire up
/// `import.meta.hot`.
#[must_use]
pub fn hot_context_preamble(url: &str) -> String {
    format!(
        "import {{ createHotContext as __skerryCreateHotContext }} from \"{CLIENT_PATH}\";\nimport.meta.hot = __skerryCreateHotContext({url:?});\n"
    )
}

/// The browser-side HMR runtime, served at [`CLIENT_PATH`].
#[must_use]
pub fn client_runtime() -> &'static str {
    r#"// skerry HMR client
const socketUrl = `${location.protocol === 'https:' ? 'wss' : 'ws'}://${location.host}/__hmr`;
const socket = new WebSocket(socketUrl);

const hotModules = new Map();
const pruneCallbacks = new Map();
const disposeCallbacks = new Map();

export function createHotContext(ownerPath) {
  const mod = { id: ownerPath, callbacks: [] };
  hotModules.set(ownerPath, mod);
  return {
    accept(deps, callback) {
      if (deps === undefined || typeof deps === 'function') {
        // Self-accepting: accept(), accept(cb)
        mod.callbacks.push({ deps: [ownerPath], fn: deps || (() => {}) });
      } else if (typeof deps === 'string') {
        mod.callbacks.push({ deps: [deps], fn: callback || (() => {}) });
      } else if (Array.isArray(deps)) {
        mod.callbacks.push({ deps, fn: callback || (() => {}) });
      }
    },
    dispose(callback) {
      disposeCallbacks.set(ownerPath, callback);
    },
    prune(callback) {
      pruneCallbacks.set(ownerPath, callback);
    },
    invalidate() {
      location.reload();
    },
  };
}

async function applyUpdate({ path, acceptedPath, timestamp }) {
  const mod = hotModules.get(path);
  if (!mod) {
    location.reload();
    return;
  }
  const dispose = disposeCallbacks.get(acceptedPath);
  if (dispose) dispose();
  const fresh = await import(`${acceptedPath}?t=${timestamp}`);
  for (const { deps, fn } of mod.callbacks) {
    if (deps.includes(acceptedPath) || (acceptedPath === path && deps.includes(path))) {
      fn(fresh);
    }
  }
  console.debug(`[skerry] hot updated: ${acceptedPath}`);
}

socket.addEventListener('message', async ({ data }) => {
  const payload = JSON.parse(data);
  switch (payload.type) {
    case 'connected':
      console.debug('[skerry] connected');
      break;
    case 'update':
      for (const update of payload.updates) {
        await applyUpdate(update);
      }
      break;
    case 'full-reload':
      location.reload();
      break;
  }
});

socket.addEventListener('close', () => {
  console.debug('[skerry] server connection lost, polling for restart...');
  const poll = setInterval(async () => {
    try {
      await fetch('/');
      clearInterval(poll);
      location.reload();
    } catch {
      // keep polling
    }
  }, 1000);
});
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ModuleGraph;

    fn set(urls: &[&str]) -> HashSet<String> {
        urls.iter().map(|u| (*u).to_string()).collect()
    }

    fn graph_with_file(url: &str, file: &str) -> ModuleGraph {
        let graph = ModuleGraph::new();
        graph.ensure_entry_from_url(url, Some(Path::new(file)), ModuleKind::Js);
        graph
    }

    #[test]
    fn unknown_file_is_noop() {
        let graph = ModuleGraph::new();
        let decision = handle_file_change(&graph, Path::new("/proj/unknown.ts"));
        assert_eq!(decision, HmrDecision::NoOp);
    }

    #[test]
    fn self_accepting_never_full_reloads() {
        let graph = graph_with_file("/widget.ts", "/proj/widget.ts");
        graph.update_module_info("/entry.ts", &set(&["/widget.ts"]), &set(&[]), false);
        graph.update_module_info("/widget.ts", &set(&[]), &set(&[]), true);

        let decision = handle_file_change(&graph, Path::new("/proj/widget.ts"));
        match decision {
            HmrDecision::Update(updates) => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].path, "/widget.ts");
                assert_eq!(updates[0].accepted_path, "/widget.ts");
                assert_eq!(updates[0].kind, UpdateKind::JsUpdate);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn root_module_forces_full_reload() {
        let graph = graph_with_file("/entry.ts", "/proj/entry.ts");
        let decision = handle_file_change(&graph, Path::new("/proj/entry.ts"));
        assert!(matches!(decision, HmrDecision::FullReload { .. }));
    }

    #[test]
    fn ancestor_accepting_dep_is_boundary() {
        let graph = graph_with_file("/child.ts", "/proj/child.ts");
        graph.update_module_info("/parent.ts", &set(&["/child.ts"]), &set(&["/child.ts"]), false);
        // Parent has an importer so the walk does not dead-end above it
        graph.update_module_info("/entry.ts", &set(&["/parent.ts"]), &set(&[]), false);
        graph.ensure_entry_from_url("/entry.ts", Some(Path::new("/proj/entry.ts")), ModuleKind::Js);

        let decision = handle_file_change(&graph, Path::new("/proj/child.ts"));
        match decision {
            HmrDecision::Update(updates) => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].path, "/parent.ts");
                assert_eq!(updates[0].accepted_path, "/child.ts");
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn unaccepted_branch_escalates() {
        let graph = graph_with_file("/leaf.ts", "/proj/leaf.ts");
        graph.update_module_info("/entry.ts", &set(&["/leaf.ts"]), &set(&[]), false);

        let decision = handle_file_change(&graph, Path::new("/proj/leaf.ts"));
        assert!(matches!(decision, HmrDecision::FullReload { .. }));
    }

    #[test]
    fn css_boundary_produces_css_update() {
        let graph = ModuleGraph::new();
        graph.ensure_entry_from_url(
            "/style.css",
            Some(Path::new("/proj/style.css")),
            ModuleKind::Css,
        );
        graph.update_module_info("/entry.ts", &set(&["/style.css"]), &set(&[]), false);
        graph.set_module_kind("/style.css", ModuleKind::Css, true);

        let decision = handle_file_change(&graph, Path::new("/proj/style.css"));
        match decision {
            HmrDecision::Update(updates) => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].kind, UpdateKind::CssUpdate);
                assert_eq!(updates[0].path, "/style.css");
            }
            other => panic!("expected css update, got {other:?}"),
        }
    }

    #[test]
    fn cyclic_graph_terminates() {
        let graph = graph_with_file("/a.ts", "/proj/a.ts");
        graph.update_module_info("/a.ts", &set(&["/b.ts"]), &set(&[]), false);
        graph.update_module_info("/b.ts", &set(&["/a.ts"]), &set(&[]), false);

        // No boundary anywhere in the cycle; must terminate with full reload
        let decision = handle_file_change(&graph, Path::new("/proj/a.ts"));
        assert!(matches!(decision, HmrDecision::FullReload { .. }));
    }

    #[test]
    fn payload_wire_format() {
        let payload = HmrPayload::Update {
            updates: vec![HmrUpdate {
                kind: UpdateKind::JsUpdate,
                timestamp: 42,
                path: "/a.ts".to_string(),
                accepted_path: "/b.ts".to_string(),
            }],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["updates"][0]["type"], "js-update");
        assert_eq!(json["updates"][0]["acceptedPath"], "/b.ts");

        assert_eq!(
            serde_json::to_value(HmrPayload::Connected).unwrap()["type"],
            "connected"
        );
        assert_eq!(
            serde_json::to_value(HmrPayload::FullReload).unwrap()["type"],
            "full-reload"
        );
    }

    #[test]
    fn preamble_references_client() {
        let preamble = hot_context_preamble("/src/app.ts");
        assert!(preamble.contains(CLIENT_PATH));
        assert!(preamble.contains("\"/src/app.ts\""));
        assert!(client_runtime().contains("createHotContext"));
    }
}
