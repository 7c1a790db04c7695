//! Request-to-module transformation.
//!
//! Takes a server URL, resolves it to source, runs the plugin pipeline,
//! rewrites imports and records the result in the module graph. CSS, JSON
//! and asset requests become JS modules so everything the browser fetches
//! through an import is an ES module.

use crate::config::is_asset_path;
use crate::error::{Error, Result};
use crate::graph::{ModuleGraph, ModuleKind, TransformResult};
use crate::hmr::hot_context_preamble;
use crate::optimizer::DepsOptimizer;
use crate::pipeline::PluginContainer;
use crate::resolver::{ResolveOpts, Resolved, Resolver};
use crate::rewrite::{ImportRewriter, FS_URL_PREFIX};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const JS_CONTENT_TYPE: &str = "application/javascript";

/// Per-server module transformer.
pub struct ModuleTransformer {
    root: PathBuf,
    rewriter: ImportRewriter,
}

impl ModuleTransformer {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            rewriter: ImportRewriter::new(root.clone()),
            root,
        }
    }

    /// Transform the module behind a server URL, using the graph as a cache.
    ///
    /// The URL keeps its `?import` marker (asset modules are distinct graph
    /// nodes) but cache-busting queries are stripped first.
    pub fn transform(
        &self,
        url: &str,
        resolver: &Resolver,
        optimizer: Option<&Arc<DepsOptimizer>>,
        graph: &ModuleGraph,
        plugins: &PluginContainer,
    ) -> Result<TransformResult> {
        let url = strip_cache_bust(url);
        if let Some(cached) = graph.get_transform_result(&url) {
            tracing::trace!(url = %url, "transform cache hit");
            return Ok(cached);
        }

        let (path_part, is_import_query) = match url.split_once('?') {
            Some((path, query)) => (path.to_string(), query.split('&').any(|q| q == "import")),
            None => (url.clone(), false),
        };

        let (id, code) = self.load(&path_part, resolver, plugins)?;

        if is_import_query && is_asset_path(&id) {
            let result = TransformResult {
                code: format!("export default {path_part:?};\n"),
                content_type: JS_CONTENT_TYPE,
            };
            graph.ensure_entry_from_url(&url, Some(&id), ModuleKind::Js);
            graph.set_transform_result(&url, result.clone());
            return Ok(result);
        }

        match id.extension().and_then(|e| e.to_str()) {
            Some("css") => {
                let result = self.transform_css(&url, &code);
                graph.ensure_entry_from_url(&url, Some(&id), ModuleKind::Css);
                graph.set_module_kind(&url, ModuleKind::Css, true);
                graph.update_module_info(&url, &HashSet::new(), &HashSet::new(), true);
                graph.set_transform_result(&url, result.clone());
                Ok(result)
            }
            Some("json") => {
                let result = TransformResult {
                    code: format!("export default {code};\n"),
                    content_type: JS_CONTENT_TYPE,
                };
                graph.ensure_entry_from_url(&url, Some(&id), ModuleKind::Js);
                graph.set_transform_result(&url, result.clone());
                Ok(result)
            }
            _ => {
                let id_str = id.display().to_string();
                let code = plugins.transform(&code, &id_str)?;

                let rewritten = self.rewriter.rewrite(&code, &id, resolver, optimizer);
                let mut output = hot_context_preamble(&url);
                output.push_str(&rewritten.code);

                graph.ensure_entry_from_url(&url, Some(&id), ModuleKind::Js);
                graph.update_module_info(
                    &url,
                    &rewritten.imported_urls,
                    &rewritten.accepted_urls,
                    rewritten.is_self_accepting,
                );
                let result = TransformResult {
                    code: output,
                    content_type: JS_CONTENT_TYPE,
                };
                graph.set_transform_result(&url, result.clone());
                Ok(result)
            }
        }
    }

    /// Resolve a URL path to a file id and its source, with plugin hooks
    /// taking precedence over the filesystem.
    fn load(
        &self,
        path_part: &str,
        resolver: &Resolver,
        plugins: &PluginContainer,
    ) -> Result<(PathBuf, String)> {
        if let Some(id) = plugins.resolve_id(path_part, None)? {
            let code = plugins
                .load(&id)?
                .ok_or_else(|| Error::other(format!("plugin resolved {id} but nothing loaded it")))?;
            return Ok((PathBuf::from(id), code));
        }

        let specifier = path_part
            .strip_prefix(FS_URL_PREFIX)
            .unwrap_or(path_part)
            .to_string();
        let resolved = resolver.resolve(&specifier, None, ResolveOpts::default());
        let id = match resolved {
            Resolved::Id(id) => id,
            Resolved::External | Resolved::NotFound => {
                return Err(Error::Resolve {
                    specifier: path_part.to_string(),
                    importer: "<request>".to_string(),
                })
            }
        };

        if is_asset_path(&id) {
            // Asset modules never read the payload
            return Ok((id, String::new()));
        }
        let code = std::fs::read_to_string(&id).map_err(|err| Error::Load {
            id: id.display().to_string(),
            source: err,
        })?;
        Ok((id, code))
    }

    /// CSS served as a self-accepting JS module that injects a style tag and
    /// removes it again when disposed.
    fn transform_css(&self, url: &str, css: &str) -> TransformResult {
        let escaped = serde_json::to_string(css).unwrap_or_else(|_| "\"\"".to_string());
        let mut code = hot_context_preamble(url);
        code.push_str(&format!(
            r#"const __skerry_css = {escaped};
const __skerry_style = document.createElement("style");
__skerry_style.setAttribute("data-skerry-id", {url:?});
__skerry_style.textContent = __skerry_css;
document.head.appendChild(__skerry_style);
import.meta.hot.accept();
import.meta.hot.dispose(() => {{
  __skerry_style.remove();
}});
export default __skerry_css;
"#
        ));
        TransformResult {
            code,
            content_type: JS_CONTENT_TYPE,
        }
    }

    /// The server root this transformer serves from.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Drop cache-busting queries (`?t=`, `?v=`) while keeping `?import`.
fn strip_cache_bust(url: &str) -> String {
    let Some((path, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|part| !part.starts_with("t=") && !part.starts_with("v="))
        .collect();
    if kept.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", kept.join("&"))
    }
}
