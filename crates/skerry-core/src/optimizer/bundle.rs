//! Dependency artifact generation.
//!
//! The heavy code-transform backend is an external capability, so bundling
//! is a trait. The in-repo `ProxyBundler` writes one facade artifact per
//! dependency: an ESM re-export facade, or a CJS interop wrapper that
//! synthesizes a default binding plus statically visible named exports.
//! Artifact names are flattened so bundler directory heuristics never leak
//! into the public names.

use crate::error::{Error, Result};
use crate::scan::{scan_cjs_exports, ExportsData};
use std::path::{Path, PathBuf};

/// One dependency entry handed to the bundler.
#[derive(Debug, Clone)]
pub struct DepEntry {
    /// Original bare specifier.
    pub id: String,
    /// Flattened, collision-free artifact id (no slashes or dots).
    pub flat_id: String,
    /// Resolved source entry file.
    pub src: PathBuf,
    /// Export shape summary of the entry.
    pub exports_data: ExportsData,
    /// Whether the dependency needs CJS interop.
    pub needs_interop: bool,
}

/// A produced artifact.
#[derive(Debug, Clone)]
pub struct BundledArtifact {
    /// Original bare specifier.
    pub id: String,
    /// Artifact file name within the output directory.
    pub file_name: String,
}

/// Bundles dependency entries into single-file artifacts.
pub trait DepBundler: Send + Sync {
    /// Bundle every entry into `out_dir`. Per-entry failure fails the pass.
    fn bundle(&self, deps: &[DepEntry], out_dir: &Path) -> Result<Vec<BundledArtifact>>;
}

/// Default facade bundler.
///
/// ESM entries get a re-export facade pointing at the source entry served
/// through `/@fs/`; CJS entries are inlined into an interop wrapper. A real
/// bundler backend plugs in behind [`DepBundler`] without changing the
/// artifact layout or metadata contract.
#[derive(Debug, Default)]
pub struct ProxyBundler;

impl ProxyBundler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DepBundler for ProxyBundler {
    fn bundle(&self, deps: &[DepEntry], out_dir: &Path) -> Result<Vec<BundledArtifact>> {
        let mut artifacts = Vec::with_capacity(deps.len());
        for dep in deps {
            let code = if dep.needs_interop {
                let source = std::fs::read_to_string(&dep.src)
                    .map_err(|err| Error::Bundle(format!("read {}: {err}", dep.src.display())))?;
                cjs_interop_wrapper(&dep.id, &source)
            } else {
                esm_facade(&dep.src, &dep.exports_data)
            };
            let file_name = format!("{}.js", dep.flat_id);
            std::fs::write(out_dir.join(&file_name), code)
                .map_err(|err| Error::Bundle(format!("write {file_name}: {err}")))?;
            artifacts.push(BundledArtifact {
                id: dep.id.clone(),
                file_name,
            });
        }
        Ok(artifacts)
    }
}

/// Flatten a specifier into a collision-free artifact id: slashes and dots
/// escaped so nesting never leaks into public names.
#[must_use]
pub fn flatten_id(specifier: &str) -> String {
    specifier
        .replace(['/', ':'], "_")
        .replace('.', "__")
}

/// Whether a dependency exposing this export shape needs CJS interop:
/// no ESM import/export syntax at all indicates CJS/UMD.
#[must_use]
pub fn needs_interop(exports: &ExportsData) -> bool {
    !exports.has_imports && exports.exports.is_empty() && !exports.has_re_exports
}

/// Re-export facade for an ESM entry.
fn esm_facade(src: &Path, exports: &ExportsData) -> String {
    let src_url = format!("/@fs{}", src.display());
    let mut code = format!("export * from {src_url:?};\n");
    if exports.exports.iter().any(|name| name == "default") {
        code.push_str(&format!("export {{ default }} from {src_url:?};\n"));
    }
    code
}

/// Interop wrapper inlining a CJS entry: evaluates the module body and
/// re-exposes `module.exports` as the default export plus statically
/// visible named exports.
fn cjs_interop_wrapper(id: &str, source: &str) -> String {
    let mut code = String::new();
    code.push_str(&format!("// interop wrapper for {id}\n"));
    code.push_str("const module = { exports: {} };\nconst exports = module.exports;\n");
    code.push_str("(function (module, exports) {\n");
    code.push_str(source);
    code.push_str("\n})(module, exports);\n");
    code.push_str("const __skerry_exports = module.exports;\nexport default __skerry_exports;\n");
    for name in scan_cjs_exports(source) {
        code.push_str(&format!(
            "export const {name} = __skerry_exports.{name};\n"
        ));
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::scan_exports;

    #[test]
    fn flatten_escapes_slashes_and_dots() {
        assert_eq!(flatten_id("left-pad"), "left-pad");
        assert_eq!(flatten_id("lodash/fp"), "lodash_fp");
        assert_eq!(flatten_id("@scope/pkg"), "@scope_pkg");
        assert_eq!(flatten_id("pkg.js/sub"), "pkg__js_sub");
    }

    #[test]
    fn interop_detection() {
        let cjs = scan_exports("module.exports = function () {};\n");
        assert!(needs_interop(&cjs));
        let esm = scan_exports("export default 1;\n");
        assert!(!needs_interop(&esm));
        let reexport = scan_exports("export * from \"./impl\";\n");
        assert!(!needs_interop(&reexport));
    }

    #[test]
    fn proxy_bundler_writes_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("pkg/index.js");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, "exports.pad = function (s) { return s; };\n").unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();

        let source = std::fs::read_to_string(&src).unwrap();
        let exports_data = scan_exports(&source);
        let deps = vec![DepEntry {
            id: "left-pad".to_string(),
            flat_id: flatten_id("left-pad"),
            src: src.clone(),
            needs_interop: needs_interop(&exports_data),
            exports_data,
        }];

        let bundler = ProxyBundler::new();
        let artifacts = bundler.bundle(&deps, &out).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].file_name, "left-pad.js");

        let code = std::fs::read_to_string(out.join("left-pad.js")).unwrap();
        assert!(code.contains("export default"));
        assert!(code.contains("export const pad"));
    }

    #[test]
    fn esm_entry_gets_facade() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("mod/index.mjs");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, "export const x = 1;\nexport default x;\n").unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();

        let source = std::fs::read_to_string(&src).unwrap();
        let exports_data = scan_exports(&source);
        let deps = vec![DepEntry {
            id: "modpkg".to_string(),
            flat_id: flatten_id("modpkg"),
            src: src.clone(),
            needs_interop: needs_interop(&exports_data),
            exports_data,
        }];

        ProxyBundler::new().bundle(&deps, &out).unwrap();
        let code = std::fs::read_to_string(out.join("modpkg.js")).unwrap();
        assert!(code.contains("export * from"));
        assert!(code.contains("export { default } from"));
        assert!(code.contains("/@fs"));
    }
}
