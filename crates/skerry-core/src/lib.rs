#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

pub mod config;
pub mod error;
pub mod graph;
pub mod hmr;
pub mod optimizer;
pub mod packages;
pub mod pipeline;
pub mod resolver;
pub mod rewrite;
pub mod scan;
pub mod transform;

pub use config::DevConfig;
pub use error::{Error, Result};
pub use graph::{ModuleGraph, ModuleKind, ModuleNode, TransformResult};
pub use hmr::{handle_file_change, HmrDecision, HmrPayload, HmrUpdate};
pub use optimizer::{DepsOptimizer, OptimizedDepInfo, OptimizerState, ProxyBundler, SignalState};
pub use packages::PackageCache;
pub use pipeline::{Plugin, PluginContainer};
pub use resolver::{ResolutionKind, Resolved, ResolveOpts, Resolver};
pub use rewrite::{ImportRewriter, DEPS_URL_PREFIX, FS_URL_PREFIX};
pub use scan::{scan_exports, scan_imports, ExportsData, ImportKind, ImportSpec};
pub use transform::ModuleTransformer;
