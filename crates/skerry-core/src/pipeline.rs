//! Plugin hook pipeline.
//!
//! Two composition strategies over an ordered plugin list: `resolve_id` and
//! `load` short-circuit on the first plugin returning `Some`, while
//! `transform` folds each plugin's output into the next.

use std::fmt;

/// Result type for plugin hooks.
pub type HookResult<T> = Result<T, PluginError>;

/// Error raised by a plugin hook.
#[derive(Debug)]
pub struct PluginError {
    /// Plugin name.
    pub plugin: String,
    /// Hook that failed.
    pub hook: &'static str,
    /// Error message.
    pub message: String,
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin {} failed in {}: {}", self.plugin, self.hook, self.message)
    }
}

impl std::error::Error for PluginError {}

/// A transform-pipeline plugin.
///
/// All hooks default to "not handled" so plugins implement only what they
/// need.
pub trait Plugin: Send + Sync {
    /// Plugin name for diagnostics.
    fn name(&self) -> &str;

    /// Resolve a specifier to an id. `Some` short-circuits the chain.
    fn resolve_id(&self, _specifier: &str, _importer: Option<&str>) -> HookResult<Option<String>> {
        Ok(None)
    }

    /// Load source for an id. `Some` short-circuits the chain.
    fn load(&self, _id: &str) -> HookResult<Option<String>> {
        Ok(None)
    }

    /// Transform source. Each plugin sees the previous plugin's output.
    fn transform(&self, _code: &str, _id: &str) -> HookResult<Option<String>> {
        Ok(None)
    }
}

/// Ordered plugin container.
#[derive(Default)]
pub struct PluginContainer {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginContainer {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin. Hooks run in insertion order.
    pub fn add(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Whether any plugins are registered.
    #[must_use]
    pub fn has_plugins(&self) -> bool {
        !self.plugins.is_empty()
    }

    /// Short-circuiting resolution: first `Some` wins.
    pub fn resolve_id(
        &self,
        specifier: &str,
        importer: Option<&str>,
    ) -> HookResult<Option<String>> {
        for plugin in &self.plugins {
            if let Some(id) = plugin.resolve_id(specifier, importer)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Short-circuiting load: first `Some` wins.
    pub fn load(&self, id: &str) -> HookResult<Option<String>> {
        for plugin in &self.plugins {
            if let Some(code) = plugin.load(id)? {
                return Ok(Some(code));
            }
        }
        Ok(None)
    }

    /// Folding transform: every plugin's output feeds the next.
    pub fn transform(&self, code: &str, id: &str) -> HookResult<String> {
        let mut current = code.to_string();
        for plugin in &self.plugins {
            if let Some(next) = plugin.transform(&current, id)? {
                current = next;
            }
        }
        Ok(current)
    }
}
