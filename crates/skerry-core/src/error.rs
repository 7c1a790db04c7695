//! Error types for skerry-core.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read package.json at {path}")]
    PackageJsonRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid package.json at {path}")]
    PackageJsonParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot resolve \"{specifier}\" from {importer}")]
    Resolve { specifier: String, importer: String },

    #[error("failed to load module {id}")]
    Load {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {plugin} failed in {hook} hook: {message}")]
    Plugin {
        plugin: String,
        hook: &'static str,
        message: String,
    },

    #[error("bundling pass failed: {0}")]
    Bundle(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for constructing an `Error::Other`.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

impl From<crate::pipeline::PluginError> for Error {
    fn from(err: crate::pipeline::PluginError) -> Self {
        Self::Plugin {
            plugin: err.plugin,
            hook: err.hook,
            message: err.message,
        }
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
