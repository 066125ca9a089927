//! Host-internal error types for the build and config adapters.
//!
//! The module-facing taxonomy lives in `remod_api::HostError`; these
//! convert into its `BuildFailed`/`LoadFailed` variants at the load site.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the compile cache and build driver.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("module source not found: {0}")]
    MissingSource(PathBuf),

    #[error("compiler exited with {status}: {log}")]
    Driver { status: String, log: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from opening a shared object and resolving its factory.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("dlopen failed for {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("symbol {symbol} not found: {reason}")]
    Symbol { symbol: String, reason: String },

    #[error("factory {symbol} returned null")]
    NullFactory { symbol: String },
}

/// Errors from loading `HostConfig` from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
