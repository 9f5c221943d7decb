//! Typed error hierarchy for rigup.
//!
//! The enums follow the layers of the orchestrator:
//! - `AllocationError`: port allocation
//! - `ConfigError`: App configuration access
//! - `TemplateError`: config templating
//! - `AppError`: a single App's lifecycle, processes and files
//! - `ClusterError`: topology construction and cluster-wide operations

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from the TCP port allocator.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Could not allocate port (preferred={preferred:?}) in {attempts} attempts")]
    Exhausted {
        preferred: Option<u16>,
        attempts: u32,
    },

    #[error("Failed to probe for a free port: {0}")]
    Probe(#[source] std::io::Error),
}

/// Errors from reading or writing an App's configuration mapping.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config key '{key}' is owned by the orchestrator and cannot be changed")]
    ReservedKey { key: String },

    #[error("Config key '{key}' is missing")]
    MissingKey { key: String },

    #[error("Config key '{key}' has the wrong type: expected {expected}")]
    WrongType { key: String, expected: &'static str },
}

/// Errors from rendering a config template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template placeholder '%({key})' has no matching config key")]
    MissingKey { key: String },

    #[error("Template {name} not found at {path}")]
    NotFound { name: String, path: PathBuf },

    #[error("No template directory configured for template {name}")]
    NoTemplateDir { name: String },
}

/// Errors from a single App's lifecycle.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{app} already started")]
    AlreadyStarted { app: String },

    #[error("{app} cannot be restarted once it has run (state {state})")]
    NoRestart { app: String, state: String },

    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` exited with code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("Failed to wait for process {pid}: {source}")]
    WaitFailed {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Filesystem operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl AppError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from building or driving a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("No node available for {app} (requested {requested:?})")]
    NoNode {
        app: String,
        requested: Option<String>,
    },

    #[error("{app} requires a {kind} app{filter} but none is registered")]
    DependencyNotFound {
        app: String,
        kind: String,
        filter: String,
    },

    #[error("Cluster did not go operational in {}s", .timeout.as_secs_f64())]
    NotOperational { timeout: Duration },

    #[error("Unsupported platform for docker networking: {0}")]
    UnsupportedPlatform(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}
