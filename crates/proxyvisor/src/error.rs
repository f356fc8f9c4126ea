//! Error types for provisioning, launching and lifecycle operations.

use std::path::PathBuf;
use thiserror::Error;

use crate::launch::LaunchStrategy;

/// Result type for binary provisioning.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// A binary could not be made present, valid and executable.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The bundled asset does not exist for this architecture.
    #[error("bundled asset not found: {0}")]
    AssetMissing(String),

    /// Filesystem error while copying or inspecting.
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The copied file failed validation.
    #[error("invalid binary {}: {reason}", .path.display())]
    InvalidBinary { path: PathBuf, reason: String },

    /// Neither set_permissions nor chmod made the file executable.
    #[error("could not make {} executable: {detail}", .path.display())]
    NotExecutable { path: PathBuf, detail: String },
}

impl ProvisionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why one launch strategy was skipped or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The strategy's sandbox (or the target binary) failed its readiness check.
    SandboxUnavailable(String),
    /// The OS refused to start the process.
    SpawnFailed(String),
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::SandboxUnavailable(reason) => write!(f, "unavailable: {reason}"),
            AttemptFailure::SpawnFailed(reason) => write!(f, "spawn failed: {reason}"),
        }
    }
}

/// Every launch strategy was exhausted.
#[derive(Debug, Error)]
#[error("all launch strategies failed: {}", summarize(.attempts))]
pub struct LaunchError {
    pub attempts: Vec<(LaunchStrategy, AttemptFailure)>,
}

fn summarize(attempts: &[(LaunchStrategy, AttemptFailure)]) -> String {
    attempts
        .iter()
        .map(|(strategy, failure)| format!("{strategy} {failure}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Lifecycle conflicts reported to callers of the service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// A process for this config is already starting or running.
    #[error("config {0} is already running")]
    AlreadyRunning(String),

    /// No process is registered for this config.
    #[error("config {0} is not running")]
    NotRunning(String),

    /// The configuration store has no entry with this id.
    #[error("unknown config: {0}")]
    UnknownConfig(String),
}
