//! Error types shared across the installer.

use std::time::Duration;

pub type InstallerResult<T> = Result<T, InstallerError>;

/// Unified error type for all installer operations.
#[derive(Debug, thiserror::Error)]
pub enum InstallerError {
    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external command could not be spawned at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external command ran but exited with a non-success status.
    #[error("`{program}` exited with status {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// A step's action failed on every attempt of its retry budget.
    #[error("step `{step}` failed after {attempts} attempt(s): {reason}")]
    ActionFailed {
        step: String,
        attempts: u32,
        reason: String,
    },

    /// A step's readiness predicate never became true within its timeout.
    #[error("step `{step}` did not become ready within {timeout:?}")]
    ReadinessTimeout { step: String, timeout: Duration },

    /// A step requires an output slot that no earlier step populated.
    #[error("{0} must run first")]
    MissingOutput(String),

    /// A manifest still contained placeholder tokens after substitution.
    #[error("unresolved placeholder `{placeholder}` in manifest {manifest}")]
    UnresolvedPlaceholder {
        manifest: String,
        placeholder: String,
    },

    /// A package or installer script download failed.
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was interrupted by a termination signal.
    #[error("installation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}
