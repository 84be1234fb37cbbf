use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HcpError>;

#[derive(Debug, Error)]
pub enum HcpError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} named '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("invalid node template: {0}")]
    InvalidTemplate(String),

    #[error("invalid cluster request: {0}")]
    InvalidRequest(String),

    /// Detected before any VM exists; nothing to clean up.
    #[error("planning failed: {0}")]
    Planning(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("nodes not ready after {}s: {}", waited.as_secs(), pending.join(", "))]
    ReadinessTimeout {
        waited: Duration,
        pending: Vec<String>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("a provisioning job is already running for cluster '{0}'")]
    JobInProgress(String),

    #[error("cluster '{id}' is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: String,
        expected: &'static str,
    },

    #[error("{kind} '{id}' is still in use")]
    InUse { kind: &'static str, id: String },

    #[error("compute error: {0}")]
    Compute(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),
}

impl HcpError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        HcpError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HcpError::NotFound { .. })
    }
}

/// Failures of the remote command executor.
///
/// Connection-level failures are transient: a freshly booted VM refuses
/// connections and rejects keys until cloud-init has finished. A non-zero exit
/// after a successful connection means the command itself failed.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("authentication rejected by {host}")]
    AuthRejected { host: String },

    #[error("`{command}` on {host} exited with {code}: {stderr}")]
    NonZeroExit {
        host: String,
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to launch ssh: {0}")]
    Spawn(#[from] std::io::Error),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Unreachable { .. } | RemoteError::AuthRejected { .. }
        )
    }
}
