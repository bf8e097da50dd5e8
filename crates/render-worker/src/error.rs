// Error types at the worker's seams: talking to the manager, and the fatal
// startup failures that end the process.

use thiserror::Error;

/// A manager request that produced no usable HTTP response.
///
/// Transport failures and timeouts are transient; a reply that cannot be
/// decoded or a URL that cannot be built stays broken on retry.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error("request {method} {path} failed: {message}")]
    Transport {
        method: &'static str,
        path: String,
        message: String,
    },

    #[error("request {method} {path} timed out")]
    Timeout { method: &'static str, path: String },

    #[error("response to {method} {path} is not valid JSON: {message}")]
    Decode {
        method: &'static str,
        path: String,
        message: String,
    },

    #[error("invalid manager URL for {path}: {message}")]
    InvalidUrl { path: String, message: String },
}

impl ManagerError {
    /// Whether the same request may succeed when sent again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ManagerError::Transport { .. } | ManagerError::Timeout { .. }
        )
    }
}

/// Errors that stop the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("manager rejected registration with HTTP {status}: {body}")]
    RegistrationRejected { status: u16, body: String },

    #[error("manager accepted registration but returned no worker id: {0}")]
    InvalidRegistrationResponse(String),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("configuration error: {0:#}")]
    Configuration(#[from] anyhow::Error),

    #[error("worker is not registered")]
    NotRegistered,
}

impl WorkerError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Manager(e) if e.is_transient())
    }
}
