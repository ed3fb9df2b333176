use std::time::Duration;
use thiserror::Error;

/// Errors raised by the node-state harness.
///
/// Orchestration code wraps these in `anyhow` with context; callers that need
/// to tell a malformed configuration from a convergence timeout match on the
/// variant instead.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// the suite cannot run at all (missing executable, no cluster access)
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// a configuration file on the node holds an ambiguous or unparsable setting
    #[error("malformed configuration: {0}")]
    MalformedConfig(String),

    #[error("invalid CPU set {input:?}: {reason}")]
    InvalidCpuSet { input: String, reason: String },

    #[error("command {command:?} failed on node {node}: {message}")]
    CommandFailed {
        node: String,
        command: String,
        message: String,
    },

    #[error("failed to back up {path}: {source}")]
    Backup {
        path: String,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("failed to restore {path}: {source}")]
    Restore {
        path: String,
        #[source]
        source: Box<HarnessError>,
    },

    /// node state differs from what the scenario requires
    #[error("{0}")]
    StateMismatch(String),

    #[error("timed out after {timeout:?} waiting for {what}{}", last_error_suffix(.last_error))]
    Timeout {
        what: String,
        timeout: Duration,
        last_error: Option<String>,
    },

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {})", e),
        None => String::new(),
    }
}

impl HarnessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_malformed_config(&self) -> bool {
        matches!(self, Self::MalformedConfig(_))
    }
}
