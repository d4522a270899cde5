//! Error taxonomy.
//!
//! Only [`IdentityError`] and [`GatewayError`] are allowed to stop the
//! process. Everything else is scoped to one label token or one container.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a container runtime call (list, inspect, events, info).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// The sidecar could not work out which container it is, or whose network
/// namespace it shares.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unsupported environment: {0}")]
    Unsupported(String),

    #[error("own container id not found in {path:?}, was the container started with --cgroupns host?")]
    NotInContainer { path: PathBuf },

    #[error("no container matches {what}")]
    NoMatch { what: String },

    #[error("ambiguous {what}: candidates {candidates:?}")]
    Ambiguous {
        what: String,
        candidates: Vec<String>,
    },

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime error during identity resolution: {0}")]
    Runtime(#[from] RuntimeError),
}

/// The gateway address could not be determined.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("container {container} is not attached to network {network}")]
    NotAttached { container: String, network: String },

    #[error("container {container} has no address on network {network}")]
    NoAddress { container: String, network: String },

    #[error("invalid address {address:?} on network {network}")]
    InvalidAddress { address: String, network: String },

    #[error("runtime error during gateway resolution: {0}")]
    Runtime(#[from] RuntimeError),
}

/// One rejected token of a `wgroutemgr.networks` label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid network {token:?}: {reason}")]
pub struct LabelParseError {
    pub token: String,
    pub reason: String,
}

/// A route mutation inside a container namespace failed.
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("network namespace {path:?} no longer exists")]
    Gone { path: PathBuf },

    #[error("failed to enter network namespace {path:?}: {source}")]
    Enter {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open own network namespace: {0}")]
    Origin(#[source] std::io::Error),

    #[error("failed to spawn `{cmd}`: {source}")]
    Command {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{cmd}` failed: {stderr}")]
    RouteFailed { cmd: String, stderr: String },

    #[error("unexpected output of `{cmd}`: {source}")]
    Output {
        cmd: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("namespace operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("namespace worker thread failed: {0}")]
    Thread(String),
}

/// Why the container watcher stopped or skipped a resync.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("event consumer closed the channel")]
    ConsumerClosed,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl RuntimeError {
    /// True when the daemon answered that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}

impl NamespaceError {
    /// True when the namespace vanished, i.e. the container exited between
    /// discovery and execution.
    pub fn is_gone(&self) -> bool {
        matches!(self, NamespaceError::Gone { .. })
    }
}
