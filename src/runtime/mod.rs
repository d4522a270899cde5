use std::time::SystemTime;

use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, EventMessage};
use futures_util::stream::BoxStream;

use crate::error::RuntimeError;

pub mod docker;
pub use docker::DockerRuntime;

#[cfg(test)]
pub mod mock;

/// Container management capabilities consumed by the route manager.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Description of the host operating system, as reported by the daemon.
    async fn operating_system(&self) -> Result<String, RuntimeError>;

    /// Ids of running containers carrying `label`.
    async fn list_labelled(&self, label: &str) -> Result<Vec<String>, RuntimeError>;

    /// Inspect a container by id or name.
    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse, RuntimeError>;

    /// Container lifecycle events that happened at or after `since`, followed
    /// by live ones. The stream ends when the connection to the daemon is
    /// lost.
    fn events(&self, since: SystemTime) -> BoxStream<'_, Result<EventMessage, RuntimeError>>;
}
