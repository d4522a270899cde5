use super::ContainerRuntime;
use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use log::debug;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Event actions the watcher reacts to.
const WATCHED_ACTIONS: &[&str] = &["start", "update", "die", "stop", "kill", "destroy"];

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

fn filters(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect()
}

/// Timestamp in the form the events endpoint accepts. Rounded down, so the
/// second `since` falls in is replayed in full.
fn unix_seconds(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn operating_system(&self) -> Result<String, RuntimeError> {
        let info = self.docker.info().await?;
        Ok(info.operating_system.unwrap_or_default())
    }

    async fn list_labelled(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            filters: filters(&[("label", [label].as_slice())]),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        debug!("Listing for label {} returned {} containers", label, containers.len());
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse, RuntimeError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(Into::into)
    }

    fn events(&self, since: SystemTime) -> BoxStream<'_, Result<EventMessage, RuntimeError>> {
        let opts = EventsOptions::<String> {
            since: Some(unix_seconds(since)),
            filters: filters(&[
                ("type", ["container"].as_slice()),
                ("event", WATCHED_ACTIONS),
            ]),
            ..Default::default()
        };
        self.docker
            .events(Some(opts))
            .map(|msg| msg.map_err(RuntimeError::from))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unix_seconds() {
        let time = UNIX_EPOCH + Duration::from_millis(1_700_000_000_900);
        assert_eq!(unix_seconds(time), "1700000000");
        assert_eq!(unix_seconds(UNIX_EPOCH), "0");
    }
}
