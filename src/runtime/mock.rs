//! In-memory [`ContainerRuntime`] for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, EventMessage};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::json;

use super::ContainerRuntime;
use crate::error::RuntimeError;

#[derive(Default)]
pub struct MockRuntime {
    operating_system: String,
    containers: Mutex<HashMap<String, ContainerInspectResponse>>,
    /// One entry per `events()` call; once drained the stream stays open.
    event_batches: Mutex<VecDeque<Vec<Result<EventMessage, RuntimeError>>>>,
    /// Containers started after the last listing began and before the
    /// event stream is opened.
    started_later: Mutex<Vec<ContainerInspectResponse>>,
    failing_listings: Mutex<usize>,
    failing_inspections: Mutex<usize>,
    listings: Mutex<usize>,
    last_listing: Mutex<Option<SystemTime>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            operating_system: "Debian GNU/Linux 12 (bookworm)".to_string(),
            ..Default::default()
        }
    }

    pub fn with_operating_system(os: &str) -> Self {
        Self {
            operating_system: os.to_string(),
            ..Default::default()
        }
    }

    pub fn insert(&self, container: ContainerInspectResponse) {
        let id = container.id.clone().unwrap_or_default();
        self.containers.lock().unwrap().insert(id, container);
    }

    pub fn start_after_listing(&self, container: ContainerInspectResponse) {
        self.started_later.lock().unwrap().push(container);
    }

    pub fn remove(&self, id: &str) {
        self.containers.lock().unwrap().remove(id);
    }

    pub fn push_events(&self, events: Vec<Result<EventMessage, RuntimeError>>) {
        self.event_batches.lock().unwrap().push_back(events);
    }

    pub fn fail_next_listings(&self, count: usize) {
        *self.failing_listings.lock().unwrap() = count;
    }

    pub fn fail_next_inspections(&self, count: usize) {
        *self.failing_inspections.lock().unwrap() = count;
    }

    pub fn listings(&self) -> usize {
        *self.listings.lock().unwrap()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn operating_system(&self) -> Result<String, RuntimeError> {
        Ok(self.operating_system.clone())
    }

    async fn list_labelled(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        *self.listings.lock().unwrap() += 1;
        *self.last_listing.lock().unwrap() = Some(SystemTime::now());
        {
            let mut failing = self.failing_listings.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(daemon_error(503, "daemon restarting"));
            }
        }
        let containers = self.containers.lock().unwrap();
        let mut ids: Vec<String> = containers
            .values()
            .filter(|c| {
                c.config
                    .as_ref()
                    .and_then(|cfg| cfg.labels.as_ref())
                    .is_some_and(|labels| labels.contains_key(label))
            })
            .filter_map(|c| c.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse, RuntimeError> {
        {
            let mut failing = self.failing_inspections.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(daemon_error(503, "daemon restarting"));
            }
        }
        let containers = self.containers.lock().unwrap();
        containers
            .get(id)
            .or_else(|| {
                containers
                    .values()
                    .find(|c| c.name.as_deref().map(|n| n.trim_start_matches('/')) == Some(id))
            })
            .cloned()
            .ok_or_else(|| daemon_error(404, &format!("No such container: {}", id)))
    }

    fn events(&self, since: SystemTime) -> BoxStream<'_, Result<EventMessage, RuntimeError>> {
        // Their start events are only replayed when `since` reaches back to
        // the listing.
        let listed_at = *self.last_listing.lock().unwrap();
        let replay_window = listed_at.is_some_and(|at| since <= at);
        let mut replayed = Vec::new();
        for container in self.started_later.lock().unwrap().drain(..) {
            let id = container.id.clone().unwrap_or_default();
            self.insert(container);
            if replay_window {
                replayed.push(event("start", &id));
            }
        }

        let replayed = stream::iter(replayed);
        match self.event_batches.lock().unwrap().pop_front() {
            Some(batch) => replayed.chain(stream::iter(batch)).boxed(),
            None => replayed.chain(stream::pending()).boxed(),
        }
    }
}

/// Builds an inspect response the way the daemon serializes it.
pub fn container(
    id: &str,
    name: &str,
    labels: &[(&str, &str)],
    sandbox_key: &str,
    networks: &[(&str, &str)],
) -> ContainerInspectResponse {
    let labels: HashMap<&str, &str> = labels.iter().copied().collect();
    let networks: HashMap<&str, serde_json::Value> = networks
        .iter()
        .map(|(net, ip)| (*net, json!({ "IPAddress": ip })))
        .collect();
    serde_json::from_value(json!({
        "Id": id,
        "Name": format!("/{}", name),
        "Config": { "Labels": labels },
        "HostConfig": { "NetworkMode": "bridge" },
        "NetworkSettings": { "SandboxKey": sandbox_key, "Networks": networks },
    }))
    .unwrap()
}

pub fn event(action: &str, id: &str) -> Result<EventMessage, RuntimeError> {
    Ok(serde_json::from_value(json!({
        "Type": "container",
        "Action": action,
        "Actor": { "ID": id, "Attributes": {} },
    }))
    .unwrap())
}

pub fn daemon_error(status_code: u16, message: &str) -> RuntimeError {
    RuntimeError::Docker(bollard::errors::Error::DockerResponseServerError {
        status_code,
        message: message.to_string(),
    })
}
