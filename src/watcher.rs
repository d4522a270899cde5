//! Container discovery: a baseline listing followed by the live event
//! stream, normalized into [`ContainerEvent`]s.
//!
//! The stream is resumed after every disconnect with a fresh listing. Each
//! subscription replays events from the moment its listing began, so nothing
//! started in between is lost and a container may be reported more than once. Containers that vanished while
//! disconnected are reported as removed by the resync.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use bollard::models::{EventMessage, EventMessageTypeEnum};
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::error::WatchError;
use crate::identity::display_name;
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerEvent, ContainerRecord, GatewayContext, NamespaceHandle, LABEL_NETWORKS};

/// What to do after handling one daemon event.
enum Flow {
    Continue,
    Stop,
}

pub struct ContainerWatcher<'a, R: ContainerRuntime> {
    runtime: &'a R,
    ctx: &'a GatewayContext,
    backoff_min: Duration,
    backoff_max: Duration,
    /// Containers reported to the consumer and not yet removed.
    known: HashSet<String>,
}

impl<'a, R: ContainerRuntime> ContainerWatcher<'a, R> {
    pub fn new(
        runtime: &'a R,
        ctx: &'a GatewayContext,
        backoff_min: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            runtime,
            ctx,
            backoff_min,
            backoff_max,
            known: HashSet::new(),
        }
    }

    /// Feed `tx` until the sidecar's own container is stopped or the
    /// consumer goes away. Daemon failures never end the watch.
    pub async fn run(mut self, tx: mpsc::Sender<ContainerEvent>) -> Result<(), WatchError> {
        let runtime = self.runtime;
        let mut backoff = self.backoff_min;

        info!("Starting processing");
        loop {
            let since = SystemTime::now();
            match self.resync(&tx).await {
                Ok(count) => {
                    info!("Listing found {} labelled containers", count);
                    backoff = self.backoff_min;
                }
                Err(WatchError::Runtime(e)) => {
                    error!("Failed to list containers: {}. Retrying in {:?}...", e, backoff);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_max);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut stream = runtime.events(since);
            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(event) => {
                        if let Flow::Stop = self.handle_event(event, &tx).await? {
                            info!("Stopping");
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break;
                    }
                }
            }

            warn!("Docker event stream ended. Resyncing in {:?}...", backoff);
            sleep(backoff).await;
            backoff = (backoff * 2).min(self.backoff_max);
        }
    }

    /// List labelled containers and report each one, then report known
    /// containers that are no longer listed as removed.
    async fn resync(&mut self, tx: &mpsc::Sender<ContainerEvent>) -> Result<usize, WatchError> {
        let ids = self.runtime.list_labelled(LABEL_NETWORKS).await?;

        let mut seen = HashSet::new();
        for id in ids {
            let Some(record) = self.record(&id).await else {
                continue;
            };
            let event = if self.known.contains(&record.id) {
                ContainerEvent::Updated(record)
            } else {
                ContainerEvent::Discovered(record)
            };
            seen.insert(event.container_id().to_string());
            send(tx, event).await?;
        }

        let vanished: Vec<String> = self.known.difference(&seen).cloned().collect();
        for id in vanished {
            debug!("Container {} disappeared while disconnected", id);
            send(tx, ContainerEvent::Removed { id }).await?;
        }

        let count = seen.len();
        self.known = seen;
        Ok(count)
    }

    async fn handle_event(
        &mut self,
        event: EventMessage,
        tx: &mpsc::Sender<ContainerEvent>,
    ) -> Result<Flow, WatchError> {
        if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
            return Ok(Flow::Continue);
        }
        let Some(id) = event.actor.and_then(|a| a.id).filter(|id| !id.is_empty()) else {
            return Ok(Flow::Continue);
        };
        let action = event.action.unwrap_or_default();
        debug!("Container event: {} for {}", action, id);

        match action.as_str() {
            "kill" | "die" if id == self.ctx.own_id => {
                info!("Own container received {}", action);
                return Ok(Flow::Stop);
            }
            "start" | "update" => {
                let Some(record) = self.record(&id).await else {
                    return Ok(Flow::Continue);
                };
                let event = if self.known.insert(record.id.clone()) {
                    ContainerEvent::Discovered(record)
                } else {
                    ContainerEvent::Updated(record)
                };
                send(tx, event).await?;
            }
            "die" | "destroy" => {
                if self.known.remove(&id) {
                    send(tx, ContainerEvent::Removed { id }).await?;
                }
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    /// Inspect a container and turn it into a record, if it can be routed.
    async fn record(&self, id: &str) -> Option<ContainerRecord> {
        let detail = match self.runtime.inspect(id).await {
            Ok(detail) => detail,
            Err(e) => {
                warn!("Failed to inspect container {}: {}", id, e);
                return None;
            }
        };
        let full_id = detail.id.clone().unwrap_or_else(|| id.to_string());
        let name = display_name(&detail);

        let networks_label = detail
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|l| l.get(LABEL_NETWORKS))
            .cloned();
        if networks_label.is_none() && !self.known.contains(&full_id) {
            return None;
        }

        let settings = detail.network_settings.as_ref();
        let sandbox_key = settings
            .and_then(|s| s.sandbox_key.clone())
            .unwrap_or_default();
        if sandbox_key.is_empty() {
            warn!(
                "Routing requested for {} but no network namespace. --network container:... is not supported",
                name
            );
            return None;
        }
        let attached = settings
            .and_then(|s| s.networks.as_ref())
            .is_some_and(|n| n.contains_key(&self.ctx.network));
        if !attached {
            warn!("Container {} is not attached to network {}", name, self.ctx.network);
            return None;
        }

        Some(ContainerRecord {
            id: full_id,
            name,
            namespace: NamespaceHandle::new(sandbox_key),
            networks_label,
        })
    }
}

async fn send(tx: &mpsc::Sender<ContainerEvent>, event: ContainerEvent) -> Result<(), WatchError> {
    tx.send(event).await.map_err(|_| WatchError::ConsumerClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{container, daemon_error, event, MockRuntime};

    const OWN: &str = "own";

    fn ctx() -> GatewayContext {
        GatewayContext {
            own_id: OWN.to_string(),
            network_owner_id: "wg".to_string(),
            network: "wg-net".to_string(),
            gateway: "192.168.67.129".parse().unwrap(),
        }
    }

    fn client(id: &str, name: &str, networks: &str) -> bollard::models::ContainerInspectResponse {
        container(
            id,
            name,
            &[(LABEL_NETWORKS, networks)],
            &format!("/var/run/docker/netns/{}", id),
            &[("wg-net", "192.168.67.10")],
        )
    }

    async fn collect(runtime: &MockRuntime) -> Vec<ContainerEvent> {
        let ctx = ctx();
        let (tx, mut rx) = mpsc::channel(64);
        let watcher = ContainerWatcher::new(
            runtime,
            &ctx,
            Duration::from_millis(1),
            Duration::from_millis(4),
        );
        tokio::time::timeout(Duration::from_secs(5), watcher.run(tx))
            .await
            .expect("watcher did not stop")
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn summary(events: &[ContainerEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                ContainerEvent::Discovered(r) => format!("discovered {}", r.id),
                ContainerEvent::Updated(r) => format!("updated {}", r.id),
                ContainerEvent::Removed { id } => format!("removed {}", id),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_baseline_then_stream() {
        let runtime = MockRuntime::new();
        runtime.insert(client("dovecot", "dovecot", "192.168.66.0/24"));
        runtime.insert(client("postfix", "postfix", "10.0.0.0/8"));
        runtime.insert(container("plain", "plain", &[], "/var/run/docker/netns/plain", &[("wg-net", "192.168.67.11")]));
        runtime.push_events(vec![
            event("start", "plain"),
            event("update", "dovecot"),
            event("die", "postfix"),
            event("die", "plain"),
            event("kill", OWN),
        ]);

        let events = collect(&runtime).await;
        assert_eq!(
            summary(&events),
            vec![
                "discovered dovecot",
                "discovered postfix",
                "updated dovecot",
                "removed postfix",
            ]
        );
        match &events[0] {
            ContainerEvent::Discovered(record) => {
                assert_eq!(record.name, "dovecot");
                assert_eq!(record.networks_label.as_deref(), Some("192.168.66.0/24"));
                assert_eq!(
                    record.namespace,
                    NamespaceHandle::new("/var/run/docker/netns/dovecot")
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_before_subscription_is_replayed() {
        let runtime = MockRuntime::new();
        runtime.insert(client("postfix", "postfix", "10.0.0.0/8"));
        runtime.start_after_listing(client("dovecot", "dovecot", "192.168.66.0/24"));
        runtime.push_events(vec![event("start", "postfix"), event("die", OWN)]);

        let events = collect(&runtime).await;
        assert_eq!(
            summary(&events),
            vec!["discovered postfix", "discovered dovecot", "updated postfix"]
        );
    }

    #[tokio::test]
    async fn test_skips_unroutable_containers() {
        let runtime = MockRuntime::new();
        runtime.insert(container("shared", "shared", &[(LABEL_NETWORKS, "10.0.0.0/8")], "", &[]));
        runtime.insert(container(
            "elsewhere",
            "elsewhere",
            &[(LABEL_NETWORKS, "10.0.0.0/8")],
            "/var/run/docker/netns/elsewhere",
            &[("bridge", "172.17.0.3")],
        ));
        runtime.push_events(vec![event("start", "ghost"), event("kill", OWN)]);

        assert!(collect(&runtime).await.is_empty());
    }

    #[tokio::test]
    async fn test_resync_after_disconnect() {
        let runtime = MockRuntime::new();
        runtime.insert(client("dovecot", "dovecot", "192.168.66.0/24"));
        runtime.insert(client("postfix", "postfix", "10.0.0.0/8"));
        runtime.push_events(vec![Err(daemon_error(500, "connection reset"))]);
        runtime.push_events(vec![event("kill", OWN)]);

        let ctx = ctx();
        let (tx, mut rx) = mpsc::channel(64);
        let watcher = ContainerWatcher::new(&runtime, &ctx, Duration::from_millis(1), Duration::from_millis(4));

        // postfix goes away while the stream is down
        let mut first = Vec::new();
        let run = watcher.run(tx);
        tokio::pin!(run);
        while first.len() < 2 {
            tokio::select! {
                Some(event) = rx.recv() => {
                    first.push(event);
                    if first.len() == 2 {
                        runtime.remove("postfix");
                    }
                }
                result = &mut run => panic!("watcher stopped early: {:?}", result),
            }
        }
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        while let Ok(event) = rx.try_recv() {
            rest.push(event);
        }
        assert_eq!(summary(&first), vec!["discovered dovecot", "discovered postfix"]);
        assert_eq!(summary(&rest), vec!["updated dovecot", "removed postfix"]);
        assert_eq!(runtime.listings(), 2);
    }

    #[tokio::test]
    async fn test_listing_failures_are_retried() {
        let runtime = MockRuntime::new();
        runtime.insert(client("dovecot", "dovecot", "192.168.66.0/24"));
        runtime.fail_next_listings(3);
        runtime.push_events(vec![event("kill", OWN)]);

        let events = collect(&runtime).await;
        assert_eq!(summary(&events), vec!["discovered dovecot"]);
        assert_eq!(runtime.listings(), 4);
    }

    #[tokio::test]
    async fn test_consumer_gone() {
        let runtime = MockRuntime::new();
        runtime.insert(client("dovecot", "dovecot", "192.168.66.0/24"));
        let ctx = ctx();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let watcher = ContainerWatcher::new(&runtime, &ctx, Duration::from_millis(1), Duration::from_millis(4));
        let err = watcher.run(tx).await.unwrap_err();
        assert!(matches!(err, WatchError::ConsumerClosed));
    }
}
