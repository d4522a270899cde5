//! Route reconciliation.
//!
//! [`ContainerRoutes`] holds the applied routes of one container and
//! converges them towards the routes its label asks for. [`Reconciler`]
//! consumes the watcher's events and runs one worker task per container, so
//! containers are handled in parallel while events for the same container
//! are applied strictly in order by a single writer.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::labels::parse_networks;
use crate::netns::RouteExecutor;
use crate::types::{ContainerEvent, ContainerRecord, GatewayContext, RouteOp, RouteSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    /// Seen, no reconciliation pass finished yet.
    Discovered,
    /// Applied routes match the label.
    RoutesApplied,
    /// Some mutation failed; retried on the next event for the container.
    Degraded,
}

/// Applied routing state of one container.
#[derive(Debug, Clone)]
pub struct ContainerRoutes {
    pub record: ContainerRecord,
    /// Routes believed installed in the container namespace.
    pub applied: Vec<RouteSpec>,
    pub state: ReconcileState,
}

impl ContainerRoutes {
    pub fn new(record: ContainerRecord) -> Self {
        Self {
            record,
            applied: Vec::new(),
            state: ReconcileState::Discovered,
        }
    }

    /// Routes the current label asks for, in label order.
    fn desired(&self, ctx: &GatewayContext) -> Vec<RouteSpec> {
        let parsed = parse_networks(self.record.networks_label.as_deref()).routable_via(ctx.gateway);
        for rejected in &parsed.rejected {
            warn!("Container {}: {}", self.record.name, rejected);
        }
        parsed
            .networks
            .into_iter()
            .map(|destination| RouteSpec {
                destination,
                gateway: ctx.gateway,
                container_id: self.record.id.clone(),
            })
            .collect()
    }

    /// One reconciliation pass against `record`.
    ///
    /// Removals run before additions. A failed addition stays out of
    /// `applied`; a failed removal stays in it so the next pass retries it.
    /// Routes applied in a namespace the container no longer uses are
    /// forgotten.
    pub async fn reconcile<E: RouteExecutor + ?Sized>(
        &mut self,
        ctx: &GatewayContext,
        executor: &E,
        record: ContainerRecord,
    ) -> ReconcileState {
        if record.namespace != self.record.namespace {
            info!(
                "Container {} moved to network namespace {}",
                record.name, record.namespace
            );
            self.applied.clear();
            self.state = ReconcileState::Discovered;
        }
        self.record = record;
        let desired = self.desired(ctx);

        let to_remove: Vec<RouteSpec> = self
            .applied
            .iter()
            .filter(|spec| !desired.contains(spec))
            .cloned()
            .collect();
        let to_add: Vec<RouteSpec> = desired
            .iter()
            .filter(|spec| !self.applied.contains(spec))
            .cloned()
            .collect();

        if to_remove.is_empty() && to_add.is_empty() {
            debug!("Routes of container {} are up to date", self.record.name);
            self.state = ReconcileState::RoutesApplied;
            return self.state;
        }

        info!("Setting routing for container {}", self.record.name);
        let mut failed = false;
        for spec in to_remove {
            if self.mutate(executor, RouteOp::Delete, &spec).await {
                self.applied.retain(|applied| applied != &spec);
            } else {
                failed = true;
            }
        }
        for spec in to_add {
            if self.mutate(executor, RouteOp::Add, &spec).await {
                self.applied.push(spec);
            } else {
                failed = true;
            }
        }

        self.state = if failed {
            ReconcileState::Degraded
        } else {
            ReconcileState::RoutesApplied
        };
        self.state
    }

    async fn mutate<E: RouteExecutor + ?Sized>(
        &self,
        executor: &E,
        op: RouteOp,
        spec: &RouteSpec,
    ) -> bool {
        match executor.apply(&self.record.namespace, op, spec).await {
            Ok(()) => {
                info!(
                    "Route {}: container={} cidr={} gateway={}",
                    op, self.record.name, spec.destination, spec.gateway
                );
                true
            }
            Err(e) if e.is_gone() => {
                warn!(
                    "Route {} skipped: container {} has exited ({})",
                    op, self.record.name, e
                );
                false
            }
            Err(e) => {
                warn!(
                    "Route {} failed: container={} cidr={} gateway={}: {}",
                    op, self.record.name, spec.destination, spec.gateway, e
                );
                false
            }
        }
    }
}

struct Worker {
    tx: mpsc::Sender<ContainerEvent>,
    handle: JoinHandle<Option<ContainerRoutes>>,
}

/// Dispatches container events to per-container workers.
pub struct Reconciler<E: RouteExecutor + 'static> {
    ctx: Arc<GatewayContext>,
    executor: Arc<E>,
    /// Capacity of each worker queue. A full queue holds up dispatch.
    queue_capacity: usize,
    workers: HashMap<String, Worker>,
    /// Workers told to stop but possibly still finishing a pass.
    retired: HashMap<String, JoinHandle<Option<ContainerRoutes>>>,
}

impl<E: RouteExecutor + 'static> Reconciler<E> {
    pub fn new(ctx: Arc<GatewayContext>, executor: Arc<E>, queue_capacity: usize) -> Self {
        Self {
            ctx,
            executor,
            queue_capacity: queue_capacity.max(1),
            workers: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    /// Consume events until the channel closes, then wait for every worker
    /// to finish. Returns the applied state of containers still tracked.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<ContainerEvent>,
    ) -> HashMap<String, ContainerRoutes> {
        while let Some(event) = rx.recv().await {
            self.dispatch(event).await;
        }
        info!(
            "Event stream closed, waiting for {} container workers",
            self.workers.len() + self.retired.len()
        );
        self.drain().await
    }

    async fn dispatch(&mut self, event: ContainerEvent) {
        self.retired.retain(|_, handle| !handle.is_finished());
        let id = event.container_id().to_string();

        if let ContainerEvent::Removed { .. } = event {
            match self.workers.remove(&id) {
                Some(worker) => {
                    let _ = worker.tx.send(event).await;
                    self.retired.insert(id, worker.handle);
                }
                None => debug!("Ignoring removal of untracked container {}", id),
            }
            return;
        }

        let worker = match self.workers.remove(&id) {
            Some(worker) => worker,
            None => self.spawn_worker(&id),
        };
        match worker.tx.send(event).await {
            Ok(()) => {
                self.workers.insert(id, worker);
            }
            Err(_) => error!("Worker for container {} is gone", id),
        }
    }

    fn spawn_worker(&mut self, id: &str) -> Worker {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let previous = self.retired.remove(id);
        let handle = tokio::spawn(container_worker(
            Arc::clone(&self.ctx),
            Arc::clone(&self.executor),
            rx,
            previous,
        ));
        Worker { tx, handle }
    }

    async fn drain(self) -> HashMap<String, ContainerRoutes> {
        for (id, handle) in self.retired {
            if let Err(e) = handle.await {
                error!("Worker for container {} failed: {}", id, e);
            }
        }

        let mut state = HashMap::new();
        for (id, worker) in self.workers {
            drop(worker.tx);
            match worker.handle.await {
                Ok(Some(routes)) => {
                    state.insert(id, routes);
                }
                Ok(None) => {}
                Err(e) => error!("Worker for container {} failed: {}", id, e),
            }
        }
        state
    }
}

/// Sole owner of one container's applied state for as long as it is tracked.
async fn container_worker<E: RouteExecutor + ?Sized>(
    ctx: Arc<GatewayContext>,
    executor: Arc<E>,
    mut rx: mpsc::Receiver<ContainerEvent>,
    previous: Option<JoinHandle<Option<ContainerRoutes>>>,
) -> Option<ContainerRoutes> {
    // A container id seen again must not overlap with its previous worker.
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let mut routes: Option<ContainerRoutes> = None;
    while let Some(event) = rx.recv().await {
        match event {
            ContainerEvent::Discovered(record) | ContainerEvent::Updated(record) => {
                let entry = routes.get_or_insert_with(|| ContainerRoutes::new(record.clone()));
                let state = entry.reconcile(&ctx, executor.as_ref(), record).await;
                debug!("Container {} is {:?}", entry.record.name, state);
            }
            ContainerEvent::Removed { id } => {
                match routes.take() {
                    Some(routes) => info!("Container {} exited", routes.record.name),
                    None => info!("Container {} exited", id),
                }
                return None;
            }
        }
    }
    routes
}
