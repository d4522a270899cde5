//! Data structures used throughout the route manager.
//!
//! [`GatewayContext`] is built once at startup and shared read-only.
//! [`ContainerEvent`] is what the watcher hands to the reconciler, and
//! [`RouteSpec`] is the unit of desired and applied routing state.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;

/// Label on the sidecar (or the network-owning container) naming the network
/// whose address is the gateway.
pub const LABEL_NETWORK: &str = "wgroutemgr.network";

/// Label on client containers listing the CIDRs to route via the gateway.
pub const LABEL_NETWORKS: &str = "wgroutemgr.networks";

/// Network used when neither configuration nor labels name one.
pub const DEFAULT_NETWORK: &str = "wg-net";

/// Immutable routing context resolved at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayContext {
    /// Id of the container this process runs in.
    pub own_id: String,
    /// Id of the container holding the attachment to `network`.
    pub network_owner_id: String,
    /// Name of the shared network.
    pub network: String,
    /// Address of the network owner on `network`; next hop of every route.
    pub gateway: IpAddr,
}

/// Opaque reference to a container network namespace (the Docker sandbox
/// key, e.g. `/var/run/docker/netns/0c4a1e6f9a8b`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceHandle(PathBuf);

impl NamespaceHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for NamespaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// What the watcher knows about a tracked client container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    /// Display name without the leading `/`.
    pub name: String,
    pub namespace: NamespaceHandle,
    /// Raw `wgroutemgr.networks` value; `None` when the label is absent.
    pub networks_label: Option<String>,
}

/// Normalized container lifecycle event.
///
/// Delivery is at-least-once, so consumers must tolerate repeated
/// `Discovered`/`Updated` events carrying the same state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// First sighting of a container, from a listing or a start event.
    Discovered(ContainerRecord),
    /// A container already seen reported a change.
    Updated(ContainerRecord),
    /// The container stopped or disappeared from a listing.
    Removed { id: String },
}

impl ContainerEvent {
    pub fn container_id(&self) -> &str {
        match self {
            ContainerEvent::Discovered(record) | ContainerEvent::Updated(record) => &record.id,
            ContainerEvent::Removed { id } => id,
        }
    }
}

/// A route to install via the gateway inside one container's namespace.
///
/// Equality and hashing only look at the destination and the owning
/// container; the gateway is the same for every spec of a process.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub destination: IpNet,
    pub gateway: IpAddr,
    pub container_id: String,
}

impl PartialEq for RouteSpec {
    fn eq(&self, other: &Self) -> bool {
        self.destination == other.destination && self.container_id == other.container_id
    }
}

impl Eq for RouteSpec {}

impl Hash for RouteSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.destination.hash(state);
        self.container_id.hash(state);
    }
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.destination, self.gateway)
    }
}

/// Kernel route mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Delete,
}

impl fmt::Display for RouteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteOp::Add => f.write_str("add"),
            RouteOp::Delete => f.write_str("delete"),
        }
    }
}
