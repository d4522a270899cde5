//! Route mutation inside foreign network namespaces.
//!
//! Each operation runs on a dedicated thread which joins the target
//! namespace with `setns(2)`, runs `ip route` there (children inherit the
//! thread's namespace) and switches back before the thread exits. The async
//! caller waits on a bounded deadline so a hung kernel call only affects the
//! container it was issued for.
//!
//! # Requirements
//!
//! - `CAP_SYS_ADMIN` and `CAP_NET_ADMIN`
//! - the Docker namespace files (`/var/run/docker/netns`) visible to the process
//! - `ip` from iproute2 available in PATH

use std::fs::File;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use log::{debug, error, info};
use nix::sched::{setns, CloneFlags};
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::error::NamespaceError;
use crate::types::{NamespaceHandle, RouteOp, RouteSpec};

/// Issues route mutations in container namespaces.
///
/// `Add` of a present route and `Delete` of an absent one both succeed, so
/// repeating an operation is harmless.
#[async_trait]
pub trait RouteExecutor: Send + Sync {
    async fn apply(
        &self,
        namespace: &NamespaceHandle,
        op: RouteOp,
        spec: &RouteSpec,
    ) -> Result<(), NamespaceError>;
}

pub struct NetnsExecutor {
    ip_command: String,
    timeout: Duration,
}

impl NetnsExecutor {
    pub fn new(ip_command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ip_command: ip_command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RouteExecutor for NetnsExecutor {
    async fn apply(
        &self,
        namespace: &NamespaceHandle,
        op: RouteOp,
        spec: &RouteSpec,
    ) -> Result<(), NamespaceError> {
        let path = namespace.path().to_path_buf();
        let ip = self.ip_command.clone();
        let spec = spec.clone();
        run_with_deadline(self.timeout, move || {
            let _guard = NamespaceGuard::enter(&path)?;
            match op {
                RouteOp::Add => add_route(&ip, &spec),
                RouteOp::Delete => delete_route(&ip, &spec),
            }
        })
        .await
    }
}

/// Run `f` on a fresh OS thread, giving up after `timeout`.
///
/// On expiry the thread is left behind; it only ever touches its own
/// namespace membership, so it cannot disturb other work.
async fn run_with_deadline<F>(timeout: Duration, f: F) -> Result<(), NamespaceError>
where
    F: FnOnce() -> Result<(), NamespaceError> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    thread::Builder::new()
        .name("netns-exec".into())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| NamespaceError::Thread(e.to_string()))?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(NamespaceError::Thread(
            "worker exited without reporting a result".to_string(),
        )),
        Err(_) => Err(NamespaceError::Timeout(timeout)),
    }
}

/// Membership of the current thread in a foreign network namespace.
/// Dropping it returns the thread to the namespace it came from.
struct NamespaceGuard {
    origin: File,
    target: PathBuf,
}

impl NamespaceGuard {
    fn enter(path: &Path) -> Result<Self, NamespaceError> {
        let target = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => NamespaceError::Gone {
                path: path.to_path_buf(),
            },
            _ => NamespaceError::Enter {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        let origin = File::open("/proc/thread-self/ns/net").map_err(NamespaceError::Origin)?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| NamespaceError::Enter {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        debug!("Entered network namespace {:?}", path);

        Ok(Self {
            origin,
            target: path.to_path_buf(),
        })
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.origin, CloneFlags::CLONE_NEWNET) {
            error!(
                "Failed to leave network namespace {:?}: {}",
                self.target, e
            );
        } else {
            debug!("Left network namespace {:?}", self.target);
        }
    }
}

/// One entry of `ip -j route show`.
#[derive(Debug, Deserialize)]
struct RouteEntry {
    dst: String,
    gateway: Option<String>,
}

impl RouteEntry {
    fn destination(&self) -> Option<IpNet> {
        self.dst
            .parse::<IpNet>()
            .ok()
            .or_else(|| self.dst.parse::<IpAddr>().ok().map(IpNet::from))
    }

    fn gateway(&self) -> Option<IpAddr> {
        self.gateway.as_deref().and_then(|g| g.parse().ok())
    }
}

/// Gateways of the routes currently installed for exactly `destination`.
fn parse_routes(output: &str, destination: &IpNet) -> Result<Vec<Option<IpAddr>>, serde_json::Error> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<RouteEntry> = serde_json::from_str(output)?;
    Ok(entries
        .iter()
        .filter(|e| e.destination().as_ref() == Some(destination))
        .map(RouteEntry::gateway)
        .collect())
}

fn is_missing_route(stderr: &str) -> bool {
    stderr.contains("No such process")
}

/// `ip` only lists routes of one address family at a time.
fn family_flag(destination: &IpNet) -> &'static str {
    match destination {
        IpNet::V4(_) => "-4",
        IpNet::V6(_) => "-6",
    }
}

fn show_args(destination: &IpNet) -> Vec<String> {
    [family_flag(destination), "-j", "route", "show", "exact"]
        .iter()
        .map(|a| a.to_string())
        .chain([destination.to_string()])
        .collect()
}

fn mutate_args(verb: &str, spec: &RouteSpec) -> Vec<String> {
    vec![
        family_flag(&spec.destination).to_string(),
        "route".to_string(),
        verb.to_string(),
        spec.destination.to_string(),
        "via".to_string(),
        spec.gateway.to_string(),
    ]
}

fn current_gateways(ip: &str, destination: &IpNet) -> Result<Vec<Option<IpAddr>>, NamespaceError> {
    let args = show_args(destination);
    let output = run_ip(ip, &args)?;
    parse_routes(&output, destination).map_err(|source| NamespaceError::Output {
        cmd: format!("{} {}", ip, args.join(" ")),
        source,
    })
}

fn add_route(ip: &str, spec: &RouteSpec) -> Result<(), NamespaceError> {
    let gateways = current_gateways(ip, &spec.destination)?;
    if gateways.contains(&Some(spec.gateway)) {
        info!("Route to {} already set", spec);
        return Ok(());
    }
    for existing in gateways.iter().flatten() {
        info!(
            "Replacing existing route to {} via {}",
            spec.destination, existing
        );
    }

    run_ip(ip, &mutate_args("replace", spec))?;
    Ok(())
}

fn delete_route(ip: &str, spec: &RouteSpec) -> Result<(), NamespaceError> {
    let gateways = current_gateways(ip, &spec.destination)?;
    if !gateways.contains(&Some(spec.gateway)) {
        debug!("Route to {} not present", spec);
        return Ok(());
    }

    match run_ip(ip, &mutate_args("del", spec)) {
        Err(NamespaceError::RouteFailed { stderr, .. }) if is_missing_route(&stderr) => Ok(()),
        other => other.map(|_| ()),
    }
}

/// Run an `ip` command, returning its stdout.
fn run_ip(ip: &str, args: &[String]) -> Result<String, NamespaceError> {
    let cmd_str = format!("{} {}", ip, args.join(" "));
    debug!("Running: {}", cmd_str);

    let output = Command::new(ip)
        .args(args)
        .output()
        .map_err(|e| NamespaceError::Command {
            cmd: cmd_str.clone(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(NamespaceError::RouteFailed {
            cmd: cmd_str,
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
