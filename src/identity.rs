//! Self-identification of the sidecar.
//!
//! Docker offers no documented way for a process to learn which container it
//! runs in, nor which container provides its network stack. The heuristics
//! below read `/proc/self/cgroup` (requires `--cgroupns host`) and
//! `/proc/self/mountinfo`, and are kept behind [`EnvironmentInspector`] so
//! that other strategies can replace them without touching reconciliation.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::models::ContainerInspectResponse;
use log::{debug, info};

use crate::error::IdentityError;
use crate::runtime::ContainerRuntime;

/// Who we are and whose network namespace we use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub own_id: String,
    pub own_name: String,
    pub own_labels: HashMap<String, String>,
    pub network_owner_id: String,
    pub network_owner_name: String,
    pub network_owner_labels: HashMap<String, String>,
}

#[async_trait]
pub trait EnvironmentInspector: Send + Sync {
    async fn resolve_self(&self) -> Result<Identity, IdentityError>;
}

/// Inspector for Docker on Linux, reading a `/proc` tree.
pub struct ProcInspector<'a, R: ContainerRuntime> {
    runtime: &'a R,
    proc_root: PathBuf,
}

impl<'a, R: ContainerRuntime> ProcInspector<'a, R> {
    pub fn new(runtime: &'a R, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            proc_root: proc_root.into(),
        }
    }

    /// Refuse hosts where the route manager cannot work.
    async fn check_env(&self) -> Result<(), IdentityError> {
        if std::env::consts::OS != "linux" {
            return Err(IdentityError::Unsupported(format!(
                "Linux is required, running on {}",
                std::env::consts::OS
            )));
        }

        let host = self.runtime.operating_system().await?;
        if host.contains("Docker Desktop") {
            return Err(IdentityError::Unsupported(format!(
                "{} does not support bind propagation",
                host
            )));
        }
        Ok(())
    }

    fn read(&self, name: &str) -> Result<(PathBuf, String), IdentityError> {
        let path = self.proc_root.join("self").join(name);
        let content = fs::read_to_string(&path).map_err(|source| IdentityError::Read {
            path: path.clone(),
            source,
        })?;
        Ok((path, content))
    }

    async fn inspect(&self, reference: &str) -> Result<ContainerInspectResponse, IdentityError> {
        self.runtime.inspect(reference).await.map_err(|e| {
            if e.is_not_found() {
                debug!("Inspecting {} failed: {}", reference, e);
                IdentityError::NoMatch {
                    what: format!("container reference {}", reference),
                }
            } else {
                IdentityError::Runtime(e)
            }
        })
    }

    /// Find the container providing our network stack, given our own.
    async fn network_owner(
        &self,
        own: &ContainerInspectResponse,
    ) -> Result<ContainerInspectResponse, IdentityError> {
        let mode = own
            .host_config
            .as_ref()
            .and_then(|h| h.network_mode.as_deref())
            .unwrap_or_default();
        if let Some(reference) = mode.strip_prefix("container:") {
            debug!("Network namespace shared with container {}", reference);
            return self.inspect(reference).await;
        }

        if has_attachments(own) {
            return Ok(own.clone());
        }

        let (path, mountinfo) = self.read("mountinfo")?;
        let candidates = mountinfo_container_ids(&mountinfo);
        let id = single(candidates, || format!("network container in {}", path.display()))?;
        self.inspect(&id).await
    }
}

#[async_trait]
impl<R: ContainerRuntime> EnvironmentInspector for ProcInspector<'_, R> {
    async fn resolve_self(&self) -> Result<Identity, IdentityError> {
        self.check_env().await?;

        let (path, cgroup) = self.read("cgroup")?;
        let candidates = cgroup_container_ids(&cgroup);
        if candidates.is_empty() {
            return Err(IdentityError::NotInContainer { path });
        }
        let own_id = single(candidates, || format!("own container id in {}", path.display()))?;
        let own = self.inspect(&own_id).await?;
        let owner = self.network_owner(&own).await?;

        let identity = Identity {
            own_id: own.id.clone().unwrap_or(own_id),
            own_name: display_name(&own),
            own_labels: labels(&own),
            network_owner_id: owner.id.clone().unwrap_or_default(),
            network_owner_name: display_name(&owner),
            network_owner_labels: labels(&owner),
        };
        if identity.network_owner_id.is_empty() {
            return Err(IdentityError::NoMatch {
                what: "network container".to_string(),
            });
        }

        info!(
            "Own container name {}, using network of {}",
            identity.own_name, identity.network_owner_name
        );
        Ok(identity)
    }
}

fn single(
    candidates: BTreeSet<String>,
    what: impl FnOnce() -> String,
) -> Result<String, IdentityError> {
    let mut iter = candidates.into_iter();
    match (iter.next(), iter.next()) {
        (Some(id), None) => Ok(id),
        (None, _) => Err(IdentityError::NoMatch { what: what() }),
        (Some(first), Some(second)) => {
            let mut all = vec![first, second];
            all.extend(iter);
            Err(IdentityError::Ambiguous {
                what: what(),
                candidates: all,
            })
        }
    }
}

fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Container ids found in a `/proc/<pid>/cgroup` file.
///
/// Understands the systemd driver (`0::/system.slice/docker-<id>.scope`) and
/// the cgroupfs driver (`12:memory:/docker/<id>`).
pub fn cgroup_container_ids(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .filter_map(|path| {
            let last = path.trim().rsplit('/').next()?;
            let id = match last.strip_prefix("docker-") {
                Some(rest) => rest.strip_suffix(".scope")?,
                None if path.contains("/docker/") => last,
                None => return None,
            };
            is_container_id(id).then(|| id.to_string())
        })
        .collect()
}

/// Container ids whose `/var/lib/docker/containers/<id>/` files (hosts,
/// hostname, resolv.conf) are mounted into this process.
pub fn mountinfo_container_ids(content: &str) -> BTreeSet<String> {
    const MARKER: &str = "/docker/containers/";
    content
        .lines()
        .filter_map(|line| {
            let start = line.find(MARKER)? + MARKER.len();
            let id = line[start..].split('/').next()?;
            is_container_id(id).then(|| id.to_string())
        })
        .collect()
}

fn has_attachments(container: &ContainerInspectResponse) -> bool {
    container
        .network_settings
        .as_ref()
        .and_then(|s| s.networks.as_ref())
        .is_some_and(|n| !n.is_empty())
}

pub fn display_name(container: &ContainerInspectResponse) -> String {
    container
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .or_else(|| container.id.clone())
        .unwrap_or_default()
}

pub fn labels(container: &ContainerInspectResponse) -> HashMap<String, String> {
    container
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default()
}
