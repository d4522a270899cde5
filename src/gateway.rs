//! Gateway resolution: the address of the network-owning container on the
//! shared network.

use std::net::IpAddr;

use log::info;

use crate::error::GatewayError;
use crate::identity::Identity;
use crate::runtime::ContainerRuntime;
use crate::types::{GatewayContext, DEFAULT_NETWORK, LABEL_NETWORK};

/// Pick the network to route through: explicit configuration first, then the
/// `wgroutemgr.network` label on the sidecar, then on the network owner.
pub fn network_name(configured: Option<&str>, identity: &Identity) -> String {
    configured
        .or_else(|| identity.own_labels.get(LABEL_NETWORK).map(String::as_str))
        .or_else(|| {
            identity
                .network_owner_labels
                .get(LABEL_NETWORK)
                .map(String::as_str)
        })
        .unwrap_or(DEFAULT_NETWORK)
        .to_string()
}

/// Resolve the gateway address of `network_owner_id` on `network`.
pub async fn resolve_gateway<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    network_owner_id: &str,
    network: &str,
) -> Result<IpAddr, GatewayError> {
    let detail = runtime.inspect(network_owner_id).await?;
    get_ip_for_network(&detail, network_owner_id, network)
}

/// Build the startup context, failing if no gateway can be determined.
pub async fn build_context<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    identity: &Identity,
    configured_network: Option<&str>,
) -> Result<GatewayContext, GatewayError> {
    let network = network_name(configured_network, identity);
    let gateway = resolve_gateway(runtime, &identity.network_owner_id, &network).await?;
    info!("Address of {} is {}", network, gateway);

    Ok(GatewayContext {
        own_id: identity.own_id.clone(),
        network_owner_id: identity.network_owner_id.clone(),
        network,
        gateway,
    })
}

fn get_ip_for_network(
    detail: &bollard::models::ContainerInspectResponse,
    container: &str,
    network: &str,
) -> Result<IpAddr, GatewayError> {
    let endpoint = detail
        .network_settings
        .as_ref()
        .and_then(|s| s.networks.as_ref())
        .and_then(|n| n.get(network))
        .ok_or_else(|| GatewayError::NotAttached {
            container: container.to_string(),
            network: network.to_string(),
        })?;

    let address = [&endpoint.ip_address, &endpoint.global_ipv6_address]
        .into_iter()
        .flatten()
        .find(|a| !a.is_empty())
        .ok_or_else(|| GatewayError::NoAddress {
            container: container.to_string(),
            network: network.to_string(),
        })?;

    address
        .parse()
        .map_err(|_| GatewayError::InvalidAddress {
            address: address.clone(),
            network: network.to_string(),
        })
}
