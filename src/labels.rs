//! Parsing of the `wgroutemgr.networks` label.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::LabelParseError;

/// Result of parsing one label value: the accepted networks in label order
/// (duplicates dropped) and one error per rejected token.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedNetworks {
    pub networks: Vec<IpNet>,
    pub rejected: Vec<LabelParseError>,
}

impl ParsedNetworks {
    /// Reject networks of the other address family than `gateway`, since no
    /// route to them can go via it.
    pub fn routable_via(mut self, gateway: IpAddr) -> Self {
        let (routable, foreign): (Vec<IpNet>, Vec<IpNet>) = self
            .networks
            .into_iter()
            .partition(|net| net.addr().is_ipv4() == gateway.is_ipv4());
        self.networks = routable;
        self.rejected.extend(foreign.into_iter().map(|net| LabelParseError {
            token: net.to_string(),
            reason: format!("address family differs from gateway {}", gateway),
        }));
        self
    }
}

/// Parse a comma-separated list of CIDRs.
///
/// A token with host bits set is rejected, a bare address is taken as a
/// host route. An absent or blank label yields no networks.
pub fn parse_networks(label: Option<&str>) -> ParsedNetworks {
    let mut parsed = ParsedNetworks::default();
    let Some(label) = label else {
        return parsed;
    };

    for token in label.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match parse_token(token) {
            Ok(net) => {
                if !parsed.networks.contains(&net) {
                    parsed.networks.push(net);
                }
            }
            Err(reason) => parsed.rejected.push(LabelParseError {
                token: token.to_string(),
                reason,
            }),
        }
    }
    parsed
}

fn parse_token(token: &str) -> Result<IpNet, String> {
    let net = if token.contains('/') {
        token.parse::<IpNet>().map_err(|e| e.to_string())?
    } else {
        let addr = token.parse::<IpAddr>().map_err(|e| e.to_string())?;
        IpNet::from(addr)
    };

    if net.trunc() != net {
        return Err(format!("host bits set, did you mean {}?", net.trunc()));
    }
    Ok(net)
}
