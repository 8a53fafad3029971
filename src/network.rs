//! Target specification parsing and local interface helpers.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use pnet::datalink::{self, NetworkInterface};
use pnet::ipnetwork::IpNetwork;

use crate::error::SetupError;

/// Addresses expanded from a full IPv6 CIDR would be astronomical;
/// cap expansion instead of rejecting the notation.
const MAX_V6_EXPANSION: usize = 1000;

const MAX_RANGE_SIZE: u32 = 10000;

/// Parse a comma-separated target spec: single IPs, hostnames,
/// CIDR blocks, and dashed IPv4 ranges.
pub fn parse_targets(target_spec: &str) -> Result<Vec<IpAddr>, SetupError> {
    let mut targets = Vec::new();

    for part in target_spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.contains('/') {
            targets.extend(parse_cidr(part)?);
        } else if part.contains('-') && !part.contains(':') {
            targets.extend(parse_ip_range(part)?);
        } else {
            targets.push(parse_single_target(part)?);
        }
    }

    targets.sort();
    targets.dedup();

    if targets.is_empty() {
        return Err(SetupError::NoTargets);
    }

    Ok(targets)
}

fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>, SetupError> {
    let network: IpNet = cidr
        .parse()
        .map_err(|_| SetupError::InvalidTarget(format!("invalid CIDR notation: {cidr}")))?;

    match network {
        IpNet::V4(net) => Ok(net.hosts().map(IpAddr::V4).collect()),
        IpNet::V6(net) => Ok(net
            .hosts()
            .take(MAX_V6_EXPANSION)
            .map(IpAddr::V6)
            .collect()),
    }
}

fn parse_ip_range(range: &str) -> Result<Vec<IpAddr>, SetupError> {
    let parts: Vec<&str> = range.split('-').collect();
    if parts.len() != 2 {
        return Err(SetupError::InvalidTarget(format!(
            "invalid IP range format: {range}"
        )));
    }

    let start_ip: IpAddr = parts[0]
        .trim()
        .parse()
        .map_err(|_| SetupError::InvalidTarget(format!("invalid start IP: {}", parts[0])))?;
    let end_ip: IpAddr = parts[1]
        .trim()
        .parse()
        .map_err(|_| SetupError::InvalidTarget(format!("invalid end IP: {}", parts[1])))?;

    match (start_ip, end_ip) {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            let start_u32 = u32::from(start);
            let end_u32 = u32::from(end);

            if start_u32 > end_u32 {
                return Err(SetupError::InvalidTarget(format!(
                    "start IP must not exceed end IP: {range}"
                )));
            }
            if end_u32 - start_u32 > MAX_RANGE_SIZE {
                return Err(SetupError::InvalidTarget(format!(
                    "IP range too large (max {MAX_RANGE_SIZE} addresses): {range}"
                )));
            }

            Ok((start_u32..=end_u32)
                .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
                .collect())
        }
        (IpAddr::V6(_), IpAddr::V6(_)) => Err(SetupError::InvalidTarget(
            "IPv6 ranges are not supported, use CIDR notation".to_string(),
        )),
        _ => Err(SetupError::InvalidTarget(
            "start and end IP must be the same version".to_string(),
        )),
    }
}

fn parse_single_target(target: &str) -> Result<IpAddr, SetupError> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }

    use std::net::ToSocketAddrs;
    format!("{target}:0")
        .to_socket_addrs()
        .map_err(|_| SetupError::InvalidTarget(format!("failed to resolve hostname: {target}")))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| SetupError::InvalidTarget(format!("no address found for: {target}")))
}

/// IP addresses assigned to this machine's non-loopback interfaces.
/// Link-local IPv6 addresses are excluded.
pub fn local_ip_addresses() -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    for iface in datalink::interfaces() {
        if iface.is_loopback() || !iface.is_up() {
            continue;
        }
        for net in &iface.ips {
            let ip = net.ip();
            match ip {
                IpAddr::V4(_) => addrs.push(ip),
                IpAddr::V6(v6) => {
                    if (v6.segments()[0] & 0xffc0) != 0xfe80 {
                        addrs.push(ip);
                    }
                }
            }
        }
    }
    addrs.sort();
    addrs.dedup();
    addrs
}

/// Find an up, non-loopback interface whose IPv4 subnet contains any target.
pub fn find_interface_for_targets(targets: &[Ipv4Addr]) -> Option<NetworkInterface> {
    for iface in datalink::interfaces() {
        if iface.is_loopback() || !iface.is_up() {
            continue;
        }
        for net in &iface.ips {
            if let IpNetwork::V4(network) = net {
                if targets.iter().any(|t| network.contains(*t)) {
                    return Some(iface);
                }
            }
        }
    }
    None
}

/// CIDR of the first non-loopback IPv4 interface, used as the default
/// discovery target when none is given.
pub fn default_network_cidr() -> Option<String> {
    for iface in datalink::interfaces() {
        if iface.is_loopback() || !iface.is_up() {
            continue;
        }
        for net in &iface.ips {
            if let IpNetwork::V4(v4) = net {
                let network = v4.network();
                return Some(format!("{}/{}", network, v4.prefix()));
            }
        }
    }
    None
}
