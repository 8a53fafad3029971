//! mDNS/Bonjour service discovery via mdns-sd.
//!
//! Multicast-driven: targets are used only to filter responders. Each
//! resolved service yields one event per advertised address, carrying
//! the hostname and service details.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tracing::{debug, warn};

use super::{EventSink, ProbeDriver, ProbeOptions};
use crate::cancel::CancelState;
use crate::error::ProbeError;
use crate::types::{DiscoveryEvent, DiscoveryMethod, HostnameSource, MdnsServiceInfo};

/// Service resolution needs several seconds regardless of the session
/// timeout.
const MDNS_MIN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Service types browsed by default, covering web, file sharing,
/// printing, media, smart home, and NAS devices.
pub const DEFAULT_MDNS_SERVICE_TYPES: &[&str] = &[
    "_http._tcp",
    "_https._tcp",
    "_ssh._tcp",
    "_sftp-ssh._tcp",
    "_rfb._tcp",
    "_smb._tcp",
    "_afpovertcp._tcp",
    "_ftp._tcp",
    "_nfs._tcp",
    "_webdav._tcp",
    "_ipp._tcp",
    "_ipps._tcp",
    "_printer._tcp",
    "_pdl-datastream._tcp",
    "_scanner._tcp",
    "_airplay._tcp",
    "_raop._tcp",
    "_daap._tcp",
    "_googlecast._tcp",
    "_spotify-connect._tcp",
    "_hap._tcp",
    "_homekit._tcp",
    "_hue._tcp",
    "_device-info._tcp",
    "_companion-link._tcp",
    "_sleep-proxy._udp",
    "_adisk._tcp",
    "_workstation._tcp",
    "_presence._tcp",
    "_postgresql._tcp",
    "_mysql._tcp",
    "_nas._tcp",
    "_iscsi._tcp",
];

pub struct MdnsDriver;

#[async_trait]
impl ProbeDriver for MdnsDriver {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Mdns
    }

    async fn probe(
        &self,
        targets: &[IpAddr],
        options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    ) {
        let started = Instant::now();

        let daemon = match ServiceDaemon::new() {
            Ok(d) => d,
            Err(e) => {
                let fallback = targets
                    .first()
                    .copied()
                    .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
                sink.emit(DiscoveryEvent::failure(
                    DiscoveryMethod::Mdns,
                    fallback,
                    ProbeError::NetworkUnreachable(format!("cannot start mDNS daemon: {e}")),
                    started,
                ))
                .await;
                return;
            }
        };

        let service_types: Vec<String> = if options.mdns_service_types.is_empty() {
            DEFAULT_MDNS_SERVICE_TYPES
                .iter()
                .map(|s| (*s).to_string())
                .collect()
        } else {
            options.mdns_service_types.clone()
        };

        let mut receivers = Vec::new();
        for service_type in &service_types {
            let full_type = if service_type.ends_with(".local.") {
                service_type.clone()
            } else if service_type.ends_with(".local") {
                format!("{service_type}.")
            } else {
                format!("{service_type}.local.")
            };
            match daemon.browse(&full_type) {
                Ok(receiver) => receivers.push((full_type, receiver)),
                Err(e) => warn!("failed to browse {full_type}: {e}"),
            }
        }

        let browse_timeout = options.timeout.max(MDNS_MIN_TIMEOUT);
        let deadline = Instant::now() + browse_timeout;
        // (ip, fullname) pairs already emitted, to keep events idempotent
        let mut seen: std::collections::HashSet<(IpAddr, String)> = std::collections::HashSet::new();

        while Instant::now() < deadline && !cancel.is_cancelled() {
            for (service_type, receiver) in &receivers {
                let Ok(event) = receiver.recv_timeout(Duration::from_millis(50)) else {
                    continue;
                };
                let ServiceEvent::ServiceResolved(info) = event else {
                    continue;
                };

                let hostname = info.get_hostname().trim_end_matches('.').to_string();
                let service = MdnsServiceInfo {
                    instance_name: info
                        .get_fullname()
                        .strip_suffix(service_type.as_str())
                        .unwrap_or(info.get_fullname())
                        .trim_end_matches('.')
                        .to_string(),
                    service_type: service_type.trim_end_matches('.').to_string(),
                    port: info.get_port(),
                    properties: info
                        .get_properties()
                        .iter()
                        .map(|p| (p.key().to_string(), p.val_str().to_string()))
                        .collect(),
                };

                for addr in info.get_addresses() {
                    let ip: IpAddr = *addr;
                    if ip.is_loopback() {
                        continue;
                    }
                    if !targets.is_empty() && !targets.contains(&ip) {
                        continue;
                    }
                    if !seen.insert((ip, info.get_fullname().to_string())) {
                        continue;
                    }

                    let mut discovery =
                        DiscoveryEvent::alive(DiscoveryMethod::Mdns, ip, started);
                    if !hostname.is_empty() {
                        discovery.hostname = Some(hostname.clone());
                        discovery.hostname_source = Some(HostnameSource::Mdns);
                    }
                    discovery.mdns_service = Some(service.clone());
                    sink.emit(discovery).await;
                }
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(daemon);
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "mdns browse done"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_service_types_cover_device_classes() {
        for service in ["_ipp._tcp", "_googlecast._tcp", "_hap._tcp", "_nas._tcp"] {
            assert!(DEFAULT_MDNS_SERVICE_TYPES.contains(&service));
        }
    }

    #[test]
    fn test_method() {
        assert_eq!(MdnsDriver.method(), DiscoveryMethod::Mdns);
        assert!(!MdnsDriver.requires_privileges());
    }
}
