//! Probe drivers, one per discovery method.
//!
//! Drivers never fail the session. Every outcome, including permission
//! problems, is reported as a `DiscoveryEvent` through the shared sink.

pub mod arp;
pub mod arp_cache;
pub mod icmp;
pub mod llmnr;
pub mod mdns;
pub mod ssdp;
pub mod tcp;
pub mod udp;
pub mod wsd;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use pnet::datalink;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::transport::{self, TransportChannelType, TransportProtocol};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::CancelState;
use crate::types::{DiscoveryEvent, DiscoveryMethod};

/// Per-session probe settings.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Timeout per host
    pub timeout: Duration,
    /// Whole-run deadline; probes not yet dispatched when it passes are
    /// skipped, in-flight ones get a short flush window
    pub run_deadline: Duration,
    /// Maximum concurrent probes per driver
    pub concurrency: usize,
    /// Ports for TCP connect and SYN probing; defaults apply when empty
    pub tcp_ports: Vec<u16>,
    /// mDNS service types to browse; defaults apply when empty
    pub mdns_service_types: Vec<String>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            run_deadline: Duration::from_secs(30),
            concurrency: 100,
            tcp_ports: Vec::new(),
            mdns_service_types: Vec::new(),
        }
    }
}

/// Bounded event channel handle shared by all drivers in a session.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<DiscoveryEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<DiscoveryEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event. A closed receiver means the session owner has
    /// gone away, which is indistinguishable from cancellation here.
    pub async fn emit(&self, event: DiscoveryEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("event receiver dropped, discarding event");
        }
    }
}

/// A single discovery technique.
#[async_trait]
pub trait ProbeDriver: Send + Sync {
    fn method(&self) -> DiscoveryMethod;

    /// Whether this driver needs raw sockets or other elevated access.
    fn requires_privileges(&self) -> bool {
        false
    }

    /// Probe `targets`, emitting one event per responsive host. Must
    /// return promptly once `cancel` trips; partially emitted results
    /// stand.
    async fn probe(
        &self,
        targets: &[IpAddr],
        options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    );
}

/// Construct the driver for a method. `Local` has no driver; the
/// orchestrator synthesizes its events directly.
pub fn driver_for(method: DiscoveryMethod) -> Option<Box<dyn ProbeDriver>> {
    match method {
        DiscoveryMethod::IcmpPing => Some(Box::new(icmp::IcmpPingDriver::v4())),
        DiscoveryMethod::Icmpv6Ping => Some(Box::new(icmp::IcmpPingDriver::v6())),
        DiscoveryMethod::ArpScan => Some(Box::new(arp::ArpScanDriver)),
        DiscoveryMethod::ArpCache => Some(Box::new(arp_cache::ArpCacheDriver)),
        DiscoveryMethod::TcpConnect => Some(Box::new(tcp::TcpConnectDriver)),
        DiscoveryMethod::TcpSyn => Some(Box::new(tcp::TcpSynDriver)),
        DiscoveryMethod::Mdns => Some(Box::new(mdns::MdnsDriver)),
        DiscoveryMethod::Ssdp => Some(Box::new(ssdp::SsdpDriver)),
        DiscoveryMethod::WsDiscovery => Some(Box::new(wsd::WsDiscoveryDriver)),
        DiscoveryMethod::UdpProbe => Some(Box::new(udp::UdpProbeDriver)),
        DiscoveryMethod::Llmnr => Some(Box::new(llmnr::LlmnrDriver)),
        DiscoveryMethod::Local => None,
    }
}

/// True when the process runs as root and can skip the probing check.
#[cfg(unix)]
fn is_root() -> bool {
    // Safety: geteuid has no failure mode and touches no memory.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Check whether the current process can use a discovery method.
///
/// Async because `surge_ping::Client::new` needs a tokio runtime.
pub async fn check_privileges(method: DiscoveryMethod) -> bool {
    match method {
        DiscoveryMethod::IcmpPing => {
            is_root() || surge_ping::Client::new(&surge_ping::Config::default()).is_ok()
        }
        DiscoveryMethod::Icmpv6Ping => {
            is_root()
                || surge_ping::Client::new(
                    &surge_ping::Config::builder().kind(surge_ping::ICMP::V6).build(),
                )
                .is_ok()
        }
        DiscoveryMethod::ArpScan => {
            is_root()
                || datalink::interfaces().iter().any(|iface| {
                    !iface.is_loopback()
                        && iface.is_up()
                        && datalink::channel(iface, Default::default()).is_ok()
                })
        }
        DiscoveryMethod::TcpSyn => {
            if is_root() {
                return true;
            }
            let protocol =
                TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Tcp));
            transport::transport_channel(4096, protocol).is_ok()
        }
        _ => true,
    }
}

/// All discovery methods with their current availability.
pub async fn available_methods() -> Vec<(DiscoveryMethod, bool)> {
    let mut methods = vec![
        (DiscoveryMethod::TcpConnect, true),
        (
            DiscoveryMethod::IcmpPing,
            check_privileges(DiscoveryMethod::IcmpPing).await,
        ),
        (
            DiscoveryMethod::ArpScan,
            check_privileges(DiscoveryMethod::ArpScan).await,
        ),
        (
            DiscoveryMethod::TcpSyn,
            check_privileges(DiscoveryMethod::TcpSyn).await,
        ),
        (
            DiscoveryMethod::Icmpv6Ping,
            check_privileges(DiscoveryMethod::Icmpv6Ping).await,
        ),
    ];
    methods.extend([
        (DiscoveryMethod::Mdns, true),
        (DiscoveryMethod::Ssdp, true),
        (DiscoveryMethod::UdpProbe, true),
        (DiscoveryMethod::Llmnr, true),
        (DiscoveryMethod::WsDiscovery, true),
        (DiscoveryMethod::ArpCache, true),
    ]);
    methods
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_method_except_local_has_a_driver() {
        let methods = [
            DiscoveryMethod::IcmpPing,
            DiscoveryMethod::Icmpv6Ping,
            DiscoveryMethod::ArpScan,
            DiscoveryMethod::ArpCache,
            DiscoveryMethod::TcpConnect,
            DiscoveryMethod::TcpSyn,
            DiscoveryMethod::Mdns,
            DiscoveryMethod::Ssdp,
            DiscoveryMethod::WsDiscovery,
            DiscoveryMethod::UdpProbe,
            DiscoveryMethod::Llmnr,
        ];
        for method in methods {
            let driver = driver_for(method).expect("missing driver");
            assert_eq!(driver.method(), method);
        }
        assert!(driver_for(DiscoveryMethod::Local).is_none());
    }

    #[tokio::test]
    async fn test_unprivileged_methods_always_available() {
        let methods = available_methods().await;
        for (method, available) in methods {
            match method {
                DiscoveryMethod::TcpConnect
                | DiscoveryMethod::Mdns
                | DiscoveryMethod::Ssdp
                | DiscoveryMethod::UdpProbe
                | DiscoveryMethod::Llmnr
                | DiscoveryMethod::WsDiscovery
                | DiscoveryMethod::ArpCache => assert!(available, "{method} should be available"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_icmpv6_availability_reflects_privilege_check() {
        let methods = available_methods().await;
        let (_, listed) = methods
            .iter()
            .find(|(m, _)| *m == DiscoveryMethod::Icmpv6Ping)
            .expect("icmpv6_ping missing from method list");
        assert_eq!(
            *listed,
            check_privileges(DiscoveryMethod::Icmpv6Ping).await,
            "icmpv6_ping availability must come from the raw-socket check"
        );
    }
}
