//! ARP request sweep over a raw datalink channel.
//!
//! Local network only. Replies carry the responder's MAC, which is the
//! strongest host identity the engine can observe.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pnet::datalink::{self, Channel as PnetChannel, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use tracing::{debug, warn};

use super::{EventSink, ProbeDriver, ProbeOptions};
use crate::cancel::CancelState;
use crate::error::ProbeError;
use crate::network::find_interface_for_targets;
use crate::oui;
use crate::types::{DiscoveryEvent, DiscoveryMethod};

const ARP_RETRY_COUNT: u32 = 3;
const ARP_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct ArpScanDriver;

#[async_trait]
impl ProbeDriver for ArpScanDriver {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::ArpScan
    }

    fn requires_privileges(&self) -> bool {
        true
    }

    async fn probe(
        &self,
        targets: &[IpAddr],
        options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    ) {
        let started = Instant::now();

        // ARP is IPv4-only and limited to the local segment.
        let ipv4_targets: Vec<Ipv4Addr> = targets
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        if ipv4_targets.is_empty() {
            return;
        }

        let Some(interface) = find_interface_for_targets(&ipv4_targets) else {
            sink.emit(DiscoveryEvent::failure(
                DiscoveryMethod::ArpScan,
                IpAddr::V4(ipv4_targets[0]),
                ProbeError::NetworkUnreachable(
                    "no interface covers the target subnet".to_string(),
                ),
                started,
            ))
            .await;
            return;
        };

        // The datalink channel is synchronous; run the sweep off the runtime.
        let timeout = options.timeout;
        let cancelled_before = cancel.is_cancelled();
        let scan_targets = ipv4_targets.clone();
        let result = tokio::task::spawn_blocking(move || {
            if cancelled_before {
                return Ok(HashMap::new());
            }
            arp_sweep_blocking(&interface, &scan_targets, timeout)
        })
        .await;

        match result {
            Ok(Ok(discovered)) => {
                for (ip, mac_bytes) in discovered {
                    let mac = oui::format_mac(&mac_bytes);
                    let mut event =
                        DiscoveryEvent::alive(DiscoveryMethod::ArpScan, IpAddr::V4(ip), started);
                    event.mac = Some(mac);
                    sink.emit(event).await;
                }
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "arp sweep done"
                );
            }
            Ok(Err(error)) => {
                sink.emit(DiscoveryEvent::failure(
                    DiscoveryMethod::ArpScan,
                    IpAddr::V4(ipv4_targets[0]),
                    error,
                    started,
                ))
                .await;
            }
            Err(e) => warn!("arp sweep task failed: {e}"),
        }
    }
}

/// Send ARP requests with retries and collect replies until the timeout.
/// Returns responder IP to MAC bytes.
fn arp_sweep_blocking(
    interface: &NetworkInterface,
    targets: &[Ipv4Addr],
    timeout: Duration,
) -> Result<HashMap<Ipv4Addr, [u8; 6]>, ProbeError> {
    let source_mac = interface.mac.ok_or_else(|| {
        ProbeError::NetworkUnreachable(format!("interface {} has no MAC", interface.name))
    })?;
    let source_ip = interface
        .ips
        .iter()
        .find_map(|net| match net.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            ProbeError::NetworkUnreachable(format!(
                "interface {} has no IPv4 address",
                interface.name
            ))
        })?;

    let (mut tx, mut rx) = match datalink::channel(interface, Default::default()) {
        Ok(PnetChannel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => {
            return Err(ProbeError::NetworkUnreachable(
                "unsupported datalink channel type".to_string(),
            ))
        }
        Err(e) => {
            return Err(ProbeError::PermissionDenied(format!(
                "cannot open datalink channel on {}: {e}",
                interface.name
            )))
        }
    };

    let target_set: HashSet<Ipv4Addr> = targets.iter().copied().collect();
    let mut discovered: HashMap<Ipv4Addr, [u8; 6]> = HashMap::new();
    let round_timeout = timeout / ARP_RETRY_COUNT;

    for retry in 0..ARP_RETRY_COUNT {
        let pending: Vec<Ipv4Addr> = targets
            .iter()
            .copied()
            .filter(|ip| !discovered.contains_key(ip))
            .collect();
        if pending.is_empty() {
            break;
        }
        if retry > 0 {
            std::thread::sleep(ARP_RETRY_DELAY);
        }

        for target in &pending {
            send_arp_request(&mut tx, source_mac, source_ip, *target);
        }

        let round_start = Instant::now();
        while round_start.elapsed() < round_timeout {
            match rx.next() {
                Ok(packet) => {
                    let Some(ethernet) = EthernetPacket::new(packet) else {
                        continue;
                    };
                    if ethernet.get_ethertype() != EtherTypes::Arp {
                        continue;
                    }
                    let Some(arp) = ArpPacket::new(ethernet.payload()) else {
                        continue;
                    };
                    if arp.get_operation() != ArpOperations::Reply {
                        continue;
                    }
                    let sender_ip = arp.get_sender_proto_addr();
                    if target_set.contains(&sender_ip) && !discovered.contains_key(&sender_ip) {
                        let mac = arp.get_sender_hw_addr();
                        discovered
                            .insert(sender_ip, [mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]);
                    }
                }
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }

            if discovered.len() == targets.len() {
                return Ok(discovered);
            }
        }
    }

    Ok(discovered)
}

fn send_arp_request(
    tx: &mut Box<dyn datalink::DataLinkSender>,
    source_mac: MacAddr,
    source_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) {
    let mut ethernet_buffer = [0u8; 42];
    let Some(mut ethernet_packet) = MutableEthernetPacket::new(&mut ethernet_buffer) else {
        return;
    };
    ethernet_packet.set_destination(MacAddr::broadcast());
    ethernet_packet.set_source(source_mac);
    ethernet_packet.set_ethertype(EtherTypes::Arp);

    let mut arp_buffer = [0u8; 28];
    let Some(mut arp_packet) = MutableArpPacket::new(&mut arp_buffer) else {
        return;
    };
    arp_packet.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp_packet.set_protocol_type(EtherTypes::Ipv4);
    arp_packet.set_hw_addr_len(6);
    arp_packet.set_proto_addr_len(4);
    arp_packet.set_operation(ArpOperations::Request);
    arp_packet.set_sender_hw_addr(source_mac);
    arp_packet.set_sender_proto_addr(source_ip);
    arp_packet.set_target_hw_addr(MacAddr::zero());
    arp_packet.set_target_proto_addr(target_ip);

    ethernet_packet.set_payload(arp_packet.packet());
    tx.send_to(ethernet_packet.packet(), None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_requires_privileges() {
        assert!(ArpScanDriver.requires_privileges());
        assert_eq!(ArpScanDriver.method(), DiscoveryMethod::ArpScan);
    }

    #[tokio::test]
    async fn test_ipv6_only_targets_emit_nothing() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let sink = EventSink::new(tx);
        let cancel = CancelState::new();
        ArpScanDriver
            .probe(
                &[IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)],
                &ProbeOptions::default(),
                &sink,
                &cancel,
            )
            .await;
        drop(sink);
        assert!(rx.recv().await.is_none());
    }
}
