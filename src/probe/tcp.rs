//! TCP-based liveness probing: full connects and half-open SYN sweeps.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::{MutableTcpPacket, TcpFlags, TcpPacket};
use pnet::packet::Packet;
use pnet::transport::{self, tcp_packet_iter, TransportChannelType, TransportProtocol,
    TransportSender};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

use super::{EventSink, ProbeDriver, ProbeOptions};
use crate::cancel::CancelState;
use crate::error::ProbeError;
use crate::types::{DiscoveryEvent, DiscoveryMethod};

/// Ports that commonly answer on home and office devices, including
/// printers (515, 631, 9100), cameras (554), IoT brokers (1883),
/// Chromecast (8008), and iOS sync (62078).
pub const CONNECT_DISCOVERY_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 443, 445, 515, 548, 554, 631, 993, 995, 1433,
    1883, 3306, 3389, 5000, 5001, 5353, 5900, 6379, 8000, 8008, 8080, 8081, 8443, 8888, 9000,
    9100, 49152, 62078,
];

const TCP_SYN_SOURCE_PORT: u16 = 54321;

/// Full three-way-handshake probing. Works without privileges.
pub struct TcpConnectDriver;

#[async_trait]
impl ProbeDriver for TcpConnectDriver {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::TcpConnect
    }

    async fn probe(
        &self,
        targets: &[IpAddr],
        options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    ) {
        let started = Instant::now();
        let ports: Arc<Vec<u16>> = Arc::new(if options.tcp_ports.is_empty() {
            CONNECT_DISCOVERY_PORTS.to_vec()
        } else {
            options.tcp_ports.clone()
        });
        let connect_timeout = options.timeout;
        let semaphore = Arc::new(Semaphore::new(options.concurrency));

        let mut handles = Vec::with_capacity(targets.len());
        for &target in targets {
            if cancel.is_cancelled() {
                break;
            }
            let sem = Arc::clone(&semaphore);
            let ports = Arc::clone(&ports);

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.ok()?;
                let probe_start = Instant::now();
                for &port in ports.iter() {
                    let addr = SocketAddr::new(target, port);
                    if let Ok(Ok(_)) =
                        timeout(connect_timeout, tokio::net::TcpStream::connect(addr)).await
                    {
                        return Some((target, probe_start));
                    }
                }
                None
            }));
        }

        for handle in handles {
            if let Ok(Some((ip, probe_start))) = handle.await {
                sink.emit(DiscoveryEvent::alive(
                    DiscoveryMethod::TcpConnect,
                    ip,
                    probe_start,
                ))
                .await;
            }
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tcp connect sweep done"
        );
    }
}

/// Half-open SYN probing over a raw transport channel. A SYN-ACK or RST
/// from the target both prove liveness.
pub struct TcpSynDriver;

#[async_trait]
impl ProbeDriver for TcpSynDriver {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::TcpSyn
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

        // Raw IPv6 TCP is not worth the complexity here; the connect
        // driver covers IPv6 hosts.
        let ipv4_targets: Vec<Ipv4Addr> = targets
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        if ipv4_targets.is_empty() || cancel.is_cancelled() {
            return;
        }

        let ports = if options.tcp_ports.is_empty() {
            CONNECT_DISCOVERY_PORTS.to_vec()
        } else {
            options.tcp_ports.clone()
        };
        let sweep_timeout = options.timeout;
        let scan_targets = ipv4_targets.clone();

        let result = tokio::task::spawn_blocking(move || {
            syn_sweep_blocking(&scan_targets, &ports, sweep_timeout)
        })
        .await;

        match result {
            Ok(Ok(alive)) => {
                for ip in alive {
                    sink.emit(DiscoveryEvent::alive(
                        DiscoveryMethod::TcpSyn,
                        IpAddr::V4(ip),
                        started,
                    ))
                    .await;
                }
            }
            Ok(Err(error)) => {
                sink.emit(DiscoveryEvent::failure(
                    DiscoveryMethod::TcpSyn,
                    IpAddr::V4(ipv4_targets[0]),
                    error,
                    started,
                ))
                .await;
            }
            Err(e) => debug!("syn sweep task failed: {e}"),
        }
    }
}

fn syn_sweep_blocking(
    targets: &[Ipv4Addr],
    ports: &[u16],
    timeout: Duration,
) -> Result<Vec<Ipv4Addr>, ProbeError> {
    let protocol =
        TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Tcp));
    let (mut tx, mut rx) = transport::transport_channel(4096, protocol).map_err(|e| {
        ProbeError::PermissionDenied(format!("cannot open raw TCP channel: {e}"))
    })?;

    let alive: Arc<Mutex<HashSet<Ipv4Addr>>> = Arc::new(Mutex::new(HashSet::new()));
    let stop = Arc::new(AtomicBool::new(false));
    let target_set: HashSet<Ipv4Addr> = targets.iter().copied().collect();

    let receiver = {
        let alive = Arc::clone(&alive);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut iter = tcp_packet_iter(&mut rx);
            while !stop.load(Ordering::SeqCst) {
                match iter.next_with_timeout(Duration::from_millis(100)) {
                    Ok(Some((packet, source))) => {
                        let IpAddr::V4(source_ip) = source else { continue };
                        if !target_set.contains(&source_ip) {
                            continue;
                        }
                        let flags = packet.get_flags();
                        let syn_ack =
                            flags & TcpFlags::SYN != 0 && flags & TcpFlags::ACK != 0;
                        let rst = flags & TcpFlags::RST != 0;
                        if syn_ack || rst {
                            if let Ok(mut set) = alive.lock() {
                                set.insert(source_ip);
                            }
                        }
                    }
                    Ok(None) => continue,
                    Err(_) => break,
                }
            }
        })
    };

    for &target in targets {
        for &port in ports {
            send_syn_packet(&mut tx, target, port, TCP_SYN_SOURCE_PORT);
        }
    }

    std::thread::sleep(timeout);
    stop.store(true, Ordering::SeqCst);
    let _ = receiver.join();

    let set = alive.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    Ok(set.iter().copied().collect())
}

fn send_syn_packet(tx: &mut TransportSender, target: Ipv4Addr, dest_port: u16, source_port: u16) {
    let mut tcp_buffer = [0u8; 20];
    let Some(mut tcp_packet) = MutableTcpPacket::new(&mut tcp_buffer) else {
        return;
    };

    tcp_packet.set_source(source_port);
    tcp_packet.set_destination(dest_port);
    tcp_packet.set_sequence(rand::random::<u32>());
    tcp_packet.set_acknowledgement(0);
    tcp_packet.set_data_offset(5);
    tcp_packet.set_reserved(0);
    tcp_packet.set_flags(TcpFlags::SYN);
    tcp_packet.set_window(65535);
    tcp_packet.set_urgent_ptr(0);

    let source_ip = source_ip_for_target(target);
    let checksum = tcp_checksum(&tcp_packet.to_immutable(), source_ip, target);
    tcp_packet.set_checksum(checksum);

    let _ = tx.send_to(tcp_packet, IpAddr::V4(target));
}

fn source_ip_for_target(target: Ipv4Addr) -> Ipv4Addr {
    for iface in pnet::datalink::interfaces() {
        for net in &iface.ips {
            if let pnet::ipnetwork::IpNetwork::V4(v4_net) = net {
                if v4_net.contains(target) || (!iface.is_loopback() && iface.is_up()) {
                    return v4_net.ip();
                }
            }
        }
    }
    Ipv4Addr::UNSPECIFIED
}

/// TCP checksum over the IPv4 pseudo-header plus segment.
fn tcp_checksum(tcp: &TcpPacket<'_>, source: Ipv4Addr, dest: Ipv4Addr) -> u16 {
    let tcp_len = tcp.packet().len();
    let mut pseudo = Vec::with_capacity(12 + tcp_len);
    pseudo.extend_from_slice(&source.octets());
    pseudo.extend_from_slice(&dest.octets());
    pseudo.push(0);
    pseudo.push(6);
    pseudo.push((tcp_len >> 8) as u8);
    pseudo.push((tcp_len & 0xff) as u8);
    pseudo.extend_from_slice(tcp.packet());

    let mut sum: u32 = 0;
    let mut i = 0;
    while i < pseudo.len() {
        let word = if i + 1 < pseudo.len() {
            u16::from_be_bytes([pseudo[i], pseudo[i + 1]])
        } else {
            u16::from_be_bytes([pseudo[i], 0])
        };
        sum = sum.wrapping_add(u32::from(word));
        i += 2;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}
