//! UDP service probing with protocol-aware payloads.
//!
//! Any reply proves liveness. NetBIOS node status (port 137) and the
//! SNMP system group (port 161) are additionally queried for hostnames
//! and device metadata, each over its own socket so replies cannot be
//! attributed to the wrong protocol.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use snmp2::{Oid, SyncSession, Value};
use tokio::sync::Semaphore;
use tracing::debug;

use super::{EventSink, ProbeDriver, ProbeOptions};
use crate::cancel::CancelState;
use crate::error::ProbeError;
use crate::types::{DiscoveryEvent, DiscoveryMethod, HostnameSource, SnmpInfo};

/// UDP ports swept for bare liveness; 137 and 161 have dedicated paths.
const UDP_DISCOVERY_PORTS: &[u16] = &[53, 123, 500, 1900, 5353];

/// Per-port response timeout. UDP services answer fast or not at all.
const UDP_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

const NETBIOS_PORT: u16 = 137;

const SNMP_PORT: u16 = 161;
const SNMP_COMMUNITY: &[u8] = b"public";
const SNMP_TIMEOUT: Duration = Duration::from_millis(500);

/// MIB-2 system group OIDs.
const SYS_NAME_OID: [u64; 9] = [1, 3, 6, 1, 2, 1, 1, 5, 0];
const SYS_DESCR_OID: [u64; 9] = [1, 3, 6, 1, 2, 1, 1, 1, 0];
const SYS_LOCATION_OID: [u64; 9] = [1, 3, 6, 1, 2, 1, 1, 6, 0];
const SYS_CONTACT_OID: [u64; 9] = [1, 3, 6, 1, 2, 1, 1, 4, 0];

pub struct UdpProbeDriver;

#[async_trait]
impl ProbeDriver for UdpProbeDriver {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::UdpProbe
    }

    async fn probe(
        &self,
        targets: &[IpAddr],
        options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    ) {
        let started = Instant::now();
        let ipv4_targets: Vec<IpAddr> = targets.iter().filter(|ip| ip.is_ipv4()).copied().collect();
        if ipv4_targets.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let mut handles = Vec::with_capacity(ipv4_targets.len());

        for target in ipv4_targets {
            if cancel.is_cancelled() {
                break;
            }
            let sem = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return Vec::new();
                };
                probe_one_host(target).await
            }));
        }

        for handle in handles {
            if let Ok(events) = handle.await {
                for event in events {
                    sink.emit(event).await;
                }
            }
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "udp probe sweep done"
        );
    }
}

/// Probe one host: a liveness sweep plus the NetBIOS and SNMP metadata
/// queries. Returns nothing when nothing answered. A NetBIOS reply that
/// is present but unparseable still proves liveness and additionally
/// yields a parse-failure event for the sender.
async fn probe_one_host(target: IpAddr) -> Vec<DiscoveryEvent> {
    let probe_start = Instant::now();
    let mut alive = sweep_liveness_ports(target).await;
    let mut parse_failures: Vec<String> = Vec::new();

    let netbios_name = match query_netbios_name(target, NETBIOS_PORT).await {
        NetbiosReply::Name(name) => {
            alive = true;
            Some(name)
        }
        NetbiosReply::Malformed => {
            alive = true;
            parse_failures.push("malformed NetBIOS node status reply".into());
            None
        }
        NetbiosReply::Silent => None,
    };

    let snmp_info = query_snmp_info(target).await;
    if snmp_info.is_some() {
        alive = true;
    }

    if !alive {
        return Vec::new();
    }

    let mut event = DiscoveryEvent::alive(DiscoveryMethod::UdpProbe, target, probe_start);
    if let Some(name) = netbios_name {
        event.hostname = Some(name);
        event.hostname_source = Some(HostnameSource::Netbios);
    } else if let Some(sys_name) = snmp_info.as_ref().and_then(|i| i.sys_name.clone()) {
        event.hostname = Some(sys_name);
        event.hostname_source = Some(HostnameSource::Snmp);
    }
    event.snmp_info = snmp_info;

    let mut events = vec![event];
    for detail in parse_failures {
        events.push(DiscoveryEvent::failure(
            DiscoveryMethod::UdpProbe,
            target,
            ProbeError::ProtocolParseError(detail),
            probe_start,
        ));
    }
    events
}

/// Poke the liveness ports and report whether anything came back from
/// the target. Payloads are not parsed here.
async fn sweep_liveness_ports(target: IpAddr) -> bool {
    let Ok(socket) = tokio::net::UdpSocket::bind("0.0.0.0:0").await else {
        return false;
    };
    let mut buf = [0u8; 2048];

    for &port in UDP_DISCOVERY_PORTS {
        let addr = SocketAddr::new(target, port);
        if socket.send_to(&probe_payload(port), addr).await.is_err() {
            continue;
        }
        match tokio::time::timeout(UDP_PROBE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((_, from))) if from.ip() == target => return true,
            _ => continue,
        }
    }
    false
}

/// Probe bytes for a liveness port. Protocol-correct payloads draw
/// replies from services that ignore empty datagrams.
fn probe_payload(port: u16) -> Vec<u8> {
    match port {
        // Minimal DNS query header
        53 => vec![
            0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ],
        // NTP version request
        123 => vec![0x1b, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        _ => vec![0x00],
    }
}

// =============================================================================
// NetBIOS Name Service (port 137)
// =============================================================================

/// Outcome of a node status query over the dedicated NetBIOS socket.
enum NetbiosReply {
    Name(String),
    Malformed,
    Silent,
}

fn is_reply_for(from: SocketAddr, target: IpAddr, port: u16) -> bool {
    from.ip() == target && from.port() == port
}

/// Query the node status of `target` on its own socket. Only datagrams
/// from the queried host and port reach the parser; anything else is
/// ignored until the window closes.
async fn query_netbios_name(target: IpAddr, port: u16) -> NetbiosReply {
    let Ok(socket) = tokio::net::UdpSocket::bind("0.0.0.0:0").await else {
        return NetbiosReply::Silent;
    };
    let addr = SocketAddr::new(target, port);
    if socket.send_to(&build_node_status_request(), addr).await.is_err() {
        return NetbiosReply::Silent;
    }

    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + UDP_PROBE_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return NetbiosReply::Silent;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) if is_reply_for(from, target, port) => {
                return match parse_node_status_response(&buf[..len]) {
                    Some(name) => NetbiosReply::Name(name),
                    None => NetbiosReply::Malformed,
                };
            }
            Ok(Ok(_)) => continue,
            _ => return NetbiosReply::Silent,
        }
    }
}

/// NBSTAT node status request for the wildcard name "*".
fn build_node_status_request() -> Vec<u8> {
    let mut packet = Vec::with_capacity(50);

    let txid: u16 = rand::random();
    packet.extend_from_slice(&txid.to_be_bytes());
    // Flags: standard query, no recursion
    packet.extend_from_slice(&[0x00, 0x00]);
    // QDCOUNT=1, ANCOUNT=0, NSCOUNT=0, ARCOUNT=0
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    // "*" space-padded to 15 chars plus a zero suffix byte, first-level
    // encoded: each nibble maps to 'A'..'P'.
    packet.push(0x20);
    let name_bytes = [
        b'*', 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20,
        0x00,
    ];
    for &byte in &name_bytes {
        packet.push((byte >> 4) + b'A');
        packet.push((byte & 0x0F) + b'A');
    }
    packet.push(0x00);

    // QTYPE=NBSTAT(0x0021), QCLASS=IN
    packet.extend_from_slice(&[0x00, 0x21, 0x00, 0x01]);

    packet
}

fn skip_encoded_name(data: &[u8], start: usize) -> Option<usize> {
    let mut pos = start;
    while pos < data.len() {
        let len = data[pos];
        if len == 0 {
            return Some(pos + 1);
        }
        if len >= 0xC0 {
            // Compression pointer
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
    None
}

/// Parse a node status response and pick the first unique workstation
/// (0x00) or file server (0x20) name.
fn parse_node_status_response(data: &[u8]) -> Option<String> {
    if data.len() < 57 {
        return None;
    }

    let mut pos = 12;

    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    for _ in 0..qdcount {
        pos = skip_encoded_name(data, pos)?;
        pos += 4;
    }

    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;
    if ancount == 0 {
        return None;
    }

    pos = skip_encoded_name(data, pos)?;
    // TYPE + CLASS + TTL
    pos += 8;
    if pos + 2 > data.len() {
        return None;
    }
    let rdlength = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    if pos + rdlength > data.len() || rdlength == 0 {
        return None;
    }

    let num_names = data[pos] as usize;
    pos += 1;

    for _ in 0..num_names {
        if pos + 18 > data.len() {
            break;
        }
        // 15 space-padded ASCII chars, 1 suffix byte, 2 flag bytes
        let name: String = data[pos..pos + 15]
            .iter()
            .filter(|&&b| (0x20..0x7F).contains(&b))
            .map(|&b| b as char)
            .collect::<String>()
            .trim_end()
            .to_string();
        let name_type = data[pos + 15];
        let flags = u16::from_be_bytes([data[pos + 16], data[pos + 17]]);
        let is_group = (flags & 0x8000) != 0;

        if !name.is_empty() && !is_group && (name_type == 0x00 || name_type == 0x20) {
            return Some(name);
        }
        pos += 18;
    }

    None
}

// =============================================================================
// SNMP v2c (port 161)
// =============================================================================

/// Query the SNMP system group over a dedicated v2c session. The
/// session is synchronous, so it runs on the blocking pool.
async fn query_snmp_info(target: IpAddr) -> Option<SnmpInfo> {
    tokio::task::spawn_blocking(move || query_snmp_sync(target))
        .await
        .ok()
        .flatten()
}

fn query_snmp_sync(target: IpAddr) -> Option<SnmpInfo> {
    let addr = format!("{target}:{SNMP_PORT}");
    let mut session = SyncSession::new_v2c(&addr, SNMP_COMMUNITY, Some(SNMP_TIMEOUT), 0).ok()?;

    let mut info = SnmpInfo::default();
    // Each OID is queried on its own; devices often expose a subset.
    info.sys_name = snmp_get_string(&mut session, &SYS_NAME_OID);
    info.sys_descr = snmp_get_string(&mut session, &SYS_DESCR_OID);
    info.sys_location = snmp_get_string(&mut session, &SYS_LOCATION_OID);
    info.sys_contact = snmp_get_string(&mut session, &SYS_CONTACT_OID);

    if info.is_populated() {
        Some(info)
    } else {
        None
    }
}

fn snmp_get_string(session: &mut SyncSession, oid_arcs: &[u64; 9]) -> Option<String> {
    let oid = Oid::from(oid_arcs).ok()?;
    let response = session.get(&oid).ok()?;
    let mut out = None;
    for (_oid, value) in response.varbinds {
        if let Value::OctetString(bytes) = value {
            let s = String::from_utf8_lossy(bytes).trim().to_string();
            if !s.is_empty() {
                out = Some(s);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_node_status_request_shape() {
        let request = build_node_status_request();
        assert_eq!(request.len(), 50);
        // One question, zero answers
        assert_eq!(&request[4..8], &[0x00, 0x01, 0x00, 0x00]);
        // NBSTAT query type
        assert_eq!(&request[46..48], &[0x00, 0x21]);
    }

    fn sample_node_status_response() -> Vec<u8> {
        // Header: response, 0 questions, 1 answer
        let mut response = vec![
            0x80, 0x94, 0x84, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        // Answer name: compression pointer
        response.extend_from_slice(&[0xC0, 0x0C]);
        // TYPE, CLASS, TTL
        response.extend_from_slice(&[0x00, 0x21, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        // RDLENGTH: 1 + 2*18 = 37
        response.extend_from_slice(&[0x00, 0x25]);
        response.push(2); // two names
        // Group name first (should be skipped)
        response.extend_from_slice(b"WORKGROUP      ");
        response.push(0x00);
        response.extend_from_slice(&[0x84, 0x00]); // group flag set
        // Unique workstation name
        response.extend_from_slice(b"DESKTOP-ALPHA  ");
        response.push(0x00);
        response.extend_from_slice(&[0x04, 0x00]);
        // Pad to the minimum parse length
        while response.len() < 57 {
            response.push(0x00);
        }
        response
    }

    #[test]
    fn test_parse_node_status_response() {
        let response = sample_node_status_response();
        assert_eq!(
            parse_node_status_response(&response).as_deref(),
            Some("DESKTOP-ALPHA")
        );
    }

    #[test]
    fn test_parse_node_status_response_truncated() {
        assert_eq!(parse_node_status_response(&[0x80, 0x94]), None);
    }

    #[test]
    fn test_reply_source_must_match_target_and_port() {
        let target = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let other = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 21));
        assert!(is_reply_for(SocketAddr::new(target, 137), target, 137));
        // Same host answering from another port is a different protocol
        assert!(!is_reply_for(SocketAddr::new(target, 53), target, 137));
        assert!(!is_reply_for(SocketAddr::new(other, 137), target, 137));
    }

    #[tokio::test]
    async fn test_netbios_query_parses_matching_reply() {
        let responder = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (_, from) = responder.recv_from(&mut buf).await.unwrap();
            responder
                .send_to(&sample_node_status_response(), from)
                .await
                .unwrap();
        });

        let target = IpAddr::V4(Ipv4Addr::LOCALHOST);
        match query_netbios_name(target, port).await {
            NetbiosReply::Name(name) => assert_eq!(name, "DESKTOP-ALPHA"),
            _ => panic!("expected a parsed name"),
        }
    }

    #[tokio::test]
    async fn test_netbios_garbled_reply_reports_malformed() {
        let responder = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (_, from) = responder.recv_from(&mut buf).await.unwrap();
            responder.send_to(&[0xFF; 80], from).await.unwrap();
        });

        let target = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(matches!(
            query_netbios_name(target, port).await,
            NetbiosReply::Malformed
        ));
    }

    #[tokio::test]
    async fn test_netbios_ignores_reply_from_other_source_port() {
        let responder = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (_, from) = responder.recv_from(&mut buf).await.unwrap();
            // Answer from a second socket, i.e. a different source port.
            let stray = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            stray.send_to(&[0xFF; 80], from).await.unwrap();
        });

        let target = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(matches!(
            query_netbios_name(target, port).await,
            NetbiosReply::Silent
        ));
    }
}
