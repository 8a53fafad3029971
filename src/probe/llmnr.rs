//! LLMNR reverse lookup (RFC 4795).
//!
//! Sends DNS-format PTR queries to the 224.0.0.252:5355 multicast
//! group. Mostly answered by Windows hosts, which makes it a useful
//! hostname source for machines that ignore mDNS.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use super::{EventSink, ProbeDriver, ProbeOptions};
use crate::cancel::CancelState;
use crate::error::ProbeError;
use crate::types::{DiscoveryEvent, DiscoveryMethod, HostnameSource};

const LLMNR_MULTICAST_ADDR: &str = "224.0.0.252:5355";

/// DNS PTR record type.
const PTR_RTYPE: u16 = 0x000C;

pub struct LlmnrDriver;

#[async_trait]
impl ProbeDriver for LlmnrDriver {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Llmnr
    }

    async fn probe(
        &self,
        targets: &[IpAddr],
        options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    ) {
        let started = Instant::now();
        let Ok(dest) = LLMNR_MULTICAST_ADDR.parse::<SocketAddr>() else {
            return;
        };
        // IPv6 LLMNR is rare in the wild; only v4 targets are queried.
        let ipv4_targets: Vec<IpAddr> = targets.iter().filter(|ip| ip.is_ipv4()).copied().collect();
        if ipv4_targets.is_empty() {
            return;
        }

        let timeout = options.timeout;
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let mut handles = Vec::with_capacity(ipv4_targets.len());

        for target in ipv4_targets {
            if cancel.is_cancelled() {
                break;
            }
            let sem = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return (target, LlmnrReply::Silent);
                };
                (target, query_hostname(target, dest, timeout).await)
            }));
        }

        for handle in handles {
            let Ok((target, reply)) = handle.await else {
                continue;
            };
            match reply {
                LlmnrReply::Name(name) => {
                    let mut event = DiscoveryEvent::alive(DiscoveryMethod::Llmnr, target, started);
                    event.hostname = Some(name);
                    event.hostname_source = Some(HostnameSource::Llmnr);
                    sink.emit(event).await;
                }
                LlmnrReply::Malformed => {
                    sink.emit(DiscoveryEvent::failure(
                        DiscoveryMethod::Llmnr,
                        target,
                        ProbeError::ProtocolParseError("malformed LLMNR PTR response".into()),
                        started,
                    ))
                    .await;
                }
                LlmnrReply::Silent => {}
            }
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "llmnr sweep done"
        );
    }
}

enum LlmnrReply {
    Name(String),
    Malformed,
    Silent,
}

/// Send a PTR query for `target` and wait for the owning host to answer.
async fn query_hostname(target: IpAddr, dest: SocketAddr, timeout: Duration) -> LlmnrReply {
    let IpAddr::V4(v4) = target else {
        return LlmnrReply::Silent;
    };
    let octets = v4.octets();
    let ptr_name = format!(
        "{}.{}.{}.{}.in-addr.arpa",
        octets[3], octets[2], octets[1], octets[0]
    );

    let Ok(socket) = tokio::net::UdpSocket::bind("0.0.0.0:0").await else {
        return LlmnrReply::Silent;
    };
    let Some(query) = build_llmnr_query(&ptr_name, PTR_RTYPE) else {
        return LlmnrReply::Silent;
    };
    if socket.send_to(&query, dest).await.is_err() {
        return LlmnrReply::Silent;
    }

    let mut buf = [0u8; 1024];
    match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => match parse_llmnr_ptr_response(&buf[..len]) {
            Some(name) => LlmnrReply::Name(name),
            None => LlmnrReply::Malformed,
        },
        _ => LlmnrReply::Silent,
    }
}

/// DNS-format query packet with one question.
fn build_llmnr_query(name: &str, qtype: u16) -> Option<Vec<u8>> {
    let mut packet = Vec::with_capacity(64);

    let txid: u16 = rand::random();
    packet.extend_from_slice(&txid.to_be_bytes());
    // Flags: standard query, no recursion
    packet.extend_from_slice(&[0x00, 0x00]);
    // QDCOUNT=1, ANCOUNT=0, NSCOUNT=0, ARCOUNT=0
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in name.split('.') {
        let len = label.len();
        if len == 0 || len > 63 {
            return None;
        }
        packet.push(len as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0); // root label

    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS=IN

    Some(packet)
}

/// Pull the hostname out of a PTR response.
fn parse_llmnr_ptr_response(data: &[u8]) -> Option<String> {
    if data.len() < 12 {
        return None;
    }
    // QR bit must mark a response
    if data[2] & 0x80 == 0 {
        return None;
    }
    let ancount = u16::from_be_bytes([data[4], data[5]]);
    if ancount == 0 {
        return None;
    }

    // Skip the single question LLMNR responders echo back
    let mut offset = 12;
    offset = skip_dns_name(data, offset)?;
    offset += 4; // QTYPE + QCLASS

    if offset >= data.len() {
        return None;
    }

    // Answer record
    offset = skip_dns_name(data, offset)?;
    if offset + 10 > data.len() {
        return None;
    }
    let rtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    offset += 8; // TYPE + CLASS + TTL
    let rdlength = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
    offset += 2;
    if rtype != PTR_RTYPE || offset + rdlength > data.len() {
        return None;
    }

    read_dns_name(data, offset)
}

/// Skip a DNS name, handling compression pointers.
fn skip_dns_name(data: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        if offset >= data.len() {
            return None;
        }
        let len = data[offset] as usize;
        if len == 0 {
            return Some(offset + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(offset + 2);
        }
        offset += 1 + len;
    }
}

/// Read a DNS name, following compression pointers. Pointers may only
/// point backwards, which bounds the walk on hostile input.
fn read_dns_name(data: &[u8], mut offset: usize) -> Option<String> {
    let mut name = String::new();
    let mut depth = 0;

    loop {
        if offset >= data.len() || depth > 10 {
            return None;
        }
        let len = data[offset] as usize;
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            if offset + 1 >= data.len() {
                return None;
            }
            let ptr = ((len & 0x3F) << 8) | data[offset + 1] as usize;
            if ptr >= offset {
                return None;
            }
            offset = ptr;
            depth += 1;
            continue;
        }
        offset += 1;
        if offset + len > data.len() {
            return None;
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(&data[offset..offset + len]));
        offset += len;
    }

    let clean = name.trim_end_matches('.').to_string();
    if clean.is_empty() {
        None
    } else {
        Some(clean)
    }
}
