//! SSDP/UPnP discovery via multicast M-SEARCH.
//!
//! Device identity comes from the response headers (ST, USN, SERVER).
//! The LOCATION description URL is recorded but never fetched.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::{EventSink, ProbeDriver, ProbeOptions};
use crate::cancel::CancelState;
use crate::error::ProbeError;
use crate::types::{DiscoveryEvent, DiscoveryMethod, SsdpDeviceInfo};

const SSDP_MULTICAST_ADDR_V4: &str = "239.255.255.250:1900";
/// Link-local all-SSDP scope for IPv6.
const SSDP_MULTICAST_ADDR_V6: &str = "[ff02::c]:1900";

/// Multicast responses straggle in; below this window too much is missed.
const SSDP_MIN_TIMEOUT: Duration = Duration::from_millis(3000);

const SSDP_SEARCH_TARGETS: &[&str] = &[
    "ssdp:all",
    "upnp:rootdevice",
    "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
];

pub struct SsdpDriver;

#[async_trait]
impl ProbeDriver for SsdpDriver {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Ssdp
    }

    async fn probe(
        &self,
        targets: &[IpAddr],
        options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    ) {
        let started = Instant::now();
        let search_timeout = options.timeout.max(SSDP_MIN_TIMEOUT);

        let v4 = tokio::spawn(collect_responses(
            "0.0.0.0:0",
            SSDP_MULTICAST_ADDR_V4,
            "239.255.255.250:1900",
            search_timeout,
        ));
        let v6 = tokio::spawn(collect_responses(
            "[::]:0",
            SSDP_MULTICAST_ADDR_V6,
            "[ff02::c]:1900",
            search_timeout,
        ));

        let (v4_responses, v6_responses) = tokio::join!(v4, v6);
        let (mut responses, mut malformed) = v4_responses.unwrap_or_default();
        let (v6_responses, v6_malformed) = v6_responses.unwrap_or_default();
        for (ip, info) in v6_responses {
            responses.entry(ip).or_insert(info);
        }
        malformed.extend(v6_malformed);

        if cancel.is_cancelled() {
            return;
        }

        for (ip, device) in responses {
            if !targets.is_empty() && !targets.contains(&ip) {
                continue;
            }
            let mut event = DiscoveryEvent::alive(DiscoveryMethod::Ssdp, ip, started);
            event.ssdp_device = Some(device);
            sink.emit(event).await;
        }

        for ip in malformed {
            sink.emit(DiscoveryEvent::failure(
                DiscoveryMethod::Ssdp,
                ip,
                ProbeError::ProtocolParseError("non-UTF-8 SSDP response".into()),
                started,
            ))
            .await;
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ssdp search done"
        );
    }
}

/// Send M-SEARCH for every search target and drain responses until the
/// deadline. Later responses may fill headers the first one lacked.
/// Senders of undecodable payloads are reported separately, once each.
async fn collect_responses(
    bind_addr: &'static str,
    multicast_addr: &'static str,
    host_header: &'static str,
    timeout: Duration,
) -> (HashMap<IpAddr, SsdpDeviceInfo>, HashSet<IpAddr>) {
    let mut responses: HashMap<IpAddr, SsdpDeviceInfo> = HashMap::new();
    let mut malformed: HashSet<IpAddr> = HashSet::new();

    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("ssdp: failed to bind {bind_addr}: {e}");
            return (responses, malformed);
        }
    };

    if let Ok(addr) = multicast_addr.parse::<SocketAddr>() {
        for st in SSDP_SEARCH_TARGETS {
            let request = build_msearch(host_header, st);
            let _ = socket.send_to(request.as_bytes(), addr).await;
        }
    }

    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(
            remaining.min(Duration::from_millis(100)),
            socket.recv_from(&mut buf),
        )
        .await
        {
            Ok(Ok((len, addr))) => {
                if addr.ip().is_loopback() {
                    continue;
                }
                let Ok(response) = std::str::from_utf8(&buf[..len]) else {
                    malformed.insert(addr.ip());
                    continue;
                };
                let parsed = parse_ssdp_response(response);
                responses
                    .entry(addr.ip())
                    .and_modify(|existing| merge_device_info(existing, &parsed))
                    .or_insert(parsed);
            }
            Ok(Err(_)) | Err(_) => continue,
        }
    }

    (responses, malformed)
}

fn build_msearch(host: &str, st: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         Host: {host}\r\n\
         Man: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         ST: {st}\r\n\
         \r\n"
    )
}

/// Parse an M-SEARCH response into device info. The ST header names the
/// matched device type; USN carries it too when ST is generic.
fn parse_ssdp_response(response: &str) -> SsdpDeviceInfo {
    let mut info = SsdpDeviceInfo::default();
    let mut st: Option<String> = None;

    for line in response.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "server" => info.server = Some(value.to_string()),
            "location" => info.location = Some(value.to_string()),
            "usn" => info.usn = Some(value.to_string()),
            "st" => st = Some(value.to_string()),
            _ => {}
        }
    }

    info.device_type = st
        .filter(|s| s.starts_with("urn:"))
        .or_else(|| extract_urn_from_usn(info.usn.as_deref()));
    info
}

/// Pull the device/service URN out of a USN like
/// `uuid:...::urn:schemas-upnp-org:device:MediaRenderer:1`.
fn extract_urn_from_usn(usn: Option<&str>) -> Option<String> {
    let usn = usn?;
    usn.find("urn:").map(|idx| usn[idx..].to_string())
}

fn merge_device_info(existing: &mut SsdpDeviceInfo, incoming: &SsdpDeviceInfo) {
    if existing.device_type.is_none() {
        existing.device_type = incoming.device_type.clone();
    }
    if existing.server.is_none() {
        existing.server = incoming.server.clone();
    }
    if existing.location.is_none() {
        existing.location = incoming.location.clone();
    }
    if existing.usn.is_none() {
        existing.usn = incoming.usn.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_msearch() {
        let request = build_msearch("239.255.255.250:1900", "ssdp:all");
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("Man: \"ssdp:discover\"\r\n"));
        assert!(request.contains("ST: ssdp:all\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_response_headers() {
        let response = "HTTP/1.1 200 OK\r\n\
                        CACHE-CONTROL: max-age=1800\r\n\
                        LOCATION: http://192.168.1.1:5000/rootDesc.xml\r\n\
                        SERVER: Linux/5.10 UPnP/1.1 MiniUPnPd/2.2\r\n\
                        ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
                        USN: uuid:abcd::urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\r\n";
        let info = parse_ssdp_response(response);
        assert_eq!(
            info.device_type.as_deref(),
            Some("urn:schemas-upnp-org:device:InternetGatewayDevice:1")
        );
        assert_eq!(
            info.server.as_deref(),
            Some("Linux/5.10 UPnP/1.1 MiniUPnPd/2.2")
        );
        assert!(info.location.is_some());
    }

    #[test]
    fn test_generic_st_falls_back_to_usn_urn() {
        let response = "HTTP/1.1 200 OK\r\n\
                        ST: upnp:rootdevice\r\n\
                        USN: uuid:1234::urn:schemas-upnp-org:device:MediaRenderer:1\r\n\r\n";
        let info = parse_ssdp_response(response);
        assert_eq!(
            info.device_type.as_deref(),
            Some("urn:schemas-upnp-org:device:MediaRenderer:1")
        );
    }

    #[test]
    fn test_parse_response_without_headers() {
        let info = parse_ssdp_response("HTTP/1.1 200 OK\r\n\r\n");
        assert!(info.device_type.is_none());
        assert!(info.server.is_none());
    }
}
