//! WS-Discovery SOAP probing over UDP multicast (port 3702).
//!
//! Answered mostly by Windows machines, printers, and ONVIF cameras.
//! ProbeMatch responses are parsed with an event-based XML reader,
//! matching on local element names since responders disagree on
//! namespace prefixes.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tokio::net::UdpSocket;
use tracing::debug;
use uuid::Uuid;

use super::{EventSink, ProbeDriver, ProbeOptions};
use crate::cancel::CancelState;
use crate::error::ProbeError;
use crate::types::{DiscoveryEvent, DiscoveryMethod, WsDiscoveryInfo};

const WSD_MULTICAST_ADDR: &str = "239.255.255.250:3702";
const WSD_MAX_RESPONSE_SIZE: usize = 16384;
const WSD_MIN_TIMEOUT: Duration = Duration::from_millis(3000);

pub struct WsDiscoveryDriver;

#[async_trait]
impl ProbeDriver for WsDiscoveryDriver {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::WsDiscovery
    }

    async fn probe(
        &self,
        targets: &[IpAddr],
        options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    ) {
        let started = Instant::now();
        let probe_timeout = options.timeout.max(WSD_MIN_TIMEOUT);

        let (responses, malformed) = run_probe(probe_timeout).await;
        if cancel.is_cancelled() {
            return;
        }

        for (ip, info) in responses {
            if !targets.is_empty() && !targets.contains(&ip) {
                continue;
            }
            let mut event = DiscoveryEvent::alive(DiscoveryMethod::WsDiscovery, ip, started);
            event.ws_discovery = Some(info);
            sink.emit(event).await;
        }

        for ip in malformed {
            sink.emit(DiscoveryEvent::failure(
                DiscoveryMethod::WsDiscovery,
                ip,
                ProbeError::ProtocolParseError("unparseable WS-Discovery response".into()),
                started,
            ))
            .await;
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ws-discovery probe done"
        );
    }
}

/// Multicast a Probe and collect ProbeMatch responses until the deadline.
/// Senders whose payloads cannot be decoded are reported separately.
async fn run_probe(timeout: Duration) -> (HashMap<IpAddr, WsDiscoveryInfo>, HashSet<IpAddr>) {
    let mut results = HashMap::new();
    let mut malformed = HashSet::new();

    let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
        return (results, malformed);
    };
    // LAN only, per the WS-Discovery spec
    let _ = socket.set_ttl(1);

    let message_id = Uuid::new_v4();
    let probe = build_probe_message(&message_id.to_string());
    let Ok(dest) = WSD_MULTICAST_ADDR.parse::<SocketAddr>() else {
        return (results, malformed);
    };

    // Send twice; multicast datagrams get dropped
    for _ in 0..2 {
        if socket.send_to(probe.as_bytes(), dest).await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut buf = [0u8; WSD_MAX_RESPONSE_SIZE];
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
                match std::str::from_utf8(&buf[..len]) {
                    Ok(response) => match parse_probe_match(response) {
                        ProbeMatchParse::Info(info) => {
                            results.entry(addr.ip()).or_insert(info);
                        }
                        ProbeMatchParse::Malformed => {
                            malformed.insert(addr.ip());
                        }
                        ProbeMatchParse::Unrelated => {}
                    },
                    Err(_) => {
                        malformed.insert(addr.ip());
                    }
                }
            }
            Ok(Err(_)) | Err(_) => continue,
        }
    }

    (results, malformed)
}

fn build_probe_message(message_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope
  xmlns:soap="http://www.w3.org/2003/05/soap-envelope"
  xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing"
  xmlns:wsd="http://schemas.xmlsoap.org/ws/2005/04/discovery">
  <soap:Header>
    <wsa:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</wsa:To>
    <wsa:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</wsa:Action>
    <wsa:MessageID>urn:uuid:{message_id}</wsa:MessageID>
  </soap:Header>
  <soap:Body>
    <wsd:Probe/>
  </soap:Body>
</soap:Envelope>"#
    )
}

/// Outcome of parsing one inbound datagram.
enum ProbeMatchParse {
    Info(WsDiscoveryInfo),
    /// Broken XML, or a ProbeMatch with nothing extractable.
    Malformed,
    /// Well-formed but not a ProbeMatch (Hello, Bye, someone else's Probe).
    Unrelated,
}

/// Extract Types, XAddrs, and Scopes from a ProbeMatch response.
fn parse_probe_match(xml: &str) -> ProbeMatchParse {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut device_types = Vec::new();
    let mut xaddrs = Vec::new();
    let mut scopes = Vec::new();
    let mut current_tag = String::new();
    let mut in_probe_match = false;
    let mut saw_probe_match = false;
    let mut broken = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if tag == "ProbeMatch" || tag == "ProbeMatches" {
                    in_probe_match = true;
                    saw_probe_match = true;
                }
                current_tag = tag;
            }
            Ok(Event::Text(ref e)) => {
                if in_probe_match {
                    let text = e.unescape().unwrap_or_default().trim().to_string();
                    if !text.is_empty() {
                        match current_tag.as_str() {
                            "Types" => {
                                device_types.extend(text.split_whitespace().map(String::from));
                            }
                            "XAddrs" => {
                                xaddrs.extend(text.split_whitespace().map(String::from));
                            }
                            "Scopes" => {
                                scopes.extend(text.split_whitespace().map(String::from));
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if tag == "ProbeMatch" || tag == "ProbeMatches" {
                    in_probe_match = false;
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(_) => {
                broken = true;
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    if !(device_types.is_empty() && xaddrs.is_empty() && scopes.is_empty()) {
        ProbeMatchParse::Info(WsDiscoveryInfo {
            device_types,
            xaddrs,
            scopes,
        })
    } else if broken || saw_probe_match {
        ProbeMatchParse::Malformed
    } else {
        ProbeMatchParse::Unrelated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(xml: &str) -> Option<WsDiscoveryInfo> {
        match parse_probe_match(xml) {
            ProbeMatchParse::Info(info) => Some(info),
            _ => None,
        }
    }

    #[test]
    fn test_build_probe_message() {
        let request = build_probe_message("test-uuid-1234");
        assert!(request.contains("urn:uuid:test-uuid-1234"));
        assert!(request.contains("<wsd:Probe/>"));
        assert!(request.contains("soap:Envelope"));
    }

    #[test]
    fn test_parse_probe_match_valid() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"
  xmlns:wsd="http://schemas.xmlsoap.org/ws/2005/04/discovery"
  xmlns:wsdp="http://schemas.xmlsoap.org/ws/2006/02/devprof">
  <soap:Body>
    <wsd:ProbeMatches>
      <wsd:ProbeMatch>
        <wsd:Types>wsdp:Device</wsd:Types>
        <wsd:Scopes>http://printer.example.com/</wsd:Scopes>
        <wsd:XAddrs>http://192.168.1.100:8080/ws</wsd:XAddrs>
      </wsd:ProbeMatch>
    </wsd:ProbeMatches>
  </soap:Body>
</soap:Envelope>"#;

        let info = parsed(xml).expect("should parse");
        assert_eq!(info.device_types, vec!["wsdp:Device"]);
        assert_eq!(info.xaddrs, vec!["http://192.168.1.100:8080/ws"]);
        assert_eq!(info.scopes, vec!["http://printer.example.com/"]);
    }

    #[test]
    fn test_parse_probe_match_multiple_types() {
        let xml = r#"<Envelope>
  <Body>
    <ProbeMatches>
      <ProbeMatch>
        <Types>wsdp:Device print:PrintDeviceType</Types>
        <XAddrs>http://10.0.0.1/ws http://10.0.0.1/print</XAddrs>
      </ProbeMatch>
    </ProbeMatches>
  </Body>
</Envelope>"#;

        let info = parsed(xml).expect("should parse");
        assert_eq!(info.device_types.len(), 2);
        assert_eq!(info.xaddrs.len(), 2);
        assert!(info.scopes.is_empty());
    }

    #[test]
    fn test_parse_probe_match_with_attributes() {
        // Attribute-bearing elements must still yield their text content.
        let xml = r#"<Envelope>
  <Body>
    <ProbeMatches xmlns="http://schemas.xmlsoap.org/ws/2005/04/discovery">
      <ProbeMatch MetadataVersion="1">
        <Types xml:space="preserve">tdn:NetworkVideoTransmitter</Types>
        <XAddrs>http://10.0.0.7/onvif/device_service</XAddrs>
      </ProbeMatch>
    </ProbeMatches>
  </Body>
</Envelope>"#;

        let info = parsed(xml).expect("should parse");
        assert_eq!(info.device_types, vec!["tdn:NetworkVideoTransmitter"]);
    }

    #[test]
    fn test_parse_probe_match_ignores_unrelated_messages() {
        assert!(matches!(
            parse_probe_match("<soap:Envelope/>"),
            ProbeMatchParse::Unrelated
        ));
        assert!(matches!(
            parse_probe_match("not xml at all"),
            ProbeMatchParse::Unrelated
        ));
        // A Hello message has Types but no ProbeMatch
        assert!(matches!(
            parse_probe_match("<wsd:Hello><wsd:Types>x</wsd:Types></wsd:Hello>"),
            ProbeMatchParse::Unrelated
        ));
    }

    #[test]
    fn test_parse_probe_match_flags_broken_xml() {
        assert!(matches!(
            parse_probe_match("<ProbeMatch><"),
            ProbeMatchParse::Malformed
        ));
        // ProbeMatch envelope carrying nothing extractable
        assert!(matches!(
            parse_probe_match("<ProbeMatches><ProbeMatch></ProbeMatch></ProbeMatches>"),
            ProbeMatchParse::Malformed
        ));
    }
}
