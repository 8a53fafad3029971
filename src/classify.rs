//! Rule-based device classification.
//!
//! `classify` is a pure function over a host record: every signal it
//! weighs (open ports, mDNS service types, SSDP/WS-Discovery metadata,
//! OUI vendor, hostname shape) is already on the record, so the
//! aggregator can recompute it after any merge without extra I/O.

use lazy_static::lazy_static;
use regex::Regex;

use crate::types::{DeviceCategory, DeviceClassification, HostRecord, PortState};

const PORT_WEIGHT: f32 = 0.5;
const SSDP_WEIGHT: f32 = 0.45;
const WSD_WEIGHT: f32 = 0.45;
const MDNS_WEIGHT: f32 = 0.4;
const VENDOR_WEIGHT: f32 = 0.35;
const HOSTNAME_WEIGHT: f32 = 0.3;

/// Ports whose presence alone is a strong category signal. Generic
/// ports (22, 80, 443, 445) stay out; everything runs those.
const PORT_SIGNATURES: &[(u16, DeviceCategory)] = &[
    (515, DeviceCategory::Printer),
    (631, DeviceCategory::Printer),
    (9100, DeviceCategory::Printer),
    (554, DeviceCategory::Camera),
    (8554, DeviceCategory::Camera),
    (548, DeviceCategory::Nas),
    (5000, DeviceCategory::Nas),
    (5001, DeviceCategory::Nas),
    (8096, DeviceCategory::MediaPlayer),
    (8200, DeviceCategory::MediaPlayer),
    (32400, DeviceCategory::MediaPlayer),
    (1883, DeviceCategory::SmartHome),
    (8883, DeviceCategory::SmartHome),
    (3389, DeviceCategory::Computer),
    (5900, DeviceCategory::Computer),
    (62078, DeviceCategory::Mobile),
];

/// mDNS service type prefixes, matched against the advertised type.
const MDNS_PREFIXES: &[(&str, DeviceCategory)] = &[
    ("_ipp.", DeviceCategory::Printer),
    ("_ipps.", DeviceCategory::Printer),
    ("_printer.", DeviceCategory::Printer),
    ("_pdl-datastream.", DeviceCategory::Printer),
    ("_scanner.", DeviceCategory::Printer),
    ("_uscan.", DeviceCategory::Printer),
    ("_airplay.", DeviceCategory::MediaPlayer),
    ("_raop.", DeviceCategory::MediaPlayer),
    ("_googlecast.", DeviceCategory::MediaPlayer),
    ("_spotify-connect.", DeviceCategory::MediaPlayer),
    ("_sonos.", DeviceCategory::MediaPlayer),
    ("_daap.", DeviceCategory::MediaPlayer),
    ("_hap.", DeviceCategory::SmartHome),
    ("_hue.", DeviceCategory::SmartHome),
    ("_matter.", DeviceCategory::SmartHome),
    ("_axis-video.", DeviceCategory::Camera),
    ("_psia.", DeviceCategory::Camera),
    ("_afpovertcp.", DeviceCategory::Nas),
    ("_nfs.", DeviceCategory::Nas),
    ("_workstation.", DeviceCategory::Computer),
];

/// Substrings matched against SSDP deviceType / SERVER / USN text.
const SSDP_SIGNATURES: &[(&str, DeviceCategory)] = &[
    ("InternetGatewayDevice", DeviceCategory::Router),
    ("WANConnectionDevice", DeviceCategory::Router),
    ("MediaRenderer", DeviceCategory::MediaPlayer),
    ("MediaServer", DeviceCategory::MediaPlayer),
    ("Sonos", DeviceCategory::MediaPlayer),
    ("Roku", DeviceCategory::MediaPlayer),
    ("Printer", DeviceCategory::Printer),
    ("NetworkStorageDevice", DeviceCategory::Nas),
    ("Camera", DeviceCategory::Camera),
    ("hue-bridge", DeviceCategory::SmartHome),
    ("IpBridge", DeviceCategory::SmartHome),
];

/// Substrings matched against WS-Discovery type QNames.
const WSD_SIGNATURES: &[(&str, DeviceCategory)] = &[
    ("PrintDeviceType", DeviceCategory::Printer),
    ("ScanDeviceType", DeviceCategory::Printer),
    ("Printer", DeviceCategory::Printer),
    ("NetworkVideoTransmitter", DeviceCategory::Camera),
    ("Computer", DeviceCategory::Computer),
];

/// Substrings matched against the lowercased OUI vendor.
const VENDOR_SIGNATURES: &[(&str, DeviceCategory)] = &[
    ("cisco", DeviceCategory::Router),
    ("tp-link", DeviceCategory::Router),
    ("netgear", DeviceCategory::Router),
    ("ubiquiti", DeviceCategory::Router),
    ("mikrotik", DeviceCategory::Router),
    ("d-link", DeviceCategory::Router),
    ("brother", DeviceCategory::Printer),
    ("canon", DeviceCategory::Printer),
    ("epson", DeviceCategory::Printer),
    ("lexmark", DeviceCategory::Printer),
    ("synology", DeviceCategory::Nas),
    ("qnap", DeviceCategory::Nas),
    ("western digital", DeviceCategory::Nas),
    ("axis", DeviceCategory::Camera),
    ("hikvision", DeviceCategory::Camera),
    ("dahua", DeviceCategory::Camera),
    ("reolink", DeviceCategory::Camera),
    ("sonos", DeviceCategory::MediaPlayer),
    ("roku", DeviceCategory::MediaPlayer),
    ("espressif", DeviceCategory::SmartHome),
    ("tuya", DeviceCategory::SmartHome),
    ("philips", DeviceCategory::SmartHome),
    ("amazon", DeviceCategory::SmartHome),
    ("raspberry pi", DeviceCategory::Computer),
    ("intel", DeviceCategory::Computer),
    ("dell", DeviceCategory::Computer),
    ("lenovo", DeviceCategory::Computer),
    ("vmware", DeviceCategory::Computer),
    ("microsoft", DeviceCategory::Computer),
];

lazy_static! {
    static ref HOSTNAME_RULES: Vec<(Regex, DeviceCategory)> = vec![
        (
            Regex::new(r"(?i)router|gateway|openwrt|pfsense|unifi|fritz").unwrap(),
            DeviceCategory::Router,
        ),
        (
            Regex::new(r"(?i)printer|print|mfc|mfp|laserjet|deskjet").unwrap(),
            DeviceCategory::Printer,
        ),
        (
            Regex::new(r"(?i)\bnas\b|diskstation|rackstation|freenas|truenas").unwrap(),
            DeviceCategory::Nas,
        ),
        (
            Regex::new(r"(?i)appletv|apple-tv|chromecast|roku|sonos|shield").unwrap(),
            DeviceCategory::MediaPlayer,
        ),
        (
            Regex::new(r"(?i)\bcam\b|camera|doorbell|ipcam").unwrap(),
            DeviceCategory::Camera,
        ),
        (
            Regex::new(r"(?i)\bhue\b|tasmota|shelly|thermostat|esp-?\d").unwrap(),
            DeviceCategory::SmartHome,
        ),
        (
            Regex::new(r"(?i)iphone|ipad|android|pixel|galaxy").unwrap(),
            DeviceCategory::Mobile,
        ),
        (
            Regex::new(r"(?i)macbook|imac|desktop|laptop|workstation|-pc\b").unwrap(),
            DeviceCategory::Computer,
        ),
    ];
}

struct Scorecard {
    scores: Vec<(DeviceCategory, f32, Vec<String>)>,
}

impl Scorecard {
    fn new() -> Self {
        Self { scores: Vec::new() }
    }

    fn add(&mut self, category: DeviceCategory, weight: f32, evidence: String) {
        match self.scores.iter_mut().find(|(c, _, _)| *c == category) {
            Some((_, score, lines)) => {
                *score += weight;
                lines.push(evidence);
            }
            None => self.scores.push((category, weight, vec![evidence])),
        }
    }

    /// Highest-scoring category, or none on an empty card or a strict
    /// tie for the top score.
    fn winner(mut self) -> Option<(DeviceCategory, f32, Vec<String>)> {
        self.scores
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        match self.scores.len() {
            0 => None,
            1 => self.scores.pop(),
            _ if self.scores[0].1 == self.scores[1].1 => None,
            _ => Some(self.scores.swap_remove(0)),
        }
    }
}

/// Classify a host from the evidence on its record.
pub fn classify(record: &HostRecord) -> DeviceClassification {
    let mut card = Scorecard::new();

    for port in &record.ports {
        if port.state != PortState::Open {
            continue;
        }
        for &(signature_port, category) in PORT_SIGNATURES {
            if port.port == signature_port {
                card.add(category, PORT_WEIGHT, format!("open port {}", port.port));
            }
        }
    }

    for service in &record.mdns_services {
        for &(prefix, category) in MDNS_PREFIXES {
            if service.service_type.starts_with(prefix) {
                card.add(
                    category,
                    MDNS_WEIGHT,
                    format!("mDNS service {}", service.service_type),
                );
            }
        }
    }

    if let Some(ssdp) = &record.ssdp_device {
        let haystack = [
            ssdp.device_type.as_deref(),
            ssdp.server.as_deref(),
            ssdp.usn.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
        for &(needle, category) in SSDP_SIGNATURES {
            if haystack.contains(needle) {
                card.add(category, SSDP_WEIGHT, format!("SSDP reports {needle}"));
            }
        }
    }

    if let Some(wsd) = &record.ws_discovery {
        let haystack = wsd.device_types.join(" ");
        for &(needle, category) in WSD_SIGNATURES {
            if haystack.contains(needle) {
                card.add(
                    category,
                    WSD_WEIGHT,
                    format!("WS-Discovery reports {needle}"),
                );
            }
        }
    }

    if let Some(vendor) = &record.vendor {
        let vendor_lc = vendor.to_lowercase();
        for &(needle, category) in VENDOR_SIGNATURES {
            if vendor_lc.contains(needle) {
                card.add(category, VENDOR_WEIGHT, format!("vendor {vendor}"));
            }
        }
    }

    if let Some(hostname) = &record.hostname {
        for (pattern, category) in HOSTNAME_RULES.iter() {
            if pattern.is_match(hostname) {
                card.add(*category, HOSTNAME_WEIGHT, format!("hostname {hostname}"));
            }
        }
    }

    match card.winner() {
        Some((category, score, evidence)) => DeviceClassification {
            category,
            confidence: score.min(1.0),
            evidence,
        },
        None => DeviceClassification {
            category: DeviceCategory::Unknown,
            confidence: 0.0,
            evidence: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfidenceTier, MdnsServiceInfo, PortInfo, SsdpDeviceInfo};
    use std::net::{IpAddr, Ipv4Addr};

    fn record() -> HostRecord {
        HostRecord::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)))
    }

    fn open_port(port: u16) -> PortInfo {
        PortInfo {
            port,
            state: PortState::Open,
            service: None,
            banner: None,
            tls_cert: None,
        }
    }

    #[test]
    fn test_no_evidence_is_unknown_with_zero_confidence() {
        let result = classify(&record());
        assert_eq!(result.category, DeviceCategory::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert!(result.evidence.is_empty());
        assert_eq!(result.tier(), ConfidenceTier::Unknown);
    }

    #[test]
    fn test_printer_with_jetdirect_and_ipp_is_high_confidence() {
        let mut host = record();
        host.ports.push(open_port(9100));
        host.mdns_services.push(MdnsServiceInfo {
            instance_name: "Office Printer".into(),
            service_type: "_ipp._tcp.local.".into(),
            port: 631,
            properties: vec![],
        });

        let result = classify(&host);
        assert_eq!(result.category, DeviceCategory::Printer);
        assert!(result.confidence >= 0.7);
        assert_eq!(result.tier(), ConfidenceTier::High);
        assert_eq!(result.evidence.len(), 2);
    }

    #[test]
    fn test_closed_ports_carry_no_weight() {
        let mut host = record();
        host.ports.push(PortInfo {
            port: 9100,
            state: PortState::Closed,
            service: None,
            banner: None,
            tls_cert: None,
        });
        let result = classify(&host);
        assert_eq!(result.category, DeviceCategory::Unknown);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_strict_tie_is_unknown() {
        let mut host = record();
        // One printer port and one camera port, equal weight each.
        host.ports.push(open_port(9100));
        host.ports.push(open_port(554));
        let result = classify(&host);
        assert_eq!(result.category, DeviceCategory::Unknown);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_router_from_ssdp_gateway() {
        let mut host = record();
        host.ssdp_device = Some(SsdpDeviceInfo {
            device_type: Some("urn:schemas-upnp-org:device:InternetGatewayDevice:1".into()),
            server: None,
            location: None,
            usn: None,
        });
        let result = classify(&host);
        assert_eq!(result.category, DeviceCategory::Router);
        assert_eq!(result.tier(), ConfidenceTier::Medium);
    }

    #[test]
    fn test_nas_from_vendor_and_port() {
        let mut host = record();
        host.vendor = Some("Synology".into());
        host.ports.push(open_port(5000));
        let result = classify(&host);
        assert_eq!(result.category, DeviceCategory::Nas);
        assert!(result.confidence >= 0.7);
    }

    #[test]
    fn test_hostname_only_is_low_confidence() {
        let mut host = record();
        host.hostname = Some("johns-iphone".into());
        let result = classify(&host);
        assert_eq!(result.category, DeviceCategory::Mobile);
        assert_eq!(result.tier(), ConfidenceTier::Low);
    }

    #[test]
    fn test_confidence_is_capped_at_one() {
        let mut host = record();
        host.ports.push(open_port(515));
        host.ports.push(open_port(631));
        host.ports.push(open_port(9100));
        let result = classify(&host);
        assert_eq!(result.category, DeviceCategory::Printer);
        assert_eq!(result.confidence, 1.0);
    }
}
