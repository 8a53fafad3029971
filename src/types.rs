//! Data types crossing the engine boundary.
//!
//! Everything here is plain data: the GUI/export layer consumes these
//! records as serialized values and never calls back into the engine
//! through them.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

/// Discovery technique used to find live hosts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    /// ICMP Echo Request (ping)
    #[default]
    IcmpPing,
    /// ICMPv6 Echo Request for IPv6 hosts
    Icmpv6Ping,
    /// ARP request sweep (local network only, raw sockets)
    ArpScan,
    /// OS ARP/neighbor cache reading (no privileges needed)
    ArpCache,
    /// TCP connect scan to common ports
    TcpConnect,
    /// TCP SYN half-open scan (raw sockets)
    TcpSyn,
    /// mDNS/Bonjour service discovery
    Mdns,
    /// SSDP/UPnP multicast discovery
    Ssdp,
    /// WS-Discovery SOAP probe (Windows devices, printers, cameras)
    WsDiscovery,
    /// UDP service probes (NetBIOS name query, SNMP, DNS, NTP)
    UdpProbe,
    /// LLMNR reverse lookup (RFC 4795, mostly Windows hosts)
    Llmnr,
    /// Local interface addresses of this machine (always alive)
    Local,
}

impl std::fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::IcmpPing => "icmp_ping",
            Self::Icmpv6Ping => "icmpv6_ping",
            Self::ArpScan => "arp_scan",
            Self::ArpCache => "arp_cache",
            Self::TcpConnect => "tcp_connect",
            Self::TcpSyn => "tcp_syn",
            Self::Mdns => "mdns",
            Self::Ssdp => "ssdp",
            Self::WsDiscovery => "ws_discovery",
            Self::UdpProbe => "udp_probe",
            Self::Llmnr => "llmnr",
            Self::Local => "local",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for DiscoveryMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "icmp_ping" => Ok(Self::IcmpPing),
            "icmpv6_ping" => Ok(Self::Icmpv6Ping),
            "arp_scan" => Ok(Self::ArpScan),
            "arp_cache" => Ok(Self::ArpCache),
            "tcp_connect" => Ok(Self::TcpConnect),
            "tcp_syn" => Ok(Self::TcpSyn),
            "mdns" => Ok(Self::Mdns),
            "ssdp" => Ok(Self::Ssdp),
            "ws_discovery" => Ok(Self::WsDiscovery),
            "udp_probe" => Ok(Self::UdpProbe),
            "llmnr" => Ok(Self::Llmnr),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown discovery method: {other}")),
        }
    }
}

/// Protocol that produced a hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostnameSource {
    Mdns,
    Netbios,
    Snmp,
    Llmnr,
}

impl std::fmt::Display for HostnameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mdns => write!(f, "mdns"),
            Self::Netbios => write!(f, "netbios"),
            Self::Snmp => write!(f, "snmp"),
            Self::Llmnr => write!(f, "llmnr"),
        }
    }
}

/// mDNS service advertised by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MdnsServiceInfo {
    /// Service instance name
    pub instance_name: String,
    /// Service type (e.g., "_http._tcp")
    pub service_type: String,
    /// Port number
    pub port: u16,
    /// TXT record properties as key-value pairs
    pub properties: Vec<(String, String)>,
}

/// SSDP/UPnP device information parsed from M-SEARCH response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SsdpDeviceInfo {
    /// UPnP device type URN from the ST/USN headers
    /// (e.g., "urn:schemas-upnp-org:device:InternetGatewayDevice:1")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// SERVER header value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// LOCATION header value (device description URL, not fetched)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Unique Service Name header value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usn: Option<String>,
}

/// WS-Discovery ProbeMatch payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WsDiscoveryInfo {
    /// Device types (e.g., "wsdp:Device", "print:PrintDeviceType")
    pub device_types: Vec<String>,
    /// Endpoint URLs for the device
    pub xaddrs: Vec<String>,
    /// URIs describing device capabilities
    pub scopes: Vec<String>,
}

/// SNMP MIB-2 system group values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnmpInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys_descr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys_contact: Option<String>,
}

impl SnmpInfo {
    pub fn is_populated(&self) -> bool {
        self.sys_name.is_some()
            || self.sys_descr.is_some()
            || self.sys_location.is_some()
            || self.sys_contact.is_some()
    }
}

/// Immutable outcome of one probe attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEvent {
    /// Method that produced this event
    pub method: DiscoveryMethod,
    /// Target (or responding) address
    pub target_ip: IpAddr,
    /// MAC address in colon-separated uppercase hex, if observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Hostname, if the protocol carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Protocol that resolved the hostname
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname_source: Option<HostnameSource>,
    /// Wall-clock time the probe resolved
    pub timestamp: DateTime<Utc>,
    /// Time from probe start to resolution
    pub duration_ms: u64,
    /// Probe failure, if any. Events with an error never create host records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeError>,
    /// mDNS service resolved in this probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mdns_service: Option<MdnsServiceInfo>,
    /// SSDP device headers from this probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssdp_device: Option<SsdpDeviceInfo>,
    /// WS-Discovery match from this probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_discovery: Option<WsDiscoveryInfo>,
    /// SNMP system group from this probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snmp_info: Option<SnmpInfo>,
}

impl DiscoveryEvent {
    /// Event for a host that responded to `method`.
    pub fn alive(method: DiscoveryMethod, target_ip: IpAddr, started: Instant) -> Self {
        Self {
            method,
            target_ip,
            mac: None,
            hostname: None,
            hostname_source: None,
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
            mdns_service: None,
            ssdp_device: None,
            ws_discovery: None,
            snmp_info: None,
        }
    }

    /// Event recording a probe failure against `target_ip`.
    pub fn failure(
        method: DiscoveryMethod,
        target_ip: IpAddr,
        error: ProbeError,
        started: Instant,
    ) -> Self {
        let mut event = Self::alive(method, target_ip, started);
        event.error = Some(error);
        event
    }

    /// Identity used for idempotent delivery into a host record.
    pub fn dedup_key(&self) -> (DiscoveryMethod, IpAddr, DateTime<Utc>) {
        (self.method, self.target_ip, self.timestamp)
    }
}

/// State of a scanned TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    /// Accepting connections
    Open,
    /// Actively refused (RST)
    Closed,
    /// No response within timeout; ambiguous with firewalling
    Filtered,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
        }
    }
}

/// TLS certificate metadata extracted from a TLS-capable port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TlsCertInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub subject_alt_names: Vec<String>,
    pub is_self_signed: bool,
}

/// Result for a single scanned port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub port: u16,
    pub state: PortState,
    /// Well-known service name, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Banner grabbed from the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    /// Certificate metadata for TLS ports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<TlsCertInfo>,
}

/// Best-guess device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Router,
    Printer,
    Nas,
    MediaPlayer,
    Camera,
    SmartHome,
    Computer,
    Mobile,
    Unknown,
}

impl std::fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Router => "router",
            Self::Printer => "printer",
            Self::Nas => "nas",
            Self::MediaPlayer => "media_player",
            Self::Camera => "camera",
            Self::SmartHome => "smart_home",
            Self::Computer => "computer",
            Self::Mobile => "mobile",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Advisory confidence tier for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
    Unknown,
}

/// Device classification with supporting evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClassification {
    pub category: DeviceCategory,
    /// Normalized score in [0, 1]; zero iff no evidence rule matched
    pub confidence: f32,
    /// One human-readable string per matched rule
    pub evidence: Vec<String>,
}

impl DeviceClassification {
    pub fn tier(&self) -> ConfidenceTier {
        if self.confidence >= 0.7 {
            ConfidenceTier::High
        } else if self.confidence >= 0.4 {
            ConfidenceTier::Medium
        } else if self.confidence > 0.0 {
            ConfidenceTier::Low
        } else {
            ConfidenceTier::Unknown
        }
    }
}

/// Canonical merged view of one physical host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    /// Addresses in first-seen order; the first is the primary IP
    pub ips: Vec<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname_source: Option<HostnameSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// Always equals the set of methods present in `discoveries`
    pub discovery_methods: BTreeSet<DiscoveryMethod>,
    pub discoveries: Vec<DiscoveryEvent>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub mdns_services: Vec<MdnsServiceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssdp_device: Option<SsdpDeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_discovery: Option<WsDiscoveryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snmp_info: Option<SnmpInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ports: Vec<PortInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<DeviceClassification>,
}

impl HostRecord {
    /// A record is only ever created from an event, so `ips` is never empty.
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ips: vec![ip],
            hostname: None,
            hostname_source: None,
            mac_address: None,
            vendor: None,
            discovery_methods: BTreeSet::new(),
            discoveries: Vec::new(),
            mdns_services: Vec::new(),
            ssdp_device: None,
            ws_discovery: None,
            snmp_info: None,
            ports: Vec::new(),
            classification: None,
        }
    }

    /// First-seen address, stable across merges.
    pub fn primary_ip(&self) -> IpAddr {
        self.ips[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_method_display_names() {
        assert_eq!(DiscoveryMethod::IcmpPing.to_string(), "icmp_ping");
        assert_eq!(DiscoveryMethod::ArpScan.to_string(), "arp_scan");
        assert_eq!(DiscoveryMethod::WsDiscovery.to_string(), "ws_discovery");
    }

    #[test]
    fn test_method_parses_wire_names() {
        assert_eq!(
            "tcp_connect".parse::<DiscoveryMethod>().unwrap(),
            DiscoveryMethod::TcpConnect
        );
        assert_eq!(
            " mdns ".parse::<DiscoveryMethod>().unwrap(),
            DiscoveryMethod::Mdns
        );
        assert!("bogus".parse::<DiscoveryMethod>().is_err());
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = DiscoveryEvent::alive(
            DiscoveryMethod::TcpConnect,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
            Instant::now(),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"targetIp\""));
        assert!(json.contains("\"tcp_connect\""));
        // Empty optional fields are omitted entirely
        assert!(!json.contains("mac"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_failure_event_carries_error() {
        let event = DiscoveryEvent::failure(
            DiscoveryMethod::IcmpPing,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            crate::error::ProbeError::PermissionDenied("raw socket".into()),
            Instant::now(),
        );
        assert!(event.error.is_some());
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("permission_denied"));
    }

    #[test]
    fn test_classification_tiers() {
        let mut c = DeviceClassification {
            category: DeviceCategory::Printer,
            confidence: 0.9,
            evidence: vec![],
        };
        assert_eq!(c.tier(), ConfidenceTier::High);
        c.confidence = 0.5;
        assert_eq!(c.tier(), ConfidenceTier::Medium);
        c.confidence = 0.1;
        assert_eq!(c.tier(), ConfidenceTier::Low);
        c.confidence = 0.0;
        assert_eq!(c.tier(), ConfidenceTier::Unknown);
    }
}
