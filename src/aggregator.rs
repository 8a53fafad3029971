//! Event aggregation into canonical host records.
//!
//! The aggregator owns the host table outright. Probe drivers only ever
//! emit events; every merge, dedup, and classification decision happens
//! here, on one task, so no record is written concurrently.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::classify;
use crate::oui;
use crate::types::{DiscoveryEvent, DiscoveryMethod, HostRecord, PortInfo};

/// Merged view of a discovery session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostTable {
    pub records: Vec<HostRecord>,
    /// Failed probe events. These never create or mutate a record.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failures: Vec<DiscoveryEvent>,
    /// Delivery keys already applied, making redelivery a no-op
    #[serde(skip)]
    seen: HashSet<(DiscoveryMethod, IpAddr, DateTime<Utc>)>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the table.
    pub fn apply(&mut self, event: DiscoveryEvent) {
        if event.error.is_some() {
            self.failures.push(event);
            return;
        }
        if !self.seen.insert(event.dedup_key()) {
            return;
        }

        let idx = self.resolve_record(&event);
        let record = &mut self.records[idx];

        if !record.ips.contains(&event.target_ip) {
            record.ips.push(event.target_ip);
        }
        if record.mac_address.is_none() {
            record.mac_address = event.mac.clone();
        }
        if record.vendor.is_none() {
            record.vendor = record
                .mac_address
                .as_deref()
                .and_then(oui::lookup_vendor)
                .map(String::from);
        }

        // Last received non-empty hostname wins, regardless of the
        // timestamp the probe stamped on it.
        if let Some(hostname) = event.hostname.as_ref().filter(|h| !h.is_empty()) {
            record.hostname = Some(hostname.clone());
            record.hostname_source = event.hostname_source;
        }

        if let Some(service) = &event.mdns_service {
            let already = record.mdns_services.iter().any(|s| {
                s.instance_name == service.instance_name && s.service_type == service.service_type
            });
            if !already {
                record.mdns_services.push(service.clone());
            }
        }
        if record.ssdp_device.is_none() {
            record.ssdp_device = event.ssdp_device.clone();
        }
        if record.ws_discovery.is_none() {
            record.ws_discovery = event.ws_discovery.clone();
        }
        if record.snmp_info.is_none() {
            record.snmp_info = event.snmp_info.clone();
        }

        record.discovery_methods.insert(event.method);
        record.discoveries.push(event);

        self.reclassify(idx);
    }

    /// Attach port scan results to the record owning `ip`, creating a
    /// bare record when the host was never discovered.
    pub fn set_ports(&mut self, ip: IpAddr, ports: Vec<PortInfo>) {
        let idx = match self.index_by_ip(ip) {
            Some(idx) => idx,
            None => self.push_record(HostRecord::new(ip)),
        };
        self.records[idx].ports = ports;
        self.reclassify(idx);
    }

    pub fn record_for_ip(&self, ip: IpAddr) -> Option<&HostRecord> {
        self.index_by_ip(ip).map(|idx| &self.records[idx])
    }

    /// Find or create the record this event belongs to, merging records
    /// that the event proves are the same physical host. Identity
    /// strength: MAC, then hostname, then IP.
    fn resolve_record(&mut self, event: &DiscoveryEvent) -> usize {
        let by_mac = event
            .mac
            .as_deref()
            .and_then(|mac| self.index_by_mac(mac));
        let by_ip = self.index_by_ip(event.target_ip);
        let by_hostname = event
            .hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .and_then(|name| self.index_by_hostname(name));

        let mut matches: Vec<usize> = [by_mac, by_ip, by_hostname].into_iter().flatten().collect();
        matches.sort_unstable();
        matches.dedup();

        match matches.split_first() {
            None => self.push_record(HostRecord::new(event.target_ip)),
            Some((&primary, rest)) => {
                // Merge weaker matches into the strongest one, back to
                // front so indexes stay valid.
                for &other in rest.iter().rev() {
                    self.merge_records(primary, other);
                }
                primary
            }
        }
    }

    fn push_record(&mut self, record: HostRecord) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    fn index_by_ip(&self, ip: IpAddr) -> Option<usize> {
        self.records.iter().position(|r| r.ips.contains(&ip))
    }

    fn index_by_mac(&self, mac: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.mac_address.as_deref() == Some(mac))
    }

    fn index_by_hostname(&self, hostname: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.hostname.as_deref() == Some(hostname))
    }

    /// Fold record `other` into `keep` and remove it.
    fn merge_records(&mut self, keep: usize, other: usize) {
        let absorbed = self.records.remove(other);
        // Removal shifts indexes above `other` down by one.
        let keep = if keep > other { keep - 1 } else { keep };
        let record = &mut self.records[keep];

        for ip in absorbed.ips {
            if !record.ips.contains(&ip) {
                record.ips.push(ip);
            }
        }
        if record.mac_address.is_none() {
            record.mac_address = absorbed.mac_address;
        }
        if record.vendor.is_none() {
            record.vendor = absorbed.vendor;
        }
        if record.hostname.is_none() {
            record.hostname = absorbed.hostname;
            record.hostname_source = absorbed.hostname_source;
        }
        for service in absorbed.mdns_services {
            let already = record.mdns_services.iter().any(|s| {
                s.instance_name == service.instance_name && s.service_type == service.service_type
            });
            if !already {
                record.mdns_services.push(service);
            }
        }
        if record.ssdp_device.is_none() {
            record.ssdp_device = absorbed.ssdp_device;
        }
        if record.ws_discovery.is_none() {
            record.ws_discovery = absorbed.ws_discovery;
        }
        if record.snmp_info.is_none() {
            record.snmp_info = absorbed.snmp_info;
        }
        if record.ports.is_empty() {
            record.ports = absorbed.ports;
        }
        record.discovery_methods.extend(absorbed.discovery_methods);
        record.discoveries.extend(absorbed.discoveries);
    }

    fn reclassify(&mut self, idx: usize) {
        let record = &mut self.records[idx];
        record.classification = Some(classify::classify(record));
    }
}

/// Drain a session's event channel into a host table. Returns when the
/// channel closes, i.e. when every driver has finished or been dropped.
pub async fn run_aggregator(mut rx: mpsc::Receiver<DiscoveryEvent>) -> HostTable {
    let mut table = HostTable::new();
    while let Some(event) = rx.recv().await {
        table.apply(event);
    }
    debug!(
        hosts = table.records.len(),
        failures = table.failures.len(),
        "aggregation complete"
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::types::HostnameSource;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn event(method: DiscoveryMethod, target: IpAddr) -> DiscoveryEvent {
        DiscoveryEvent::alive(method, target, Instant::now())
    }

    #[test]
    fn test_new_ip_creates_record() {
        let mut table = HostTable::new();
        table.apply(event(DiscoveryMethod::IcmpPing, ip(10)));
        assert_eq!(table.records.len(), 1);
        assert_eq!(table.records[0].primary_ip(), ip(10));
        assert_eq!(table.records[0].discoveries.len(), 1);
    }

    #[test]
    fn test_same_ip_merges_into_one_record() {
        let mut table = HostTable::new();
        table.apply(event(DiscoveryMethod::IcmpPing, ip(10)));
        table.apply(event(DiscoveryMethod::TcpConnect, ip(10)));
        assert_eq!(table.records.len(), 1);
        let record = &table.records[0];
        assert_eq!(record.discoveries.len(), 2);
        assert!(record.discovery_methods.contains(&DiscoveryMethod::IcmpPing));
        assert!(record.discovery_methods.contains(&DiscoveryMethod::TcpConnect));
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut table = HostTable::new();
        let e = event(DiscoveryMethod::IcmpPing, ip(10));
        table.apply(e.clone());
        table.apply(e);
        assert_eq!(table.records.len(), 1);
        assert_eq!(table.records[0].discoveries.len(), 1);
    }

    #[test]
    fn test_mac_joins_ipv4_and_ipv6_records() {
        let mut table = HostTable::new();

        let mut arp = event(DiscoveryMethod::ArpScan, ip(10));
        arp.mac = Some("AA:BB:CC:DD:EE:01".to_string());
        table.apply(arp);

        let v6: IpAddr = "fd00::10".parse().unwrap();
        let mut mdns = event(DiscoveryMethod::Mdns, v6);
        mdns.hostname = Some("printer.local".to_string());
        mdns.hostname_source = Some(HostnameSource::Mdns);
        table.apply(mdns);
        assert_eq!(table.records.len(), 2);

        // Same MAC observed on the IPv6 address proves one host.
        let mut cache = event(DiscoveryMethod::ArpCache, v6);
        cache.mac = Some("AA:BB:CC:DD:EE:01".to_string());
        table.apply(cache);

        assert_eq!(table.records.len(), 1);
        let record = &table.records[0];
        assert_eq!(record.ips.len(), 2);
        assert_eq!(record.primary_ip(), ip(10));
        assert_eq!(record.hostname.as_deref(), Some("printer.local"));
        assert_eq!(record.discoveries.len(), 3);
    }

    #[test]
    fn test_hostname_joins_records() {
        let mut table = HostTable::new();

        let mut a = event(DiscoveryMethod::Mdns, ip(10));
        a.hostname = Some("nas.local".to_string());
        a.hostname_source = Some(HostnameSource::Mdns);
        table.apply(a);

        let v6: IpAddr = "fd00::99".parse().unwrap();
        let mut b = event(DiscoveryMethod::Mdns, v6);
        b.hostname = Some("nas.local".to_string());
        b.hostname_source = Some(HostnameSource::Mdns);
        table.apply(b);

        assert_eq!(table.records.len(), 1);
        assert_eq!(table.records[0].ips, vec![ip(10), v6]);
    }

    #[test]
    fn test_last_received_hostname_wins() {
        let mut table = HostTable::new();

        let mut first = event(DiscoveryMethod::Mdns, ip(10));
        first.hostname = Some("first-seen.local".to_string());
        first.hostname_source = Some(HostnameSource::Mdns);

        // Arrives second, but carries an older timestamp (slow probe,
        // skewed clock). Arrival order decides, not the timestamp.
        let mut second = event(DiscoveryMethod::UdpProbe, ip(10));
        second.hostname = Some("SECOND-SEEN".to_string());
        second.hostname_source = Some(HostnameSource::Netbios);
        second.timestamp = Utc::now() - chrono::Duration::seconds(30);

        table.apply(first);
        table.apply(second);

        let record = &table.records[0];
        assert_eq!(record.hostname.as_deref(), Some("SECOND-SEEN"));
        assert_eq!(record.hostname_source, Some(HostnameSource::Netbios));
    }

    #[test]
    fn test_empty_hostname_never_clears_existing() {
        let mut table = HostTable::new();

        let mut named = event(DiscoveryMethod::Mdns, ip(10));
        named.hostname = Some("keeper.local".to_string());
        named.hostname_source = Some(HostnameSource::Mdns);
        table.apply(named);

        let mut blank = event(DiscoveryMethod::IcmpPing, ip(10));
        blank.hostname = Some(String::new());
        table.apply(blank);

        assert_eq!(table.records[0].hostname.as_deref(), Some("keeper.local"));
    }

    #[test]
    fn test_apply_after_deserialize_does_not_panic() {
        let mut table = HostTable::new();
        let mut named = event(DiscoveryMethod::Mdns, ip(10));
        named.hostname = Some("restored.local".to_string());
        named.hostname_source = Some(HostnameSource::Mdns);
        table.apply(named);

        let json = serde_json::to_string(&table).unwrap();
        let mut restored: HostTable = serde_json::from_str(&json).unwrap();

        let mut update = event(DiscoveryMethod::UdpProbe, ip(10));
        update.hostname = Some("RENAMED".to_string());
        update.hostname_source = Some(HostnameSource::Netbios);
        restored.apply(update);

        assert_eq!(restored.records.len(), 1);
        assert_eq!(restored.records[0].hostname.as_deref(), Some("RENAMED"));
    }

    #[test]
    fn test_failure_events_never_create_records() {
        let mut table = HostTable::new();
        table.apply(DiscoveryEvent::failure(
            DiscoveryMethod::ArpScan,
            ip(10),
            ProbeError::PermissionDenied("raw socket".into()),
            Instant::now(),
        ));
        assert!(table.records.is_empty());
        assert_eq!(table.failures.len(), 1);
    }

    #[test]
    fn test_methods_set_tracks_discoveries() {
        let mut table = HostTable::new();
        table.apply(event(DiscoveryMethod::IcmpPing, ip(10)));
        table.apply(event(DiscoveryMethod::Ssdp, ip(10)));
        table.apply(event(DiscoveryMethod::IcmpPing, ip(10)));

        let record = &table.records[0];
        let from_events: std::collections::BTreeSet<_> =
            record.discoveries.iter().map(|d| d.method).collect();
        assert_eq!(record.discovery_methods, from_events);
    }

    #[test]
    fn test_vendor_resolved_from_mac() {
        let mut table = HostTable::new();
        let mut e = event(DiscoveryMethod::ArpScan, ip(10));
        e.mac = Some("B8:27:EB:11:22:33".to_string());
        table.apply(e);
        assert_eq!(
            table.records[0].vendor.as_deref(),
            Some("Raspberry Pi Foundation")
        );
    }

    #[test]
    fn test_set_ports_creates_record_when_missing() {
        let mut table = HostTable::new();
        table.set_ports(
            ip(50),
            vec![PortInfo {
                port: 80,
                state: crate::types::PortState::Open,
                service: Some("http".into()),
                banner: None,
                tls_cert: None,
            }],
        );
        assert_eq!(table.records.len(), 1);
        assert_eq!(table.records[0].ports.len(), 1);
        assert!(table.records[0].classification.is_some());
    }

    #[tokio::test]
    async fn test_run_aggregator_drains_channel() {
        let (tx, rx) = mpsc::channel(16);
        tx.send(event(DiscoveryMethod::IcmpPing, ip(10))).await.unwrap();
        tx.send(event(DiscoveryMethod::TcpConnect, ip(11))).await.unwrap();
        drop(tx);
        let table = run_aggregator(rx).await;
        assert_eq!(table.records.len(), 2);
    }
}
