//! OS ARP/neighbor cache reading. No privileges required.
//!
//! Most useful after other probes have run: their packets populate the
//! OS ARP table, so this driver picks up MACs for hosts that ignored
//! direct probing.

use std::net::IpAddr;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::{EventSink, ProbeDriver, ProbeOptions};
use crate::cancel::CancelState;
use crate::oui;
use crate::types::{DiscoveryEvent, DiscoveryMethod};

/// One entry from the system ARP/neighbor cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpCacheEntry {
    pub ip: String,
    pub mac: String,
    pub interface: Option<String>,
}

pub struct ArpCacheDriver;

#[async_trait]
impl ProbeDriver for ArpCacheDriver {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::ArpCache
    }

    async fn probe(
        &self,
        targets: &[IpAddr],
        _options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    ) {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return;
        }

        let entries = tokio::task::spawn_blocking(read_arp_cache)
            .await
            .unwrap_or_default();
        debug!(entries = entries.len(), "read system arp cache");

        for entry in entries {
            let Ok(ip) = entry.ip.parse::<IpAddr>() else {
                continue;
            };
            if !targets.contains(&ip) {
                continue;
            }
            let Some(mac) = oui::normalize_mac(&entry.mac) else {
                continue;
            };
            let mut event = DiscoveryEvent::alive(DiscoveryMethod::ArpCache, ip, started);
            event.mac = Some(mac);
            sink.emit(event).await;
        }
    }
}

/// Read the system ARP cache.
///
/// Platform-specific:
/// - Linux: parses `/proc/net/arp`
/// - macOS: parses `arp -an` output
/// - Windows: parses `arp -a` output
pub fn read_arp_cache() -> Vec<ArpCacheEntry> {
    #[cfg(target_os = "linux")]
    {
        read_arp_cache_linux()
    }
    #[cfg(target_os = "macos")]
    {
        read_arp_cache_macos()
    }
    #[cfg(target_os = "windows")]
    {
        read_arp_cache_windows()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Vec::new()
    }
}

fn is_incomplete_mac(mac: &str) -> bool {
    mac.is_empty()
        || mac == "(incomplete)"
        || mac.eq_ignore_ascii_case("ff:ff:ff:ff:ff:ff")
        || mac == "00:00:00:00:00:00"
}

#[cfg(target_os = "linux")]
fn read_arp_cache_linux() -> Vec<ArpCacheEntry> {
    match std::fs::read_to_string("/proc/net/arp") {
        Ok(content) => parse_arp_linux(&content),
        Err(_) => Vec::new(),
    }
}

/// Parse `/proc/net/arp`.
/// Format: `IP address  HW type  Flags  HW address  Mask  Device`
fn parse_arp_linux(content: &str) -> Vec<ArpCacheEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                return None;
            }
            let mac = parts[3];
            if is_incomplete_mac(mac) {
                return None;
            }
            Some(ArpCacheEntry {
                ip: parts[0].to_string(),
                mac: mac.to_string(),
                interface: Some(parts[5].to_string()),
            })
        })
        .collect()
}

#[cfg(target_os = "macos")]
fn read_arp_cache_macos() -> Vec<ArpCacheEntry> {
    let output = match std::process::Command::new("arp").arg("-an").output() {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };
    parse_arp_macos(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `arp -an` output.
/// Format: `? (192.168.1.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]`
fn parse_arp_macos(output: &str) -> Vec<ArpCacheEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let ip_start = line.find('(')? + 1;
            let ip_end = line.find(')')?;
            let ip = &line[ip_start..ip_end];

            let at_idx = line.find(" at ")? + 4;
            let after_at = &line[at_idx..];
            let mac_end = after_at.find(' ').unwrap_or(after_at.len());
            let mac = &after_at[..mac_end];
            if is_incomplete_mac(mac) {
                return None;
            }

            let interface = line.find(" on ").map(|idx| {
                let after_on = &line[idx + 4..];
                let end = after_on.find(' ').unwrap_or(after_on.len());
                after_on[..end].to_string()
            });

            Some(ArpCacheEntry {
                ip: ip.to_string(),
                mac: mac.to_string(),
                interface,
            })
        })
        .collect()
}

#[cfg(target_os = "windows")]
fn read_arp_cache_windows() -> Vec<ArpCacheEntry> {
    let output = match std::process::Command::new("arp").arg("-a").output() {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };
    parse_arp_windows(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `arp -a` output. Entries are grouped under `Interface:` headers
/// and use dash-separated MACs.
fn parse_arp_windows(output: &str) -> Vec<ArpCacheEntry> {
    let mut entries = Vec::new();
    let mut current_interface: Option<String> = None;

    for line in output.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("Interface:") {
            current_interface = trimmed.split_whitespace().nth(1).map(String::from);
            continue;
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let ip = parts[0];
        if ip == "Internet" || ip == "Address" {
            continue;
        }
        let mac = parts[1].replace('-', ":");
        if is_incomplete_mac(&mac) {
            continue;
        }

        entries.push(ArpCacheEntry {
            ip: ip.to_string(),
            mac,
            interface: current_interface.clone(),
        });
    }

    entries
}
