//! MAC address formatting and OUI vendor lookup.
//!
//! The table covers vendors commonly seen on home and office networks.
//! Lookup is by the first three octets (the IEEE-assigned OUI prefix).

use std::collections::HashMap;

use lazy_static::lazy_static;

lazy_static! {
    static ref OUI_VENDORS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        // Network equipment
        m.insert("00:11:32", "Synology");
        m.insert("00:1B:A9", "Brother Industries");
        m.insert("00:1E:8F", "Canon");
        m.insert("00:21:5A", "Hewlett Packard");
        m.insert("00:23:24", "G-PRO Computer");
        m.insert("00:26:73", "Ricoh");
        m.insert("00:80:92", "Silex Technology");
        m.insert("3C:2A:F4", "Brother Industries");
        m.insert("9C:93:4E", "Xerox");
        m.insert("F4:81:39", "Canon");
        m.insert("FC:3F:DB", "Hewlett Packard");
        // Routers and access points
        m.insert("00:05:5D", "D-Link");
        m.insert("00:09:5B", "Netgear");
        m.insert("00:0F:66", "Cisco-Linksys");
        m.insert("00:14:BF", "Cisco-Linksys");
        m.insert("00:18:4D", "Netgear");
        m.insert("00:1D:7E", "Cisco-Linksys");
        m.insert("14:91:82", "Belkin");
        m.insert("24:A4:3C", "Ubiquiti");
        m.insert("44:D9:E7", "Ubiquiti");
        m.insert("50:C7:BF", "TP-Link");
        m.insert("60:38:E0", "Belkin");
        m.insert("74:AC:B9", "Ubiquiti");
        m.insert("78:8A:20", "Ubiquiti");
        m.insert("98:DA:C4", "TP-Link");
        m.insert("A4:2B:B0", "TP-Link");
        m.insert("B0:4E:26", "TP-Link");
        m.insert("B0:B9:8A", "Netgear");
        m.insert("C0:25:E9", "TP-Link");
        m.insert("E8:DE:27", "TP-Link");
        m.insert("F0:9F:C2", "Ubiquiti");
        m.insert("FC:EC:DA", "Ubiquiti");
        // Computers and phones
        m.insert("00:03:93", "Apple");
        m.insert("00:0A:95", "Apple");
        m.insert("00:16:CB", "Apple");
        m.insert("00:1E:C2", "Apple");
        m.insert("00:25:00", "Apple");
        m.insert("3C:06:30", "Apple");
        m.insert("68:96:7B", "Apple");
        m.insert("A4:83:E7", "Apple");
        m.insert("A8:20:66", "Apple");
        m.insert("BC:D0:74", "Apple");
        m.insert("F0:18:98", "Apple");
        m.insert("F4:5C:89", "Apple");
        m.insert("00:12:FB", "Samsung");
        m.insert("00:16:32", "Samsung");
        m.insert("08:D4:2B", "Samsung");
        m.insert("5C:0A:5B", "Samsung");
        m.insert("8C:77:12", "Samsung");
        m.insert("00:15:5D", "Microsoft (Hyper-V)");
        m.insert("00:50:F2", "Microsoft");
        m.insert("28:18:78", "Microsoft");
        m.insert("00:1A:A0", "Dell");
        m.insert("14:FE:B5", "Dell");
        m.insert("18:A9:9B", "Dell");
        m.insert("B8:CA:3A", "Dell");
        m.insert("00:21:CC", "Flextronics (Lenovo)");
        m.insert("54:EE:75", "Wistron (Lenovo)");
        m.insert("8C:16:45", "LCFC (Lenovo)");
        m.insert("00:23:AE", "Dell");
        m.insert("3C:52:82", "Hewlett Packard");
        m.insert("94:57:A5", "Hewlett Packard");
        // Virtualization
        m.insert("00:05:69", "VMware");
        m.insert("00:0C:29", "VMware");
        m.insert("00:1C:14", "VMware");
        m.insert("00:50:56", "VMware");
        m.insert("08:00:27", "Oracle VirtualBox");
        m.insert("52:54:00", "QEMU/KVM");
        // Single-board and embedded
        m.insert("B8:27:EB", "Raspberry Pi Foundation");
        m.insert("DC:A6:32", "Raspberry Pi Trading");
        m.insert("E4:5F:01", "Raspberry Pi Trading");
        m.insert("28:CD:C1", "Raspberry Pi Trading");
        m.insert("24:0A:C4", "Espressif");
        m.insert("30:AE:A4", "Espressif");
        m.insert("84:CC:A8", "Espressif");
        m.insert("A4:CF:12", "Espressif");
        m.insert("EC:FA:BC", "Espressif");
        // Media and smart home
        m.insert("00:04:20", "Slim Devices (Logitech)");
        m.insert("00:0E:58", "Sonos");
        m.insert("34:7E:5C", "Sonos");
        m.insert("5C:AA:FD", "Sonos");
        m.insert("94:9F:3E", "Sonos");
        m.insert("08:05:81", "Roku");
        m.insert("AC:3A:7A", "Roku");
        m.insert("B0:A7:37", "Roku");
        m.insert("D8:31:34", "Roku");
        m.insert("18:B4:30", "Nest Labs");
        m.insert("64:16:66", "Nest Labs");
        m.insert("00:17:88", "Philips Lighting (Hue)");
        m.insert("EC:B5:FA", "Philips Lighting (Hue)");
        m.insert("44:65:0D", "Amazon Technologies");
        m.insert("68:37:E9", "Amazon Technologies");
        m.insert("74:C2:46", "Amazon Technologies");
        m.insert("FC:65:DE", "Amazon Technologies");
        m.insert("54:60:09", "Google");
        m.insert("94:EB:2C", "Google");
        m.insert("F4:F5:D8", "Google");
        m.insert("F8:8F:CA", "Google");
        // NAS
        m.insert("00:08:9B", "ICP Internet (QNAP)");
        m.insert("00:1B:FC", "ASUSTeK");
        m.insert("24:5E:BE", "QNAP Systems");
        m.insert("00:90:A9", "Western Digital");
        m.insert("00:24:8C", "ASUSTeK");
        m.insert("90:09:D0", "Synology");
        m.insert("00:C0:02", "Seagate (Sercomm)");
        // Cameras
        m.insert("00:40:8C", "Axis Communications");
        m.insert("AC:CC:8E", "Axis Communications");
        m.insert("44:19:B6", "Hangzhou Hikvision");
        m.insert("C0:56:E3", "Hangzhou Hikvision");
        m.insert("9C:8E:CD", "Amcrest Technologies");
        m.insert("A0:BD:1D", "Zhejiang Dahua");
        m.insert("E0:50:8B", "Zhejiang Dahua");
        m
    };
}

/// Format a raw MAC as colon-separated uppercase hex.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Normalize a MAC string to colon-separated uppercase hex, if well-formed.
/// Accepts `:` or `-` separators and any case.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let parts: Vec<&str> = mac.split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(format_mac(&bytes))
}

/// Look up the vendor for a normalized MAC address.
pub fn lookup_vendor(mac: &str) -> Option<&'static str> {
    if mac.len() < 8 {
        return None;
    }
    let prefix = mac[..8].to_uppercase();
    OUI_VENDORS.get(prefix.as_str()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0xb8, 0x27, 0xeb, 0x01, 0x02, 0x03]),
            "B8:27:EB:01:02:03"
        );
    }

    #[test]
    fn test_normalize_mac_accepts_dashes_and_lowercase() {
        assert_eq!(
            normalize_mac("b8-27-eb-aa-bb-cc").as_deref(),
            Some("B8:27:EB:AA:BB:CC")
        );
        assert_eq!(normalize_mac("not a mac"), None);
        assert_eq!(normalize_mac("b8:27:eb:aa:bb"), None);
    }

    #[test]
    fn test_lookup_vendor() {
        assert_eq!(
            lookup_vendor("B8:27:EB:01:02:03"),
            Some("Raspberry Pi Foundation")
        );
        assert_eq!(lookup_vendor("b8:27:eb:01:02:03"), Some("Raspberry Pi Foundation"));
        assert_eq!(lookup_vendor("FF:FF:FF:00:00:00"), None);
        assert_eq!(lookup_vendor("short"), None);
    }
}
