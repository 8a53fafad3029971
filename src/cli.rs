use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use netlens::types::DiscoveryMethod;

#[derive(Parser, Debug)]
#[command(name = "netlens")]
#[command(version = "0.1.0")]
#[command(about = "Local network discovery, port scanning, and device classification", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short = 'o', long, value_enum, default_value = "human", global = true, help = "Output format")]
    pub output_format: OutputFormat,

    #[arg(short = 'f', long, global = true, help = "Output file path")]
    pub output_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover live hosts on the network
    Discover {
        #[arg(help = "Targets: IP, hostname, CIDR (192.168.1.0/24), range (192.168.1.1-192.168.1.50), or a comma list. Defaults to the local /24.")]
        targets: Option<String>,

        #[arg(short, long, value_delimiter = ',', help = "Discovery methods to run (default: every method available without privileges)")]
        methods: Option<Vec<DiscoveryMethod>>,

        #[arg(long, default_value_t = 1000, help = "Per-host probe timeout in milliseconds")]
        timeout: u64,

        #[arg(long, default_value_t = 100, help = "Maximum concurrent probes per method")]
        concurrency: usize,
    },
    /// Scan TCP ports on a single host
    Scan {
        #[arg(help = "Host IP address or hostname")]
        host: String,

        #[arg(short, long, help = "Ports: 80, 1-1024, 22,80,443, or mixed. Defaults to a quick common-port set.")]
        ports: Option<String>,

        #[arg(long, default_value_t = 1000, help = "Connect timeout per port in milliseconds")]
        timeout: u64,

        #[arg(long, default_value_t = 100, help = "Maximum concurrent connection attempts")]
        concurrency: usize,
    },
    /// List discovery methods and whether this process can run them
    Methods,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum OutputFormat {
    #[value(name = "human", help = "Human-readable output")]
    Human,
    #[value(name = "json", help = "JSON output")]
    Json,
}

/// Methods run when none are requested. Raw-socket methods stay out so
/// the default works without root.
pub fn default_methods() -> Vec<DiscoveryMethod> {
    vec![
        DiscoveryMethod::IcmpPing,
        DiscoveryMethod::Icmpv6Ping,
        DiscoveryMethod::TcpConnect,
        DiscoveryMethod::Mdns,
        DiscoveryMethod::Ssdp,
        DiscoveryMethod::WsDiscovery,
        DiscoveryMethod::UdpProbe,
        DiscoveryMethod::Llmnr,
        DiscoveryMethod::ArpCache,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_parses_methods_list() {
        let cli = Cli::parse_from([
            "netlens",
            "discover",
            "192.168.1.0/24",
            "--methods",
            "icmp_ping,mdns",
        ]);
        match cli.command {
            Command::Discover { methods, .. } => {
                assert_eq!(
                    methods.unwrap(),
                    vec![DiscoveryMethod::IcmpPing, DiscoveryMethod::Mdns]
                );
            }
            _ => panic!("expected discover subcommand"),
        }
    }

    #[test]
    fn test_scan_defaults() {
        let cli = Cli::parse_from(["netlens", "scan", "192.168.1.10"]);
        match cli.command {
            Command::Scan {
                host,
                ports,
                timeout,
                concurrency,
            } => {
                assert_eq!(host, "192.168.1.10");
                assert!(ports.is_none());
                assert_eq!(timeout, 1000);
                assert_eq!(concurrency, 100);
            }
            _ => panic!("expected scan subcommand"),
        }
    }

    #[test]
    fn test_rejects_unknown_method() {
        assert!(
            Cli::try_parse_from(["netlens", "discover", "--methods", "warp_drive"]).is_err()
        );
    }
}
