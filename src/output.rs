use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use colored::*;
use serde_json::json;

use netlens::aggregator::HostTable;
use netlens::types::{ConfidenceTier, DiscoveryMethod, HostRecord, PortInfo, PortState};

use crate::cli::OutputFormat;

pub struct OutputWriter {
    format: OutputFormat,
    file: Option<PathBuf>,
}

impl OutputWriter {
    pub fn new(format: OutputFormat, file: Option<PathBuf>) -> Self {
        Self { format, file }
    }

    pub fn write_discovery(&self, table: &HostTable) -> Result<()> {
        let output = match self.format {
            OutputFormat::Human => format_discovery_human(table),
            OutputFormat::Json => serde_json::to_string_pretty(table)? + "\n",
        };
        self.emit(&output)
    }

    pub fn write_portscan(&self, host: IpAddr, ports: &[PortInfo]) -> Result<()> {
        let output = match self.format {
            OutputFormat::Human => format_portscan_human(host, ports),
            OutputFormat::Json => {
                serde_json::to_string_pretty(&json!({ "host": host, "ports": ports }))? + "\n"
            }
        };
        self.emit(&output)
    }

    pub fn write_methods(&self, methods: &[(DiscoveryMethod, bool)]) -> Result<()> {
        let output = match self.format {
            OutputFormat::Human => {
                let mut out = String::new();
                out.push_str(&format!("\n{}\n\n", "DISCOVERY METHODS".green().bold()));
                for (method, available) in methods {
                    let status = if *available {
                        "available".green()
                    } else {
                        "needs privileges".yellow()
                    };
                    out.push_str(&format!("  {:<14} {}\n", method.to_string().bold(), status));
                }
                out
            }
            OutputFormat::Json => {
                let entries: Vec<_> = methods
                    .iter()
                    .map(|(m, a)| json!({ "method": m, "available": a }))
                    .collect();
                serde_json::to_string_pretty(&entries)? + "\n"
            }
        };
        self.emit(&output)
    }

    fn emit(&self, output: &str) -> Result<()> {
        match &self.file {
            Some(path) => {
                let file = File::create(path)?;
                let mut writer = BufWriter::new(file);
                writer.write_all(output.as_bytes())?;
                writer.flush()?;
            }
            None => {
                print!("{output}");
                io::stdout().flush()?;
            }
        }
        Ok(())
    }
}

fn format_discovery_human(table: &HostTable) -> String {
    let mut output = String::new();

    output.push_str(&format!("\n{}\n\n", "DISCOVERY COMPLETE".green().bold()));
    output.push_str(&format!(
        "{} {}\n\n",
        format!("{} hosts found", table.records.len()).white().bold(),
        if table.failures.is_empty() {
            String::new().normal()
        } else {
            format!("({} probe failures)", table.failures.len()).yellow()
        }
    ));

    for record in &table.records {
        output.push_str(&format_host_human(record));
    }

    if table.records.is_empty() {
        output.push_str(&format!(
            "{} {}\n",
            "⚠".yellow().bold(),
            "No hosts responded".dimmed()
        ));
    }

    if !table.failures.is_empty() {
        output.push_str(&format!("\n{}\n", "Probe failures:".yellow().bold()));
        for failure in &table.failures {
            if let Some(error) = &failure.error {
                output.push_str(&format!(
                    "  {} {}\n",
                    failure.method.to_string().bold(),
                    error.to_string().dimmed()
                ));
            }
        }
    }

    output
}

fn format_host_human(record: &HostRecord) -> String {
    let mut output = String::new();

    let name = record
        .hostname
        .as_deref()
        .map(|h| format!(" ({h})"))
        .unwrap_or_default();
    output.push_str(&format!(
        "{} {}{}\n",
        "▶".green().bold(),
        record.primary_ip().to_string().white().bold(),
        name.cyan()
    ));

    for ip in record.ips.iter().skip(1) {
        output.push_str(&format!("    also {}\n", ip.to_string().dimmed()));
    }

    if let Some(mac) = &record.mac_address {
        let vendor = record
            .vendor
            .as_deref()
            .map(|v| format!(" [{v}]"))
            .unwrap_or_default();
        output.push_str(&format!("    {}{}\n", mac.dimmed(), vendor.dimmed()));
    }

    let methods: Vec<String> = record
        .discovery_methods
        .iter()
        .map(ToString::to_string)
        .collect();
    output.push_str(&format!("    seen via {}\n", methods.join(", ").dimmed()));

    if let Some(classification) = &record.classification {
        if classification.tier() != ConfidenceTier::Unknown {
            output.push_str(&format!(
                "    {} {} ({:.0}%)\n",
                "type".dimmed(),
                classification.category.to_string().magenta().bold(),
                classification.confidence * 100.0
            ));
        }
    }

    for port in record.ports.iter().filter(|p| p.state == PortState::Open) {
        let service = port.service.as_deref().unwrap_or("unknown");
        let banner = port
            .banner
            .as_deref()
            .map(|b| format!("  {b}"))
            .unwrap_or_default();
        output.push_str(&format!(
            "    {} {} {}{}\n",
            port.port.to_string().white().bold(),
            "open".green(),
            service.dimmed(),
            banner.dimmed()
        ));
    }

    output.push('\n');
    output
}

fn format_portscan_human(host: IpAddr, ports: &[PortInfo]) -> String {
    let mut output = String::new();

    let open: Vec<&PortInfo> = ports.iter().filter(|p| p.state == PortState::Open).collect();
    let filtered = ports
        .iter()
        .filter(|p| p.state == PortState::Filtered)
        .count();

    output.push_str(&format!(
        "\n{} {} {} {}{}\n\n",
        "▶".green().bold(),
        host.to_string().white().bold(),
        "•".dimmed(),
        format!("{} open ports", open.len()).cyan().bold(),
        if filtered > 0 {
            format!(" • {filtered} filtered").yellow().to_string()
        } else {
            String::new()
        }
    ));

    for port in &open {
        let service = port.service.as_deref().unwrap_or("unknown");
        output.push_str(&format!(
            "  {} {} {} {}\n",
            port.port.to_string().white().bold(),
            "●".green(),
            "open".green(),
            service.dimmed()
        ));
        if let Some(banner) = &port.banner {
            output.push_str(&format!("      {}\n", banner.dimmed()));
        }
        if let Some(cert) = &port.tls_cert {
            let cn = cert.common_name.as_deref().unwrap_or("-");
            let issuer = cert.issuer.as_deref().unwrap_or("-");
            let self_signed = if cert.is_self_signed {
                " (self-signed)".yellow().to_string()
            } else {
                String::new()
            };
            output.push_str(&format!(
                "      {} CN={cn} issuer={issuer}{self_signed}\n",
                "tls".dimmed()
            ));
        }
    }

    if open.is_empty() {
        output.push_str(&format!(
            "{} {}\n",
            "⚠".yellow().bold(),
            "No open ports detected".dimmed()
        ));
    }

    output
}
