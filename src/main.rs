mod cli;
mod output;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use netlens::engine::Engine;
use netlens::network;
use netlens::portscan::{self, ScanOptions, QUICK_SCAN_PORTS};
use netlens::probe::ProbeOptions;

use crate::cli::{Cli, Command, OutputFormat};
use crate::output::OutputWriter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "netlens=debug" } else { "netlens=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with_writer(std::io::stderr)
        .init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let writer = OutputWriter::new(cli.output_format, cli.output_file.clone());
    // Progress bars only make sense on an interactive human terminal
    let interactive = interactive_output(&cli);
    let engine = Arc::new(Engine::new());

    match cli.command {
        Command::Discover {
            targets,
            methods,
            timeout,
            concurrency,
        } => {
            let target_spec = match targets.or_else(network::default_network_cidr) {
                Some(spec) => spec,
                None => return Err(anyhow!("no targets given and no local network detected")),
            };
            let targets = network::parse_targets(&target_spec)?;
            let methods = methods.unwrap_or_else(cli::default_methods);
            let options = ProbeOptions {
                timeout: Duration::from_millis(timeout),
                concurrency,
                ..Default::default()
            };

            let mut session = engine.start_discovery(targets, methods, options)?;
            install_cancel_handler(Arc::clone(&engine), session.id);

            let progress = event_spinner(interactive, format!("discovering {target_spec}"));
            let mut events_seen = 0u64;
            while let Some(event) = session.events.recv().await {
                events_seen += 1;
                if let Some(pb) = &progress {
                    pb.set_message(format!(
                        "{} events, last: {} {}",
                        events_seen, event.method, event.target_ip
                    ));
                    pb.tick();
                }
            }
            if let Some(pb) = &progress {
                pb.finish_and_clear();
            }

            let table = session.result.await?;
            writer.write_discovery(&table)?;
        }
        Command::Scan {
            host,
            ports,
            timeout,
            concurrency,
        } => {
            let host_ip = resolve_host(&host)?;
            let ports = match ports {
                Some(spec) => portscan::parse_port_range(&spec)?,
                None => QUICK_SCAN_PORTS.to_vec(),
            };
            let total = ports.len() as u64;
            let options = ScanOptions {
                timeout: Duration::from_millis(timeout),
                concurrency,
            };

            let mut session = engine.scan_ports(host_ip, ports, options)?;
            install_cancel_handler(Arc::clone(&engine), session.id);

            let progress = port_progress_bar(interactive, total);
            while session.ports.recv().await.is_some() {
                if let Some(pb) = &progress {
                    pb.inc(1);
                }
            }
            if let Some(pb) = &progress {
                pb.finish_and_clear();
            }

            let results = session.result.await?;
            writer.write_portscan(host_ip, &results)?;
        }
        Command::Methods => {
            let methods = engine.available_methods().await;
            writer.write_methods(&methods)?;
        }
    }

    Ok(())
}

/// First Ctrl-C cancels the session so partial results still print; a
/// second one falls through to the default abort.
fn install_cancel_handler(engine: Arc<Engine>, session_id: u64) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "cancelling, printing partial results...".yellow());
            engine.cancel(session_id);
        }
    });
}

fn resolve_host(host: &str) -> Result<IpAddr> {
    let targets = network::parse_targets(host)?;
    match targets.as_slice() {
        [single] => Ok(*single),
        _ => Err(anyhow!("scan takes a single host, got {} addresses", targets.len())),
    }
}

fn interactive_output(cli: &Cli) -> bool {
    cli.output_format == OutputFormat::Human && cli.output_file.is_none()
}

fn event_spinner(interactive: bool, message: String) -> Option<ProgressBar> {
    if !interactive {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {prefix} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

fn port_progress_bar(interactive: bool, total: u64) -> Option<ProgressBar> {
    if !interactive {
        return None;
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{bar:30.green} {pos}/{len} ports")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    Some(pb)
}
