//! Runs a set of probe drivers concurrently against one target list.
//!
//! Drivers execute in two phases: everything except the ARP cache first,
//! then the ARP cache after a short settle delay. Packets sent in phase
//! one populate the OS ARP table that phase two reads, so the ordering
//! materially improves MAC coverage.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::{debug, info};

use crate::cancel::CancelState;
use crate::network::local_ip_addresses;
use crate::probe::{driver_for, EventSink, ProbeOptions};
use crate::types::{DiscoveryEvent, DiscoveryMethod};

const ARP_CACHE_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Flush window granted to in-flight drivers once the run deadline passes.
const RUN_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// Execute all requested discovery methods against `targets`, streaming
/// events into `sink`. Returns once every driver finished or the session
/// was cancelled; events already emitted always stand.
pub async fn run_discovery(
    targets: &[IpAddr],
    methods: &[DiscoveryMethod],
    options: &ProbeOptions,
    sink: &EventSink,
    cancel: &CancelState,
) {
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + options.run_deadline;
    info!(
        targets = targets.len(),
        methods = methods.len(),
        "discovery session starting"
    );

    // This machine's own addresses never answer probes reliably, so
    // mark any of them inside the target range alive up front.
    let local_ips = local_ip_addresses();
    for &ip in targets.iter().filter(|ip| local_ips.contains(ip)) {
        sink.emit(DiscoveryEvent::alive(DiscoveryMethod::Local, ip, started))
            .await;
    }

    let phase1: Vec<DiscoveryMethod> = methods
        .iter()
        .filter(|m| !matches!(m, DiscoveryMethod::ArpCache | DiscoveryMethod::Local))
        .copied()
        .collect();
    let wants_arp_cache = methods.contains(&DiscoveryMethod::ArpCache);

    run_phase(&phase1, targets, options, sink, cancel, deadline).await;

    if cancel.is_cancelled() {
        info!("discovery stopped after phase one");
        return;
    }

    if wants_arp_cache {
        tokio::time::sleep(ARP_CACHE_SETTLE_DELAY).await;
        run_phase(
            &[DiscoveryMethod::ArpCache],
            targets,
            options,
            sink,
            cancel,
            deadline,
        )
        .await;
    }

    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "discovery session done"
    );
}

/// Run one batch of drivers concurrently, returning when all complete,
/// cancellation trips between completions, or the run deadline passes.
/// Hitting the deadline trips the shared cancel flag so drivers skip
/// probes they have not dispatched yet, then in-flight work gets
/// `RUN_FLUSH_GRACE` to emit what it already has.
async fn run_phase(
    methods: &[DiscoveryMethod],
    targets: &[IpAddr],
    options: &ProbeOptions,
    sink: &EventSink,
    cancel: &CancelState,
    deadline: tokio::time::Instant,
) {
    if methods.is_empty() {
        return;
    }

    let mut cancel_rx = cancel.subscribe();
    let mut futs: FuturesUnordered<_> = methods
        .iter()
        .filter_map(|&method| driver_for(method))
        .map(|driver| {
            let method = driver.method();
            async move {
                debug!(%method, "driver starting");
                driver.probe(targets, options, sink, cancel).await;
                method
            }
        })
        .collect();

    loop {
        tokio::select! {
            completed = futs.next() => {
                match completed {
                    Some(method) => debug!(%method, "driver finished"),
                    None => break,
                }
            }
            _ = cancel_rx.recv() => {
                // Drivers watch the same flag and wind down on their
                // own; dropping the stream stops awaiting them here.
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!("run deadline reached, flushing in-flight probes");
                cancel.cancel();
                flush_remaining(&mut futs).await;
                break;
            }
        }
        if cancel.is_cancelled() {
            break;
        }
    }
}

/// Drain driver completions for up to the flush grace, then give up.
async fn flush_remaining<S>(futs: &mut S)
where
    S: futures::Stream<Item = DiscoveryMethod> + Unpin,
{
    let flush = tokio::time::sleep(RUN_FLUSH_GRACE);
    tokio::pin!(flush);
    loop {
        tokio::select! {
            completed = futs.next() => {
                match completed {
                    Some(method) => debug!(%method, "driver flushed"),
                    None => break,
                }
            }
            _ = &mut flush => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_empty_method_list_completes_immediately() {
        let (tx, mut rx) = mpsc::channel(16);
        let sink = EventSink::new(tx);
        let cancel = CancelState::new();
        run_discovery(
            &[IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))],
            &[],
            &ProbeOptions::default(),
            &sink,
            &cancel,
        )
        .await;
        drop(sink);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_session_returns_without_probing() {
        let (tx, mut rx) = mpsc::channel(16);
        let sink = EventSink::new(tx);
        let cancel = CancelState::new();
        cancel.cancel();

        let start = Instant::now();
        run_discovery(
            &[IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))],
            &[DiscoveryMethod::ArpCache],
            &ProbeOptions::default(),
            &sink,
            &cancel,
        )
        .await;
        // Phase two must not run after cancellation
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(sink);
        while let Some(event) = rx.recv().await {
            assert_eq!(event.method, DiscoveryMethod::Local);
        }
    }

    #[tokio::test]
    async fn test_run_deadline_stops_long_probes() {
        let (tx, _rx) = mpsc::channel(64);
        let sink = EventSink::new(tx);
        let cancel = CancelState::new();
        let options = ProbeOptions {
            timeout: Duration::from_secs(5),
            run_deadline: Duration::from_millis(100),
            ..Default::default()
        };
        // SSDP always drains responses for the full five second search
        // window, so only the run deadline can end this session early.
        let targets = vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))];

        let start = Instant::now();
        run_discovery(&targets, &[DiscoveryMethod::Ssdp], &options, &sink, &cancel).await;

        // 100ms deadline plus the flush grace, with slack for CI
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(cancel.is_cancelled());
    }
}
