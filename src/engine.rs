//! Session-oriented command surface.
//!
//! Everything a frontend needs lives behind `Engine`: start a discovery
//! run, start a port scan, classify a record, cancel a session. Each
//! session gets a live stream plus a join handle for the final result,
//! and cancellation is cooperative and idempotent.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::aggregator::HostTable;
use crate::cancel::CancelState;
use crate::classify;
use crate::error::SetupError;
use crate::orchestrator;
use crate::portscan::{self, ScanOptions};
use crate::probe::{self, EventSink, ProbeOptions};
use crate::types::{
    DeviceClassification, DiscoveryEvent, DiscoveryMethod, HostRecord, PortInfo,
};

/// Buffer size for session event streams. Backpressure here slows the
/// drivers rather than dropping events.
const SESSION_CHANNEL_CAPACITY: usize = 256;

/// A running discovery session.
pub struct DiscoverySession {
    pub id: u64,
    /// Live event stream, mirroring everything the aggregator sees.
    pub events: mpsc::Receiver<DiscoveryEvent>,
    /// Resolves to the merged host table once all drivers finish.
    pub result: JoinHandle<HostTable>,
}

/// A running port scan session.
pub struct PortScanSession {
    pub id: u64,
    /// Per-port results as they complete, in completion order.
    pub ports: mpsc::Receiver<PortInfo>,
    pub result: JoinHandle<Vec<PortInfo>>,
}

#[derive(Default)]
pub struct Engine {
    sessions: Arc<Mutex<HashMap<u64, Arc<CancelState>>>>,
    next_id: AtomicU64,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch a discovery run over `targets` with the given methods.
    pub fn start_discovery(
        &self,
        targets: Vec<IpAddr>,
        methods: Vec<DiscoveryMethod>,
        options: ProbeOptions,
    ) -> Result<DiscoverySession, SetupError> {
        if targets.is_empty() {
            return Err(SetupError::NoTargets);
        }
        if methods.is_empty() {
            return Err(SetupError::NoMethods);
        }

        let id = self.register_session();
        let cancel = self.session_cancel(id);
        let sessions = Arc::clone(&self.sessions);

        let (event_tx, event_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (live_tx, live_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);

        info!(session = id, targets = targets.len(), "discovery session registered");

        let driver_cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            let sink = EventSink::new(event_tx);
            orchestrator::run_discovery(&targets, &methods, &options, &sink, &driver_cancel).await;
            // Sink drops here, closing the channel and ending aggregation.
        });

        let result = tokio::spawn(async move {
            let mut rx = event_rx;
            let mut table = HostTable::new();
            while let Some(event) = rx.recv().await {
                // A gone live consumer must not stall aggregation.
                let _ = live_tx.try_send(event.clone());
                table.apply(event);
            }
            sessions.lock().expect("session registry poisoned").remove(&id);
            table
        });

        Ok(DiscoverySession {
            id,
            events: live_rx,
            result,
        })
    }

    /// Launch a port scan of one host.
    pub fn scan_ports(
        &self,
        host_ip: IpAddr,
        ports: Vec<u16>,
        options: ScanOptions,
    ) -> Result<PortScanSession, SetupError> {
        if ports.is_empty() {
            return Err(SetupError::NoPorts);
        }

        let id = self.register_session();
        let cancel = self.session_cancel(id);
        let sessions = Arc::clone(&self.sessions);

        let (port_tx, port_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);

        let result = tokio::spawn(async move {
            let results =
                portscan::scan_host(host_ip, &ports, &options, &cancel, Some(port_tx)).await;
            sessions.lock().expect("session registry poisoned").remove(&id);
            results
        });

        Ok(PortScanSession {
            id,
            ports: port_rx,
            result,
        })
    }

    /// Classify a host record. Pure, no session involved.
    pub fn classify_device(&self, record: &HostRecord) -> DeviceClassification {
        classify::classify(record)
    }

    /// Request cancellation of a session. Returns false when the id is
    /// unknown or the session already completed. Safe to call twice.
    pub fn cancel(&self, session_id: u64) -> bool {
        let cancel = self
            .sessions
            .lock()
            .expect("session registry poisoned")
            .get(&session_id)
            .cloned();
        match cancel {
            Some(state) => {
                info!(session = session_id, "cancellation requested");
                state.cancel();
                true
            }
            None => false,
        }
    }

    /// Discovery methods this process can run, with a privilege check.
    pub async fn available_methods(&self) -> Vec<(DiscoveryMethod, bool)> {
        probe::available_methods().await
    }

    fn register_session(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .insert(id, Arc::new(CancelState::new()));
        id
    }

    fn session_cancel(&self, id: u64) -> Arc<CancelState> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .get(&id)
            .cloned()
            .expect("session registered just above")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_start_discovery_rejects_empty_input() {
        let engine = Engine::new();
        assert!(matches!(
            engine.start_discovery(vec![], vec![DiscoveryMethod::TcpConnect], Default::default()),
            Err(SetupError::NoTargets)
        ));
        assert!(matches!(
            engine.start_discovery(
                vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                vec![],
                Default::default()
            ),
            Err(SetupError::NoMethods)
        ));
    }

    #[test]
    fn test_scan_ports_rejects_empty_ports() {
        let engine = Engine::new();
        assert!(matches!(
            engine.scan_ports(IpAddr::V4(Ipv4Addr::LOCALHOST), vec![], Default::default()),
            Err(SetupError::NoPorts)
        ));
    }

    #[test]
    fn test_cancel_unknown_session_is_false() {
        let engine = Engine::new();
        assert!(!engine.cancel(99));
    }

    #[tokio::test]
    async fn test_port_scan_session_streams_and_resolves() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let engine = Engine::new();
        let options = ScanOptions {
            timeout: Duration::from_millis(500),
            concurrency: 4,
        };
        let mut session = engine
            .scan_ports(IpAddr::V4(Ipv4Addr::LOCALHOST), vec![port], options)
            .unwrap();

        let live = session.ports.recv().await.unwrap();
        assert_eq!(live.port, port);

        let results = session.result.await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].port, port);

        // Registry entry is gone once the session resolves.
        assert!(!engine.cancel(session.id));
    }

    #[tokio::test]
    async fn test_cancelled_discovery_session_resolves() {
        let engine = Engine::new();
        let session = engine
            .start_discovery(
                vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))],
                vec![DiscoveryMethod::TcpConnect],
                ProbeOptions {
                    timeout: Duration::from_millis(100),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(engine.cancel(session.id));
        let table = session.result.await.unwrap();
        assert!(table.records.is_empty());
    }

    #[test]
    fn test_classify_device_delegates() {
        let engine = Engine::new();
        let record = HostRecord::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let result = engine.classify_device(&record);
        assert_eq!(result.confidence, 0.0);
    }
}
