//! Local-network host discovery, port scanning, and device
//! classification.
//!
//! The [`engine::Engine`] is the front door: it starts discovery and
//! port-scan sessions, streams results live, and hands back merged host
//! tables. Probe drivers live under [`probe`], one per discovery
//! method; the [`aggregator`] folds their events into canonical
//! [`types::HostRecord`]s and the [`classify`] rules label each host.

pub mod aggregator;
pub mod cancel;
pub mod classify;
pub mod engine;
pub mod error;
pub mod network;
pub mod orchestrator;
pub mod oui;
pub mod portscan;
pub mod probe;
pub mod types;
