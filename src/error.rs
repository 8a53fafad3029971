use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probe-level failure, carried as data on a `DiscoveryEvent`.
///
/// These never abort a discovery run; they degrade the single probe
/// (or driver) that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("protocol parse error: {0}")]
    ProtocolParseError(String),
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    #[error("cancellation requested")]
    CancellationRequested,
}

/// Errors surfaced synchronously before any probing begins.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid target specification: {0}")]
    InvalidTarget(String),
    #[error("no targets specified")]
    NoTargets,
    #[error("no discovery methods selected")]
    NoMethods,
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),
    #[error("no ports specified")]
    NoPorts,
}
