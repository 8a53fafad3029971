//! ICMP and ICMPv6 echo probing via surge-ping.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

use super::{EventSink, ProbeDriver, ProbeOptions};
use crate::cancel::CancelState;
use crate::error::ProbeError;
use crate::types::{DiscoveryEvent, DiscoveryMethod};

/// Echo attempts per host before giving up.
const PING_ATTEMPTS: u16 = 3;

const PING_PAYLOAD: [u8; 56] = [0u8; 56];

/// ICMP echo driver, parameterized over the address family.
pub struct IcmpPingDriver {
    family: ICMP,
}

impl IcmpPingDriver {
    pub fn v4() -> Self {
        Self { family: ICMP::V4 }
    }

    pub fn v6() -> Self {
        Self { family: ICMP::V6 }
    }

    fn wants(&self, ip: &IpAddr) -> bool {
        match self.family {
            ICMP::V4 => ip.is_ipv4(),
            ICMP::V6 => ip.is_ipv6(),
        }
    }
}

#[async_trait]
impl ProbeDriver for IcmpPingDriver {
    fn method(&self) -> DiscoveryMethod {
        match self.family {
            ICMP::V4 => DiscoveryMethod::IcmpPing,
            ICMP::V6 => DiscoveryMethod::Icmpv6Ping,
        }
    }

    fn requires_privileges(&self) -> bool {
        cfg!(target_os = "linux")
    }

    async fn probe(
        &self,
        targets: &[IpAddr],
        options: &ProbeOptions,
        sink: &EventSink,
        cancel: &CancelState,
    ) {
        let started = Instant::now();
        let method = self.method();

        let family_targets: Vec<IpAddr> =
            targets.iter().filter(|ip| self.wants(ip)).copied().collect();
        if family_targets.is_empty() {
            return;
        }

        let config = match self.family {
            ICMP::V4 => Config::default(),
            ICMP::V6 => Config::builder().kind(ICMP::V6).build(),
        };
        let client = match Client::new(&config) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                // One failure event for the whole driver, not per target.
                sink.emit(DiscoveryEvent::failure(
                    method,
                    family_targets[0],
                    ProbeError::PermissionDenied(format!("cannot open ICMP socket: {e}")),
                    started,
                ))
                .await;
                return;
            }
        };

        let timeout_per_ping = options.timeout / u32::from(PING_ATTEMPTS);
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let mut handles = Vec::with_capacity(family_targets.len());

        for (idx, target) in family_targets.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let sem = Arc::clone(&semaphore);
            let client = Arc::clone(&client);

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.ok()?;
                let probe_start = Instant::now();
                let mut pinger = client.pinger(target, PingIdentifier(idx as u16)).await;

                for seq in 0..PING_ATTEMPTS {
                    match timeout(timeout_per_ping, pinger.ping(PingSequence(seq), &PING_PAYLOAD))
                        .await
                    {
                        Ok(Ok(_reply)) => return Some((target, probe_start)),
                        Ok(Err(_)) | Err(_) => continue,
                    }
                }
                None
            }));
        }

        for handle in handles {
            if let Ok(Some((ip, probe_start))) = handle.await {
                sink.emit(DiscoveryEvent::alive(method, ip, probe_start)).await;
            }
        }

        debug!(%method, elapsed_ms = started.elapsed().as_millis() as u64, "echo sweep done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_family_filtering() {
        let v4 = IcmpPingDriver::v4();
        let v6 = IcmpPingDriver::v6();
        let four = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let six = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(v4.wants(&four) && !v4.wants(&six));
        assert!(v6.wants(&six) && !v6.wants(&four));
    }

    #[test]
    fn test_method_names() {
        assert_eq!(IcmpPingDriver::v4().method(), DiscoveryMethod::IcmpPing);
        assert_eq!(IcmpPingDriver::v6().method(), DiscoveryMethod::Icmpv6Ping);
    }

    #[tokio::test]
    async fn test_no_matching_targets_emits_nothing() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let sink = EventSink::new(tx);
        let cancel = CancelState::new();
        let driver = IcmpPingDriver::v6();
        driver
            .probe(
                &[IpAddr::V4(Ipv4Addr::LOCALHOST)],
                &ProbeOptions::default(),
                &sink,
                &cancel,
            )
            .await;
        drop(sink);
        assert!(rx.recv().await.is_none());
    }
}
