//! /24 subnet discovery.
//!
//! Every usable host address (`.1` to `.254`) is probed on each configured
//! port with a short connect-and-`*IDN?` exchange. Probes run concurrently
//! up to `max_concurrency`, and the whole scan is capped by `scan_budget`:
//! when the budget elapses or the scan is cancelled the stream simply ends,
//! and whatever was found so far is the result.

use crate::limits::{PROBE_TIMEOUT, SCAN_BUDGET, SCAN_CONCURRENCY, SOCKET_PORT, TELNET_PORT};
use crate::transport::{Connection, ProtocolMode};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

/// A device answering on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    /// Host address.
    pub address: IpAddr,
    /// Port that answered.
    pub port: u16,
    /// Framing for that port.
    pub mode: ProtocolMode,
    /// Connect-to-reply time of the probe.
    pub latency: Duration,
    /// `*IDN?` reply, when known.
    pub identity: Option<String>,
}

impl DeviceEndpoint {
    /// An endpoint known without probing.
    #[must_use]
    pub fn new(address: IpAddr, port: u16, mode: ProtocolMode) -> Self {
        Self {
            address,
            port,
            mode,
            latency: Duration::ZERO,
            identity: None,
        }
    }

    /// Address and port together.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.socket_addr(), self.mode)
    }
}

/// A port to probe and the framing it speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePort {
    /// TCP port.
    pub port: u16,
    /// Framing used on it.
    pub mode: ProtocolMode,
}

/// Scan parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// Ports probed on each host, in order.
    pub ports: Vec<ProbePort>,
    /// Bound for one port probe, connect through reply.
    pub per_host_timeout: Duration,
    /// Wall-clock ceiling for the whole scan.
    pub scan_budget: Duration,
    /// Hosts probed at once.
    pub max_concurrency: usize,
    /// Case-insensitive substrings, one of which must appear in the
    /// `*IDN?` reply. Empty accepts any reply.
    pub identity_markers: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ports: vec![
                ProbePort {
                    port: TELNET_PORT,
                    mode: ProtocolMode::Line,
                },
                ProbePort {
                    port: SOCKET_PORT,
                    mode: ProtocolMode::Raw,
                },
            ],
            per_host_timeout: PROBE_TIMEOUT,
            scan_budget: SCAN_BUDGET,
            max_concurrency: SCAN_CONCURRENCY,
            identity_markers: vec!["KEPCO".into(), "BOP".into(), "BIT".into()],
        }
    }
}

/// The 254 usable host addresses of the /24 containing `base`.
pub fn subnet_hosts(base: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
    let [a, b, c, _] = base.octets();
    (1..=254).map(move |d| Ipv4Addr::new(a, b, c, d))
}

/// Restartable scanner for one subnet.
#[derive(Debug, Clone)]
pub struct Scanner {
    base: Ipv4Addr,
    config: Arc<DiscoveryConfig>,
}

impl Scanner {
    /// Scanner for the /24 containing `base`.
    #[must_use]
    pub fn new(base: Ipv4Addr, config: DiscoveryConfig) -> Self {
        Self {
            base,
            config: Arc::new(config),
        }
    }

    /// Subnet base address.
    #[must_use]
    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    /// Start a scan.
    ///
    /// Nothing happens until the stream is polled; the budget clock starts
    /// then. Each call returns an independent scan.
    pub fn scan(&self, cancel: &CancellationToken) -> BoxStream<'static, DeviceEndpoint> {
        let config = Arc::clone(&self.config);
        let budget = config.scan_budget;
        let concurrency = config.max_concurrency.max(1);
        let cancel = cancel.clone();
        let base = self.base;

        let stop = async move {
            tokio::select! {
                _ = tokio::time::sleep(budget) => {
                    tracing::debug!(%base, ?budget, "Scan budget exhausted");
                }
                _ = cancel.cancelled() => {
                    tracing::debug!(%base, "Scan cancelled");
                }
            }
        };

        stream::iter(subnet_hosts(self.base))
            .map(move |ip| {
                let config = Arc::clone(&config);
                async move { probe_host(IpAddr::V4(ip), &config).await }
            })
            .buffer_unordered(concurrency)
            .flat_map(stream::iter)
            .take_until(stop)
            .boxed()
    }

    /// Run a scan to completion and return its endpoints sorted by
    /// address, then port.
    pub async fn collect(&self, cancel: &CancellationToken) -> Vec<DeviceEndpoint> {
        let started = Instant::now();
        let mut found: Vec<DeviceEndpoint> = self.scan(cancel).collect().await;
        found.sort_by_key(|e| (e.address, e.port));
        tracing::info!(
            base = %self.base,
            found = found.len(),
            elapsed = ?started.elapsed(),
            "Subnet scan finished"
        );
        found
    }
}

/// Scan the /24 containing `base`. Shorthand for [`Scanner::scan`].
pub fn scan_subnet(
    base: Ipv4Addr,
    config: DiscoveryConfig,
    cancel: &CancellationToken,
) -> BoxStream<'static, DeviceEndpoint> {
    Scanner::new(base, config).scan(cancel)
}

/// Probe every configured port on one host.
pub async fn probe_host(address: IpAddr, config: &DiscoveryConfig) -> Vec<DeviceEndpoint> {
    let mut found = Vec::new();
    for probe in &config.ports {
        if let Some(endpoint) = probe_port(address, *probe, config).await {
            found.push(endpoint);
        }
    }
    found
}

/// Connect, send `*IDN?`, and accept the reply if it carries a marker.
pub async fn probe_port(
    address: IpAddr,
    probe: ProbePort,
    config: &DiscoveryConfig,
) -> Option<DeviceEndpoint> {
    let started = Instant::now();
    let wait = config.per_host_timeout;

    let exchange = async {
        let stream = TcpStream::connect((address, probe.port)).await.ok()?;
        let _ = stream.set_nodelay(true);
        let mut conn = Connection::from_stream(stream, address.to_string(), probe.port, probe.mode);
        conn.write(b"*IDN?\n").await.ok()?;

        let reply = loop {
            let line = conn.read_line(wait).await.ok()?;
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() && text != "*IDN?" {
                break text;
            }
        };
        conn.close().await;
        Some(reply)
    };

    let identity = timeout(wait, exchange).await.ok().flatten()?;
    if !matches_markers(&identity, &config.identity_markers) {
        tracing::debug!(%address, port = probe.port, reply = %identity, "Not a recognised device");
        return None;
    }

    let latency = started.elapsed();
    tracing::debug!(%address, port = probe.port, ?latency, identity = %identity, "Device found");
    Some(DeviceEndpoint {
        address,
        port: probe.port,
        mode: probe.mode,
        latency,
        identity: Some(identity),
    })
}

fn matches_markers(reply: &str, markers: &[String]) -> bool {
    if markers.is_empty() {
        return true;
    }
    let upper = reply.to_uppercase();
    markers.iter().any(|m| upper.contains(&m.to_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_covers_usable_hosts_only() {
        let hosts: Vec<_> = subnet_hosts(Ipv4Addr::new(192, 168, 50, 77)).collect();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 50, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 50, 254));
    }

    #[test]
    fn markers_match_case_insensitively() {
        let markers = DiscoveryConfig::default().identity_markers;
        assert!(matches_markers("KEPCO,BOP 50-20M,SIM-001,1.5", &markers));
        assert!(matches_markers("kepco inc,bit 802e", &markers));
        assert!(!matches_markers("RIGOL,DP832", &markers));
        assert!(matches_markers("anything", &[]));
    }

    #[test]
    fn endpoint_display() {
        let ep = DeviceEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 5024, ProtocolMode::Line);
        assert_eq!(ep.to_string(), "10.0.0.5:5024 (line)");
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn loopback_config(port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            ports: vec![ProbePort {
                port,
                mode: ProtocolMode::Raw,
            }],
            scan_budget: Duration::from_secs(2),
            ..DiscoveryConfig::default()
        }
    }

    #[tokio::test]
    async fn empty_subnet_yields_nothing() {
        let scanner = Scanner::new(Ipv4Addr::new(127, 0, 0, 0), loopback_config(unused_port()));
        let found = scanner.collect(&CancellationToken::new()).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn cancelled_scan_ends_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scanner = Scanner::new(Ipv4Addr::new(127, 0, 0, 0), loopback_config(unused_port()));

        let started = Instant::now();
        let found = scanner.collect(&cancel).await;
        assert!(found.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
